//! Run state: the unit of work the engine executes and the checkpoint
//! store persists.
//!
//! A [`RunState`] is the sole source of truth for resumption. No in-memory
//! state survives a process boundary: every resumed execution reloads the
//! full struct from the checkpoint store, and step executors are pure
//! `RunState → RunState` functions dispatched by the engine.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routes::Route;

/// Kind of a planned step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Research,
    Write,
    Evaluate,
}

/// One entry in a run's ordered plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub kind: StepKind,
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

/// The most recent step's output and the sources it drew on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub output: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Full state of one run. Serialized as the checkpoint payload.
///
/// Budget totals are monotonically non-decreasing within a run;
/// `started_at` anchors the wall-clock budget (elapsed time is measured
/// from run creation, persisted here so it survives restarts).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    /// Free-form goal/spec map supplied by the caller.
    #[serde(default)]
    pub task: FxHashMap<String, Value>,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    /// Ordered human-readable annotations appended by steps.
    #[serde(default)]
    pub notes: Vec<String>,
    pub route: Route,
    #[serde(default)]
    pub last_observation: Option<Observation>,
    #[serde(default)]
    pub budget_tokens: u64,
    #[serde(default)]
    pub budget_seconds: f64,
    #[serde(default)]
    pub budget_usd: f64,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh run positioned at the initial `plan` route with zeroed budgets.
    pub fn new(run_id: impl Into<String>, task: FxHashMap<String, Value>) -> Self {
        Self {
            run_id: run_id.into(),
            task,
            plan: Vec::new(),
            notes: Vec::new(),
            route: Route::Plan,
            last_observation: None,
            budget_tokens: 0,
            budget_seconds: 0.0,
            budget_usd: 0.0,
            started_at: Utc::now(),
        }
    }

    pub fn builder(run_id: impl Into<String>) -> RunStateBuilder {
        RunStateBuilder {
            state: Self::new(run_id, FxHashMap::default()),
        }
    }

    /// The task's goal text, if any.
    pub fn goal(&self) -> Option<&str> {
        self.task.get("goal").and_then(Value::as_str)
    }

    /// Target similarity requested by the task spec, if any.
    pub fn task_target_similarity(&self) -> Option<f64> {
        self.task.get("target_similarity").and_then(Value::as_f64)
    }

    /// First plan step not yet marked done.
    pub fn next_pending_step(&self) -> Option<&PlanStep> {
        self.plan.iter().find(|s| !s.done)
    }

    pub fn note(&mut self, text: impl Into<String>) {
        self.notes.push(text.into());
    }
}

/// Fluent construction for tests and API seeding.
pub struct RunStateBuilder {
    state: RunState,
}

impl RunStateBuilder {
    #[must_use]
    pub fn with_goal(mut self, goal: &str) -> Self {
        self.state
            .task
            .insert("goal".to_string(), Value::String(goal.to_string()));
        self
    }

    #[must_use]
    pub fn with_task_entry(mut self, key: &str, value: Value) -> Self {
        self.state.task.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.state.route = route;
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: Vec<PlanStep>) -> Self {
        self.state.plan = plan;
        self
    }

    pub fn build(self) -> RunState {
        self.state
    }
}

/// Reduced read-only view of a run, returned by the snapshot API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub task: FxHashMap<String, Value>,
    pub route: Route,
    pub plan: Vec<PlanStep>,
    pub budget_tokens: u64,
    pub budget_seconds: f64,
    pub budget_usd: f64,
    pub last_observation: Option<Observation>,
    pub notes: Vec<String>,
}

impl From<&RunState> for RunSnapshot {
    fn from(s: &RunState) -> Self {
        Self {
            run_id: s.run_id.clone(),
            task: s.task.clone(),
            route: s.route,
            plan: s.plan.clone(),
            budget_tokens: s.budget_tokens,
            budget_seconds: s.budget_seconds,
            budget_usd: s.budget_usd,
            last_observation: s.last_observation.clone(),
            notes: s.notes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_roundtrip_preserves_resumption_fields() {
        let mut state = RunState::builder("run-1")
            .with_goal("ocean acidification")
            .with_task_entry("target_similarity", serde_json::json!(0.15))
            .with_route(Route::Reflect)
            .build();
        state.plan.push(PlanStep {
            id: "s1".into(),
            kind: StepKind::Research,
            description: "gather sources".into(),
            done: true,
        });
        state.budget_tokens = 412;
        state.last_observation = Some(Observation {
            output: "summary".into(),
            sources: vec!["chunk-a".into()],
        });

        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.task_target_similarity(), Some(0.15));
    }

    #[test]
    fn next_pending_step_skips_done() {
        let state = RunState::builder("run-2")
            .with_plan(vec![
                PlanStep {
                    id: "a".into(),
                    kind: StepKind::Research,
                    description: "done already".into(),
                    done: true,
                },
                PlanStep {
                    id: "b".into(),
                    kind: StepKind::Write,
                    description: "pending".into(),
                    done: false,
                },
            ])
            .build();
        assert_eq!(state.next_pending_step().unwrap().id, "b");
    }
}
