//! The six step executors and the registry that wires them.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::hitl::TurnitinCoordinator;
use crate::providers::{ChatMessage, Snippet};
use crate::routes::Route;
use crate::state::{Observation, PlanStep, RunState, StepKind};

use super::{StepContext, StepExecutor, StepOutcome};

const MAX_PLAN_STEPS: usize = 3;
const SEARCH_CHUNKS: usize = 3;

/// Explicit executor registry, constructed once at startup and injected
/// into the engine.
pub struct StepRegistry {
    executors: FxHashMap<Route, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// The standard six-step wiring.
    pub fn standard(coordinator: Arc<TurnitinCoordinator>) -> Self {
        let mut executors: FxHashMap<Route, Arc<dyn StepExecutor>> = FxHashMap::default();
        executors.insert(Route::Plan, Arc::new(Planner));
        executors.insert(Route::Act, Arc::new(Actor));
        executors.insert(
            Route::Reflect,
            Arc::new(Critic {
                coordinator: coordinator.clone(),
            }),
        );
        executors.insert(Route::Expand, Arc::new(Researcher));
        executors.insert(Route::Repair, Arc::new(SelfDebugger));
        executors.insert(Route::Turnitin, Arc::new(TurnitinHandoff { coordinator }));
        Self { executors }
    }

    pub fn executor_for(&self, route: Route) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&route)
    }
}

/// Shape the planner asks the completion seam to produce.
#[derive(Deserialize)]
struct RawPlanStep {
    #[serde(default)]
    id: Option<String>,
    kind: String,
    description: String,
}

/// Plan: ask for 1-3 steps as JSON; fall back to a single research step on
/// malformed or empty output. Always routes to `act`.
struct Planner;

#[async_trait]
impl StepExecutor for Planner {
    fn role(&self) -> &'static str {
        "planner"
    }

    async fn run(&self, mut state: RunState, ctx: &StepContext) -> StepOutcome {
        if state.plan.is_empty() {
            let goal = state.goal().unwrap_or("the task").to_string();
            let raw = ctx
                .complete(&[
                    ChatMessage::system(
                        "You are a planner. Reply with only a JSON array of 1 to 3 steps, \
                         each {\"id\", \"kind\", \"description\"} with kind one of \
                         research, write, evaluate.",
                    ),
                    ChatMessage::user(format!("Goal: {goal}")),
                ])
                .await;

            state.plan = parse_plan(&raw).unwrap_or_else(|| {
                debug!(run_id = %state.run_id, "plan output unusable, using default research step");
                vec![PlanStep {
                    id: "step-1".into(),
                    kind: StepKind::Research,
                    description: format!("research: {goal}"),
                    done: false,
                }]
            });
            state.note(format!("planned {} step(s)", state.plan.len()));
        }
        state.route = Route::Act;
        StepOutcome::Ran(state)
    }
}

fn parse_plan(raw: &str) -> Option<Vec<PlanStep>> {
    let parsed: Vec<RawPlanStep> = serde_json::from_str(raw.trim()).ok()?;
    let steps: Vec<PlanStep> = parsed
        .into_iter()
        .take(MAX_PLAN_STEPS)
        .enumerate()
        .filter_map(|(i, raw)| {
            let kind = match raw.kind.as_str() {
                "research" => StepKind::Research,
                "write" => StepKind::Write,
                "evaluate" => StepKind::Evaluate,
                _ => return None,
            };
            Some(PlanStep {
                id: raw.id.unwrap_or_else(|| format!("step-{}", i + 1)),
                kind,
                description: raw.description,
                done: false,
            })
        })
        .collect();
    if steps.is_empty() { None } else { Some(steps) }
}

/// Act: execute the first pending plan step. Research steps consult the
/// index first and fall back to a live search whose chunks are appended to
/// the index. Routes to `reflect`.
struct Actor;

#[async_trait]
impl StepExecutor for Actor {
    fn role(&self) -> &'static str {
        "executor"
    }

    async fn run(&self, mut state: RunState, ctx: &StepContext) -> StepOutcome {
        let Some(pending) = state.plan.iter().position(|s| !s.done) else {
            // Nothing left: fallback completion, carrying forward the
            // previous observation's sources so the critic still sees what
            // the run gathered.
            let sources = state
                .last_observation
                .as_ref()
                .map(|o| o.sources.clone())
                .unwrap_or_default();
            let output = ctx
                .complete(&[ChatMessage::user(
                    "All planned steps are complete. Summarize the result briefly.",
                )])
                .await;
            state.last_observation = Some(Observation { output, sources });
            state.route = Route::Reflect;
            return StepOutcome::Ran(state);
        };

        let step = state.plan[pending].clone();
        let mut sources = Vec::new();

        if step.kind == StepKind::Research {
            let mut hits = ctx.search_query(&step.description, SEARCH_CHUNKS).await;
            if hits.is_empty() {
                hits = ctx.search_live(&step.description, SEARCH_CHUNKS).await;
                if !hits.is_empty() {
                    if let Err(e) = ctx.search.upsert(&hits).await {
                        warn!(error = %e, "failed to index live search results");
                    }
                }
            }
            sources = hits.iter().map(|s| s.source.clone()).collect();
            state.note(format!(
                "research '{}' gathered {} chunk(s)",
                step.id,
                hits.len()
            ));
        }

        let output = ctx
            .complete(&[
                ChatMessage::system("Carry out the given step and reply with the result."),
                ChatMessage::user(step.description.clone()),
            ])
            .await;

        state.plan[pending].done = true;
        state.last_observation = Some(Observation { output, sources });
        state.route = Route::Reflect;
        StepOutcome::Ran(state)
    }
}

/// Reflect: with sources in hand, either finish the run or hand off for
/// similarity review; without sources, go back to planning.
struct Critic {
    coordinator: Arc<TurnitinCoordinator>,
}

#[async_trait]
impl StepExecutor for Critic {
    fn role(&self) -> &'static str {
        "critic"
    }

    async fn run(&self, mut state: RunState, _ctx: &StepContext) -> StepOutcome {
        let has_sources = state
            .last_observation
            .as_ref()
            .is_some_and(|o| !o.sources.is_empty());

        if !has_sources {
            state.route = Route::Plan;
            return StepOutcome::Ran(state);
        }

        let Some(target) = self.coordinator.target_for(&state) else {
            // No similarity-review policy configured anywhere.
            state.route = Route::End;
            return StepOutcome::Ran(state);
        };

        let ready = match self.coordinator.latest_ready_cycle(&state.run_id).await {
            Ok(cycle) => cycle,
            Err(e) => {
                warn!(error = %e, "cycle lookup failed, requesting review");
                None
            }
        };
        let passed = ready
            .and_then(|c| c.observed_similarity)
            .is_some_and(|observed| observed <= target);

        if passed {
            state.note(format!("similarity review passed (target {target})"));
            state.route = Route::End;
        } else {
            state.route = Route::Turnitin;
        }
        StepOutcome::Ran(state)
    }
}

/// Expand: live-search the task goal, grow the index, record sources,
/// route to `act`.
struct Researcher;

#[async_trait]
impl StepExecutor for Researcher {
    fn role(&self) -> &'static str {
        "researcher"
    }

    async fn run(&self, mut state: RunState, ctx: &StepContext) -> StepOutcome {
        let goal = state.goal().unwrap_or("the task").to_string();
        let hits: Vec<Snippet> = ctx.search_live(&goal, SEARCH_CHUNKS).await;
        if !hits.is_empty() {
            if let Err(e) = ctx.search.upsert(&hits).await {
                warn!(error = %e, "failed to index expanded results");
            }
        }
        let sources: Vec<String> = hits.iter().map(|s| s.source.clone()).collect();
        state.note(format!("expanded corpus with {} chunk(s)", sources.len()));
        state.last_observation = Some(Observation {
            output: format!("expanded sources for: {goal}"),
            sources,
        });
        state.route = Route::Act;
        StepOutcome::Ran(state)
    }
}

/// Repair: stub. Not yet built; routes back to `plan` and says so.
struct SelfDebugger;

#[async_trait]
impl StepExecutor for SelfDebugger {
    fn role(&self) -> &'static str {
        "repair"
    }

    async fn run(&self, mut state: RunState, _ctx: &StepContext) -> StepOutcome {
        state.route = Route::Plan;
        StepOutcome::NotImplemented(state)
    }
}

/// Turnitin handoff: delegate to the coordinator, which pauses the run.
struct TurnitinHandoff {
    coordinator: Arc<TurnitinCoordinator>,
}

#[async_trait]
impl StepExecutor for TurnitinHandoff {
    fn role(&self) -> &'static str {
        "turnitin"
    }

    async fn run(&self, state: RunState, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::Ran(self.coordinator.handoff(state).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_caps_and_filters() {
        let raw = r#"[
            {"id":"a","kind":"research","description":"find sources"},
            {"kind":"write","description":"draft"},
            {"kind":"dance","description":"not a kind"},
            {"kind":"evaluate","description":"check"},
            {"kind":"research","description":"beyond the cap"}
        ]"#;
        let steps = parse_plan(raw).unwrap();
        // cap applies before filtering, so the invalid third entry costs a slot
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "a");
        assert_eq!(steps[1].id, "step-2");
        assert_eq!(steps[1].kind, StepKind::Write);
    }

    #[test]
    fn plan_parsing_rejects_garbage() {
        assert!(parse_plan("not json at all").is_none());
        assert!(parse_plan("[]").is_none());
        assert!(parse_plan(r#"[{"kind":"dance","description":"x"}]"#).is_none());
    }
}
