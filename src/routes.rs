//! Route names and the fixed transition table for the run state machine.
//!
//! A [`Route`] is the name of the next step a run will execute, or one of
//! two sentinels: [`Route::End`] (terminal) and [`Route::TurnitinPause`]
//! (stop executing, await external input). Routes are a closed enum rather
//! than open strings so illegal transitions are unrepresentable at the
//! engine boundary; anything arriving as a string (job payloads, webhook
//! bodies, persisted checkpoints) goes through [`Route::parse`], which is
//! fail-closed: unknown names decode to `None` and callers map that to
//! `End`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a step in the run state machine, or a terminal/pause sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Plan,
    Act,
    Reflect,
    Expand,
    Repair,
    Turnitin,
    /// Stop executing and await external input (a review webhook).
    TurnitinPause,
    /// Terminal marker.
    End,
}

impl Route {
    /// Parse a persisted or caller-supplied route name.
    ///
    /// Matching is case-insensitive (`END` and `end` are equivalent).
    /// Unknown names yield `None`; callers treat that as `End`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Some(Route::Plan),
            "act" => Some(Route::Act),
            "reflect" => Some(Route::Reflect),
            "expand" => Some(Route::Expand),
            "repair" => Some(Route::Repair),
            "turnitin" => Some(Route::Turnitin),
            "turnitin_pause" => Some(Route::TurnitinPause),
            "end" => Some(Route::End),
            _ => None,
        }
    }

    /// Parse with the fail-closed default applied.
    pub fn parse_or_end(s: &str) -> Self {
        Self::parse(s).unwrap_or(Route::End)
    }

    /// Persisted string form, matching the serde encoding.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Plan => "plan",
            Route::Act => "act",
            Route::Reflect => "reflect",
            Route::Expand => "expand",
            Route::Repair => "repair",
            Route::Turnitin => "turnitin",
            Route::TurnitinPause => "turnitin_pause",
            Route::End => "end",
        }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Route::End)
    }

    #[must_use]
    pub fn is_pause(&self) -> bool {
        matches!(self, Route::TurnitinPause)
    }

    /// True for routes a step executor can be dispatched on.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        !matches!(self, Route::End | Route::TurnitinPause)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the next route after `executed` ran and chose `chosen`.
///
/// The table is fixed, not data-driven: `plan` and `act` have single
/// outgoing edges regardless of what the step wrote; `reflect` and
/// `turnitin` read the step's choice restricted to their allowed target
/// sets. A pause is honored from any step. Everything else fails closed
/// to `End`.
pub fn next_route(executed: Route, chosen: Route) -> Route {
    if chosen.is_pause() {
        return Route::TurnitinPause;
    }
    match executed {
        Route::Plan => Route::Act,
        Route::Act => Route::Reflect,
        Route::Reflect => match chosen {
            Route::Plan | Route::Expand | Route::Repair | Route::Turnitin | Route::End => chosen,
            _ => Route::End,
        },
        Route::Turnitin => match chosen {
            Route::Turnitin | Route::Plan | Route::Expand | Route::Repair | Route::End => chosen,
            _ => Route::End,
        },
        Route::Expand => Route::Act,
        Route::Repair => Route::Plan,
        Route::TurnitinPause | Route::End => Route::End,
    }
}
