//! Orchestrator configuration with env overlay.

use std::time::Duration;

/// Tunables for the engine, scheduler, and review policy.
///
/// `Default` gives sane offline values; [`OrchestratorConfig::from_env`]
/// overlays `RUNLOOM_*` environment variables (loading `.env` via dotenvy
/// first), matching how the surrounding app configures workers.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Per-run token ceiling, seeded onto fresh runs.
    pub budget_tokens: u64,
    /// Per-run wall-clock ceiling in seconds, measured from run creation.
    pub budget_seconds: f64,
    /// Optional per-run USD ceiling.
    pub budget_usd: Option<f64>,
    /// Maximum jobs simultaneously `running` per user.
    pub user_concurrency_cap: i64,
    /// Worker sleep between empty polls.
    pub poll_interval: Duration,
    /// Base delay for the requeue backoff (`base × 2^min(attempts,5)`).
    pub retry_base: Duration,
    /// Ceiling on the requeue backoff delay.
    pub retry_cap: Duration,
    /// Attempts after which a job is marked `failed` instead of requeued.
    pub max_attempts: i64,
    /// Transitions executed per claim before the job is requeued.
    pub max_steps_per_turn: u32,
    /// Lease after which a `running` job is considered abandoned.
    pub running_lease: Duration,
    /// Global similarity-review policy; `None` means no review unless the
    /// task spec asks for one.
    pub default_target_similarity: Option<f64>,
    /// Bounded attempts for collaborator calls before the deterministic
    /// fallback engages.
    pub provider_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 60_000,
            budget_seconds: 900.0,
            budget_usd: None,
            user_concurrency_cap: 2,
            poll_interval: Duration::from_secs(2),
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(300),
            max_attempts: 8,
            max_steps_per_turn: 4,
            running_lease: Duration::from_secs(900),
            default_target_similarity: None,
            provider_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `RUNLOOM_*` environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u64>("RUNLOOM_BUDGET_TOKENS") {
            cfg.budget_tokens = v;
        }
        if let Some(v) = env_parse::<f64>("RUNLOOM_BUDGET_SECONDS") {
            cfg.budget_seconds = v;
        }
        if let Some(v) = env_parse::<f64>("RUNLOOM_BUDGET_USD") {
            cfg.budget_usd = Some(v);
        }
        if let Some(v) = env_parse::<i64>("RUNLOOM_USER_CONCURRENCY_CAP") {
            cfg.user_concurrency_cap = v;
        }
        if let Some(v) = env_parse::<u64>("RUNLOOM_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RUNLOOM_RETRY_BASE_SECS") {
            cfg.retry_base = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<i64>("RUNLOOM_MAX_ATTEMPTS") {
            cfg.max_attempts = v;
        }
        if let Some(v) = env_parse::<u32>("RUNLOOM_MAX_STEPS_PER_TURN") {
            cfg.max_steps_per_turn = v;
        }
        if let Some(v) = env_parse::<u64>("RUNLOOM_RUNNING_LEASE_SECS") {
            cfg.running_lease = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<f64>("RUNLOOM_TARGET_SIMILARITY") {
            cfg.default_target_similarity = Some(v);
        }
        cfg
    }

    /// Backoff delay before a job's next claim after `attempts` failures.
    pub fn backoff_delay(&self, attempts: i64) -> Duration {
        let exp = attempts.clamp(0, 5) as u32;
        let raw = self.retry_base.saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.retry_cap)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(cfg.backoff_delay(5), Duration::from_secs(160));
        // exponent saturates at 5, then the cap bites
        assert_eq!(cfg.backoff_delay(40), Duration::from_secs(160));
        let tight = OrchestratorConfig {
            retry_cap: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        };
        assert_eq!(tight.backoff_delay(5), Duration::from_secs(60));
    }
}
