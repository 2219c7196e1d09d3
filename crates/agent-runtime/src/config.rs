//! Process configuration: environment-variable overrides with hardcoded
//! defaults, read via `env::var(...).unwrap_or_else(...)` at startup.

use std::collections::HashMap;
use std::time::Duration;

/// Exponential backoff policy: `base * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// The Agent Runner's LLM retry policy: 3 attempts, base 5s,
    /// multiplier 3, max 120s. Retried on transport errors, HTTP ≥500,
    /// 408, 429, or messages containing "overloaded"/"rate limit"/"capacity".
    pub fn llm_default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(5),
            multiplier: 3.0,
            max: Duration::from_secs(120),
        }
    }

    /// Retry policy for VCS adapter calls made from inside an agent
    /// invocation. This is the innermost policy and does not compose with
    /// `LLM_RETRY` for that call.
    pub fn github_default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(2),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }

    fn from_env(prefix: &str, default: Self) -> Self {
        let max_attempts = env_parse(&format!("{prefix}_MAX_ATTEMPTS")).unwrap_or(default.max_attempts);
        let base_secs = env_parse(&format!("{prefix}_BASE_SECS")).unwrap_or(default.base.as_secs_f64());
        let multiplier = env_parse(&format!("{prefix}_MULTIPLIER")).unwrap_or(default.multiplier);
        let max_secs = env_parse(&format!("{prefix}_MAX_SECS")).unwrap_or(default.max.as_secs_f64());
        Self {
            max_attempts,
            base: Duration::from_secs_f64(base_secs),
            multiplier,
            max: Duration::from_secs_f64(max_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Per-scope prompt cache TTLs, read from any `PROMPT_CACHE_<SCOPE>`
/// environment variable (seconds), falling back to `PROMPT_CACHE_DEFAULT_TTL_SECS`.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptCacheConfig {
    pub default_ttl: Duration,
    pub scope_ttls: HashMap<String, Duration>,
}

impl PromptCacheConfig {
    pub fn ttl_for(&self, scope: &str) -> Duration {
        self.scope_ttls
            .get(scope)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    fn from_env() -> Self {
        let default_ttl = Duration::from_secs(
            env_parse("PROMPT_CACHE_DEFAULT_TTL_SECS").unwrap_or(300u64),
        );
        let mut scope_ttls = HashMap::new();
        for (key, value) in std::env::vars() {
            let Some(scope) = key
                .strip_prefix("PROMPT_CACHE_")
                .and_then(|s| s.strip_suffix("_TTL_SECS"))
            else {
                continue;
            };
            if scope == "DEFAULT" {
                continue;
            }
            if let Ok(secs) = value.parse::<u64>() {
                scope_ttls.insert(scope.to_lowercase(), Duration::from_secs(secs));
            }
        }
        Self {
            default_ttl,
            scope_ttls,
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// RocksDB store path; `DATABASE_URL`.
    pub database_url: String,
    /// VCS adapter auth token; `GITHUB_TOKEN`.
    pub github_token: Option<String>,
    /// HTTP/webhook/WS listen port; `PORT`, default 3000.
    pub port: u16,
    pub prompt_cache: PromptCacheConfig,
    /// `ENABLE_FLEX_PROCESSING` — relaxes batching/latency tradeoffs for
    /// non-interactive bulk runs.
    pub enable_flex_processing: bool,
    pub llm_retry: RetryPolicy,
    pub github_retry: RetryPolicy,
    /// `maxParallel` — bounded subtask/task concurrency, default 3.
    pub max_parallel: usize,
    /// No-CI grace period: treat "no checks found" as pass after this wait (~20s).
    pub ci_grace_period: Duration,
    /// CI poll interval per cycle, default 60s.
    pub ci_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "./orchestrator-data".to_string()),
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            port: env_parse("PORT").unwrap_or(3000),
            prompt_cache: PromptCacheConfig::from_env(),
            enable_flex_processing: std::env::var("ENABLE_FLEX_PROCESSING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            llm_retry: RetryPolicy::from_env("LLM_RETRY", RetryPolicy::llm_default()),
            github_retry: RetryPolicy::from_env("GITHUB_RETRY", RetryPolicy::github_default()),
            max_parallel: env_parse("MAX_PARALLEL").unwrap_or(3),
            ci_grace_period: Duration::from_secs(env_parse("CI_GRACE_PERIOD_SECS").unwrap_or(20)),
            ci_poll_interval: Duration::from_secs(env_parse("CI_POLL_INTERVAL_SECS").unwrap_or(60)),
        }
    }
}

impl OrchestratorConfig {
    /// Configuration for integration tests: in-memory-ish temp store path,
    /// no VCS token, short CI grace period.
    pub fn test_config(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            github_token: None,
            port: 0,
            prompt_cache: PromptCacheConfig {
                default_ttl: Duration::from_secs(1),
                scope_ttls: HashMap::new(),
            },
            enable_flex_processing: false,
            llm_retry: RetryPolicy {
                max_attempts: 1,
                base: Duration::from_millis(1),
                multiplier: 1.0,
                max: Duration::from_millis(1),
            },
            github_retry: RetryPolicy {
                max_attempts: 1,
                base: Duration::from_millis(1),
                multiplier: 1.0,
                max: Duration::from_millis(1),
            },
            max_parallel: 3,
            ci_grace_period: Duration::from_millis(1),
            ci_poll_interval: Duration::from_millis(1),
        }
    }
}

/// Classifies an error as retryable under the LLM retry policy:
/// transport errors, HTTP ≥500, 408, 429, or messages containing
/// "overloaded"/"rate limit"/"capacity".
pub fn is_retryable_llm_error(status: Option<u16>, message: &str) -> bool {
    if let Some(code) = status {
        if code >= 500 || code == 408 || code == 429 {
            return true;
        }
    }
    let lower = message.to_lowercase();
    status.is_none()
        || lower.contains("overloaded")
        || lower.contains("rate limit")
        || lower.contains("capacity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_default_matches_documented_parameters() {
        let policy = RetryPolicy::llm_default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max, Duration::from_secs(120));
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = RetryPolicy::llm_default();
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(15));
        assert_eq!(policy.backoff(10), Duration::from_secs(120));
    }

    #[test]
    fn retryable_error_classification() {
        assert!(is_retryable_llm_error(Some(503), "internal error"));
        assert!(is_retryable_llm_error(Some(429), "too many requests"));
        assert!(is_retryable_llm_error(Some(200), "server is overloaded"));
        assert!(!is_retryable_llm_error(Some(400), "bad request"));
        assert!(is_retryable_llm_error(None, "connection reset"));
    }

    #[test]
    fn test_config_has_no_real_backoff() {
        let cfg = OrchestratorConfig::test_config("/tmp/x");
        assert_eq!(cfg.max_parallel, 3);
        assert_eq!(cfg.llm_retry.max_attempts, 1);
    }

    #[test]
    fn prompt_cache_falls_back_to_default() {
        std::env::remove_var("PROMPT_CACHE_PLANNER_TTL_SECS");
        let cache = PromptCacheConfig::from_env();
        assert_eq!(cache.ttl_for("planner"), cache.default_ttl);
    }
}
