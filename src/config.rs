use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limit::RateLimitConfig;

/// Limits enforced on submitted content.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum comment text length in characters.
    pub max_text_len: usize,
    pub max_author_len: usize,
    /// Salt for the public author hash.
    pub hash_salt: String,
    /// Derive client identity from proxy headers (spoofable unless the edge filters them).
    pub trust_proxy: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_text_len: 1000, max_author_len: 64, hash_salt: "smudge".into(), trust_proxy: true }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub isso_url: Option<String>,
    pub isso_timeout: Duration,
    pub limits: Limits,
    pub rate_limit: RateLimitConfig,
    pub rate_limit_enabled: bool,
    pub rate_limit_max_tracked: usize,
    pub cors_origins: Vec<String>,
    pub enable_hsts: bool,
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_str(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env_str(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(default)
}

impl AppConfig {
    /// Read configuration from the environment. Unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Limits::default();
        Self {
            bind_addr: env_str("SMUDGE_BIND").unwrap_or_else(|| "127.0.0.1:5000".into()),
            data_dir: env_str("SMUDGE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data")),
            database_url: env_str("DATABASE_URL"),
            isso_url: env_str("ISSO_URL"),
            isso_timeout: Duration::from_millis(env_parse("ISSO_TIMEOUT_MS", 5000)),
            limits: Limits {
                max_text_len: env_parse("SMUDGE_MAX_TEXT_LEN", defaults.max_text_len),
                max_author_len: env_parse("SMUDGE_MAX_AUTHOR_LEN", defaults.max_author_len),
                hash_salt: env_str("SMUDGE_HASH_SALT").unwrap_or(defaults.hash_salt),
                trust_proxy: env_bool("SMUDGE_TRUST_PROXY", defaults.trust_proxy),
            },
            rate_limit: RateLimitConfig::from_env(),
            rate_limit_enabled: env_bool("RL_ENABLED", true),
            rate_limit_max_tracked: env_parse("RL_MAX_TRACKED", 10_000),
            cors_origins: env_str("SMUDGE_CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            enable_hsts: env_bool("ENABLE_HSTS", false),
        }
    }

    /// Problems that make the service unusable as configured.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.limits.max_text_len == 0 {
            problems.push("SMUDGE_MAX_TEXT_LEN must be greater than 0".to_string());
        }
        if self.isso_timeout.is_zero() {
            problems.push("ISSO_TIMEOUT_MS must be greater than 0".to_string());
        }
        if self.rate_limit_enabled && (self.rate_limit.anon_limit == 0 || self.rate_limit.index_limit == 0) {
            problems.push("rate limits must be at least 1 (set RL_ENABLED=false to disable)".to_string());
        }
        if let Some(url) = &self.isso_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                problems.push(format!("ISSO_URL must be an http(s) URL, got '{url}'"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn defaults_when_env_unset() {
        for var in ["SMUDGE_MAX_TEXT_LEN", "ISSO_URL", "ISSO_TIMEOUT_MS", "RL_ANON_LIMIT", "RL_INDEX_LIMIT"] {
            std::env::remove_var(var);
        }
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.limits.max_text_len, 1000);
        assert_eq!(cfg.isso_url, None);
        assert_eq!(cfg.isso_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rate_limit.anon_limit, 5);
        assert_eq!(cfg.rate_limit.index_limit, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn garbage_values_fall_back_and_bad_url_is_reported() {
        std::env::set_var("SMUDGE_MAX_TEXT_LEN", "lots");
        std::env::set_var("ISSO_URL", "ftp://isso");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.limits.max_text_len, 1000);
        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("ISSO_URL")));
        std::env::remove_var("SMUDGE_MAX_TEXT_LEN");
        std::env::remove_var("ISSO_URL");
    }

    #[test]
    #[serial_test::serial]
    fn every_problem_is_reported_at_once() {
        let mut cfg = AppConfig::from_env();
        cfg.rate_limit_enabled = false;
        cfg.limits.max_text_len = 0;
        cfg.isso_timeout = Duration::ZERO;
        cfg.isso_url = Some("isso.local".into());
        let problems = cfg.validate().unwrap_err();
        assert_eq!(problems.len(), 3, "{problems:?}");

        cfg.limits.max_text_len = 1;
        cfg.isso_timeout = Duration::from_millis(1);
        cfg.isso_url = Some("https://isso.local".into());
        assert_eq!(cfg.validate(), Ok(()));
    }
}
