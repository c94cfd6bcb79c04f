//! Runtime configuration.
//!
//! Each key is read from the process environment first, then from the OS
//! credential store. Missing connection settings are a fatal [`Error::Config`].

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::diagnostics;
use crate::error::{Error, Result};
use crate::storage;
use crate::tracker::TrackerConfig;

pub const DEFAULT_SIGNAL_DEADLINE: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

const ENV_URL: [&str; 2] = ["WILD_BEANS_SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"];
const ENV_ANON_KEY: [&str; 2] = ["WILD_BEANS_SUPABASE_ANON_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY"];
const ENV_ADMIN_SECRET: [&str; 2] = ["WILD_BEANS_ADMIN_SECRET", "NEXT_PUBLIC_ADMIN_SECRET"];
const ENV_POLL_MS: &str = "WILD_BEANS_POLL_MS";
const ENV_DEADLINE_MS: &str = "WILD_BEANS_SIGNAL_DEADLINE_MS";
const ENV_LOG_DIR: &str = "WILD_BEANS_LOG_DIR";

#[derive(Clone)]
pub struct Config {
    pub supabase_url: String,
    pub anon_key: String,
    /// Plain text or a bcrypt hash.
    pub admin_secret: Option<String>,
    pub signal_deadline: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub log_dir: PathBuf,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("supabase_url", &self.supabase_url)
            .field("admin_secret", &self.admin_secret.as_ref().map(|_| "<set>"))
            .field("signal_deadline", &self.signal_deadline)
            .field("poll_interval", &self.poll_interval)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), storage::get_credential)
    }

    /// Resolve from an environment lookup and a credential-store lookup.
    pub fn resolve<E, S>(env: E, stored: S) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
        S: Fn(&str) -> Option<String>,
    {
        let lookup = |names: &[&str], store_key: &str| {
            names
                .iter()
                .find_map(|name| non_empty(env(*name)))
                .or_else(|| non_empty(stored(store_key)))
        };

        let url = lookup(&ENV_URL[..], storage::KEY_SUPABASE_URL);
        let anon_key = lookup(&ENV_ANON_KEY[..], storage::KEY_SUPABASE_ANON_KEY);
        let (Some(url), Some(anon_key)) = (url.as_ref(), anon_key.as_ref()) else {
            let mark = |present: bool| if present { "✓" } else { "✗" };
            return Err(Error::Config(format!(
                "Missing configuration: {} {}, {} {}",
                ENV_URL[0],
                mark(url.is_some()),
                ENV_ANON_KEY[0],
                mark(anon_key.is_some()),
            )));
        };

        let signal_deadline = duration_ms(env(ENV_DEADLINE_MS), ENV_DEADLINE_MS)
            .unwrap_or(DEFAULT_SIGNAL_DEADLINE);
        let poll_interval = duration_ms(env(ENV_POLL_MS), ENV_POLL_MS)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
            .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        let log_dir = non_empty(env(ENV_LOG_DIR))
            .map(PathBuf::from)
            .unwrap_or_else(diagnostics::get_log_dir);

        let config = Self {
            supabase_url: normalize_supabase_url(url),
            anon_key: anon_key.clone(),
            admin_secret: lookup(&ENV_ADMIN_SECRET[..], storage::KEY_ADMIN_SECRET),
            signal_deadline,
            poll_interval,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            log_dir,
        };
        debug!(?config, "configuration resolved");
        Ok(config)
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            signal_deadline: self.signal_deadline,
            poll_interval: self.poll_interval,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(url: &str) -> Self {
        Self {
            supabase_url: normalize_supabase_url(url),
            anon_key: "anon".to_string(),
            admin_secret: None,
            signal_deadline: DEFAULT_SIGNAL_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            log_dir: std::env::temp_dir(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn duration_ms(raw: Option<String>, name: &str) -> Option<Duration> {
    let raw = non_empty(raw)?;
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(key = name, value = %raw, "ignoring invalid duration");
            None
        }
    }
}

/// Normalise the project URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_supabase_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/rest/v1").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn normalises_project_urls() {
        assert_eq!(
            normalize_supabase_url("demo.supabase.co/rest/v1/"),
            "https://demo.supabase.co"
        );
        assert_eq!(
            normalize_supabase_url(" localhost:54321/ "),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_supabase_url("https://demo.supabase.co"),
            "https://demo.supabase.co"
        );
    }

    #[test]
    fn environment_wins_over_credential_store() {
        let env = table(&[
            ("NEXT_PUBLIC_SUPABASE_URL", "https://env.supabase.co"),
            ("WILD_BEANS_SUPABASE_ANON_KEY", "env-key"),
        ]);
        let stored = table(&[
            ("supabase_url", "https://stored.supabase.co"),
            ("supabase_anon_key", "stored-key"),
            ("admin_secret", "stored-secret"),
        ]);
        let config = Config::resolve(|k| env.get(k).cloned(), |k| stored.get(k).cloned())
            .expect("config resolves");
        assert_eq!(config.supabase_url, "https://env.supabase.co");
        assert_eq!(config.anon_key, "env-key");
        assert_eq!(config.admin_secret.as_deref(), Some("stored-secret"));
        assert_eq!(config.signal_deadline, DEFAULT_SIGNAL_DEADLINE);
    }

    #[test]
    fn missing_keys_are_reported_by_name() {
        let env = table(&[("WILD_BEANS_SUPABASE_URL", "https://x.supabase.co")]);
        let err = Config::resolve(|k| env.get(k).cloned(), |_| None).unwrap_err();
        assert!(err.is_fatal());
        let text = err.to_string();
        assert!(text.contains("WILD_BEANS_SUPABASE_URL ✓"));
        assert!(text.contains("WILD_BEANS_SUPABASE_ANON_KEY ✗"));
    }

    #[test]
    fn poll_interval_is_clamped() {
        let env = table(&[
            ("WILD_BEANS_SUPABASE_URL", "https://x.supabase.co"),
            ("WILD_BEANS_SUPABASE_ANON_KEY", "k"),
            ("WILD_BEANS_POLL_MS", "60000"),
            ("WILD_BEANS_SIGNAL_DEADLINE_MS", "abc"),
        ]);
        let config = Config::resolve(|k| env.get(k).cloned(), |_| None).expect("config");
        assert_eq!(config.poll_interval, MAX_POLL_INTERVAL);
        assert_eq!(config.signal_deadline, DEFAULT_SIGNAL_DEADLINE);
    }

    #[test]
    #[serial]
    fn load_reads_process_environment() {
        std::env::set_var("WILD_BEANS_SUPABASE_URL", "demo.supabase.co");
        std::env::set_var("WILD_BEANS_SUPABASE_ANON_KEY", "anon");
        std::env::set_var("WILD_BEANS_ADMIN_SECRET", "letmein");
        std::env::set_var("WILD_BEANS_POLL_MS", "500");

        let config = Config::load().expect("config from env");

        std::env::remove_var("WILD_BEANS_SUPABASE_URL");
        std::env::remove_var("WILD_BEANS_SUPABASE_ANON_KEY");
        std::env::remove_var("WILD_BEANS_ADMIN_SECRET");
        std::env::remove_var("WILD_BEANS_POLL_MS");

        assert_eq!(config.supabase_url, "https://demo.supabase.co");
        assert_eq!(config.admin_secret.as_deref(), Some("letmein"));
        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL);
    }
}
