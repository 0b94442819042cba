use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StorageResult;
use crate::storage::LocalStore;

pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_KEY: &str = "supabase_key";
pub const KEY_WRITE_POLICY: &str = "write_policy";
pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";

pub const KNOWN_KEYS: [&str; 4] = [
    KEY_SUPABASE_URL,
    KEY_SUPABASE_KEY,
    KEY_WRITE_POLICY,
    KEY_REQUEST_TIMEOUT,
];

const URL_ENV: [&str; 2] = ["SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"];
const KEY_ENV: [&str; 2] = ["SUPABASE_ANON_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY"];
const DB_ENV: &str = "OPSDESK_DB";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// What happens to a write the remote backend rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Report the failure and change nothing.
    Strict,
    /// Report the failure, apply the write locally and journal it in the outbox.
    #[default]
    LocalFallback,
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WritePolicy::Strict => f.write_str("strict"),
            WritePolicy::LocalFallback => f.write_str("fallback"),
        }
    }
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(WritePolicy::Strict),
            "fallback" | "local" => Ok(WritePolicy::LocalFallback),
            other => Err(format!(
                "invalid write policy '{}', expected strict or fallback",
                other
            )),
        }
    }
}

/// Settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub force_local: bool,
    pub write_policy: WritePolicy,
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            supabase_url: None,
            supabase_key: None,
            force_local: false,
            write_policy: WritePolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Path of the local store: `--db`, then `OPSDESK_DB`, then `~/.opsdesk.db`.
pub fn db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(DB_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(LocalStore::default_path)
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

impl Settings {
    /// Environment (already seeded from `.env.local` / `.env`) wins over the
    /// `configs` table of the local store.
    pub fn resolve(store: &LocalStore, force_local: bool) -> StorageResult<Self> {
        let env_url = first_env(&URL_ENV);
        let env_key = first_env(&KEY_ENV);
        Self::from_sources(store, env_url, env_key, force_local)
    }

    fn from_sources(
        store: &LocalStore,
        env_url: Option<String>,
        env_key: Option<String>,
        force_local: bool,
    ) -> StorageResult<Self> {
        let supabase_url = match env_url {
            Some(url) => Some(url),
            None => store.get_config(KEY_SUPABASE_URL)?,
        };
        let supabase_key = match env_key {
            Some(key) => Some(key),
            None => store.get_config(KEY_SUPABASE_KEY)?,
        };

        let write_policy = match store.get_config(KEY_WRITE_POLICY)? {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("{}; using {}", e, WritePolicy::default());
                WritePolicy::default()
            }),
            None => WritePolicy::default(),
        };

        let timeout_secs = match store.get_config(KEY_REQUEST_TIMEOUT)? {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                log::warn!(
                    "invalid {} '{}'; using {}s",
                    KEY_REQUEST_TIMEOUT,
                    raw,
                    DEFAULT_TIMEOUT_SECS
                );
                DEFAULT_TIMEOUT_SECS
            }),
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Settings {
            supabase_url,
            supabase_key,
            force_local,
            write_policy,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Rejects values `set` would store but `resolve` could not use.
pub fn validate_value(key: &str, value: &str) -> Result<(), String> {
    match key {
        KEY_WRITE_POLICY => value.parse::<WritePolicy>().map(|_| ()),
        KEY_REQUEST_TIMEOUT => value
            .trim()
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| format!("{} must be a whole number of seconds", key)),
        KEY_SUPABASE_URL | KEY_SUPABASE_KEY => Ok(()),
        other => Err(format!(
            "unknown config key '{}', known keys: {}",
            other,
            KNOWN_KEYS.join(", ")
        )),
    }
}

/// Hides all but the first characters of a credential.
pub fn mask(value: &str) -> String {
    let visible: String = value.chars().take(8).collect();
    if value.chars().count() > 8 {
        format!("{}...", visible)
    } else {
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_wins_over_stored_config() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_config(KEY_SUPABASE_URL, "https://stored.supabase.co").unwrap();
        store.set_config(KEY_SUPABASE_KEY, "stored-key").unwrap();

        let settings = Settings::from_sources(
            &store,
            Some("https://env.supabase.co".to_string()),
            None,
            false,
        )
        .unwrap();

        assert_eq!(settings.supabase_url.as_deref(), Some("https://env.supabase.co"));
        assert_eq!(settings.supabase_key.as_deref(), Some("stored-key"));
    }

    #[test]
    fn bad_stored_values_fall_back_to_defaults() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_config(KEY_WRITE_POLICY, "sometimes").unwrap();
        store.set_config(KEY_REQUEST_TIMEOUT, "soon").unwrap();

        let settings = Settings::from_sources(&store, None, None, true).unwrap();
        assert_eq!(settings.write_policy, WritePolicy::LocalFallback);
        assert_eq!(settings.request_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(settings.force_local);
    }

    #[test]
    fn strict_policy_is_read_from_store() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_config(KEY_WRITE_POLICY, "strict").unwrap();
        let settings = Settings::from_sources(&store, None, None, false).unwrap();
        assert_eq!(settings.write_policy, WritePolicy::Strict);
    }

    #[test]
    fn validate_value_rejects_unknown_keys() {
        assert!(validate_value("write_policy", "strict").is_ok());
        assert!(validate_value("request_timeout_secs", "abc").is_err());
        assert!(validate_value("theme", "dark").is_err());
    }

    #[test]
    fn mask_keeps_prefix_only() {
        assert_eq!(mask("eyJhbGciOiJIUzI1NiJ9"), "eyJhbGci...");
        assert_eq!(mask("short"), "short");
    }
}
