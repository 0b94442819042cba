use reqwest::Url;
use std::fmt;
use std::sync::Arc;

use super::{BackendKind, LocalStore, RemoteStore, Storage};
use crate::config::{Settings, WritePolicy};

const PLACEHOLDER_URL: &str = "your_supabase_project_url_here";
const PLACEHOLDER_KEY: &str = "your_supabase_anon_key_here";
const MIN_KEY_LEN: usize = 20;

/// Why the session ended up on its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionReason {
    Remote,
    ForcedLocal,
    MissingConfig,
    InvalidConfig(String),
    Unreachable(String),
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::Remote => write!(f, "remote backend configured and reachable"),
            SelectionReason::ForcedLocal => write!(f, "local mode requested"),
            SelectionReason::MissingConfig => write!(f, "no remote backend configured"),
            SelectionReason::InvalidConfig(why) => write!(f, "remote config rejected: {}", why),
            SelectionReason::Unreachable(why) => write!(f, "remote backend unreachable: {}", why),
        }
    }
}

/// The backend chosen for this session, passed explicitly to controllers.
///
/// `local` is always available: it is the primary backend in local mode and
/// the fallback target (plus outbox) in remote mode.
pub struct StorageContext {
    pub primary: Arc<dyn Storage>,
    pub local: Arc<LocalStore>,
    pub reason: SelectionReason,
    pub write_policy: WritePolicy,
}

impl StorageContext {
    pub fn local_only(local: Arc<LocalStore>, reason: SelectionReason) -> Self {
        StorageContext {
            primary: local.clone(),
            local,
            reason,
            write_policy: WritePolicy::Strict,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.primary.kind()
    }

    pub fn is_remote(&self) -> bool {
        self.kind() == BackendKind::Remote
    }
}

/// Shape check on the remote credentials; says nothing about whether they work.
pub fn has_valid_remote_config(url: Option<&str>, key: Option<&str>) -> Result<(), SelectionReason> {
    let (url, key) = match (url, key) {
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => (url, key),
        _ => return Err(SelectionReason::MissingConfig),
    };

    if url == PLACEHOLDER_URL || key == PLACEHOLDER_KEY {
        return Err(SelectionReason::InvalidConfig(
            "placeholder values still in place".to_string(),
        ));
    }
    if !url.starts_with("https://") {
        return Err(SelectionReason::InvalidConfig(
            "URL must start with https://".to_string(),
        ));
    }
    if Url::parse(url).is_err() {
        return Err(SelectionReason::InvalidConfig(format!(
            "'{}' is not a valid URL",
            url
        )));
    }
    if key.chars().count() <= MIN_KEY_LEN {
        return Err(SelectionReason::InvalidConfig(format!(
            "API key must be longer than {} characters",
            MIN_KEY_LEN
        )));
    }
    Ok(())
}

/// Picks the backend for the whole session. Never re-evaluated afterwards.
pub async fn select_backend(settings: &Settings, local: Arc<LocalStore>) -> StorageContext {
    if settings.force_local {
        return StorageContext::local_only(local, SelectionReason::ForcedLocal);
    }

    let url = settings.supabase_url.as_deref();
    let key = settings.supabase_key.as_deref();
    if let Err(reason) = has_valid_remote_config(url, key) {
        log::info!("Using local store: {}", reason);
        return StorageContext::local_only(local, reason);
    }

    let (url, key) = (url.unwrap_or_default(), key.unwrap_or_default());
    let remote = match RemoteStore::new(url, key, settings.request_timeout) {
        Ok(remote) => remote,
        Err(e) => {
            let reason = SelectionReason::InvalidConfig(e.to_string());
            log::warn!("Using local store: {}", reason);
            return StorageContext::local_only(local, reason);
        }
    };

    connect(remote, settings.write_policy, local).await
}

/// Second half of selection: the remote is only used if it answers a ping.
async fn connect(
    remote: RemoteStore,
    write_policy: WritePolicy,
    local: Arc<LocalStore>,
) -> StorageContext {
    match remote.ping().await {
        Ok(()) => {
            log::info!("Using remote backend at {}", remote.base_url());
            StorageContext {
                primary: Arc::new(remote),
                local,
                reason: SelectionReason::Remote,
                write_policy,
            }
        }
        Err(e) => {
            let reason = SelectionReason::Unreachable(e.to_string());
            log::warn!("Using local store: {}", reason);
            StorageContext::local_only(local, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fake;
    use std::time::Duration;

    const KEY: &str = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9";

    #[test]
    fn missing_values_are_reported_as_missing() {
        assert_eq!(
            has_valid_remote_config(None, Some(KEY)),
            Err(SelectionReason::MissingConfig)
        );
        assert_eq!(
            has_valid_remote_config(Some(""), Some(KEY)),
            Err(SelectionReason::MissingConfig)
        );
    }

    #[test]
    fn implausible_values_are_rejected() {
        assert!(has_valid_remote_config(Some(PLACEHOLDER_URL), Some(KEY)).is_err());
        assert!(has_valid_remote_config(Some("http://x.supabase.co"), Some(KEY)).is_err());
        assert!(has_valid_remote_config(Some("https://x.supabase.co"), Some("short-key")).is_err());
        assert!(has_valid_remote_config(Some("https://x.supabase.co"), Some(KEY)).is_ok());
    }

    #[tokio::test]
    async fn forced_local_skips_remote_entirely() {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let settings = Settings {
            supabase_url: Some("https://x.supabase.co".to_string()),
            supabase_key: Some(KEY.to_string()),
            force_local: true,
            ..Default::default()
        };

        let ctx = select_backend(&settings, local).await;
        assert_eq!(ctx.kind(), BackendKind::Local);
        assert_eq!(ctx.reason, SelectionReason::ForcedLocal);
    }

    #[tokio::test]
    async fn absent_config_selects_local() {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let ctx = select_backend(&Settings::default(), local).await;
        assert!(!ctx.is_remote());
        assert_eq!(ctx.reason, SelectionReason::MissingConfig);
    }

    #[tokio::test]
    async fn answering_remote_is_selected_with_its_policy() {
        let (base, _db) = fake::start().await;
        let remote = RemoteStore::new(&base, KEY, Duration::from_secs(5)).unwrap();
        let local = Arc::new(LocalStore::open_in_memory().unwrap());

        let ctx = connect(remote, WritePolicy::Strict, local).await;
        assert!(ctx.is_remote());
        assert_eq!(ctx.kind(), BackendKind::Remote);
        assert_eq!(ctx.reason, SelectionReason::Remote);
        assert_eq!(ctx.write_policy, WritePolicy::Strict);
        assert!(ctx.primary.get_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_ping_selects_local() {
        let (base, db) = fake::start().await;
        db.lock().unwrap().fail_with = Some("PGRST301".to_string());
        let remote = RemoteStore::new(&base, KEY, Duration::from_secs(5)).unwrap();
        let local = Arc::new(LocalStore::open_in_memory().unwrap());

        let ctx = connect(remote, WritePolicy::LocalFallback, local).await;
        assert_eq!(ctx.kind(), BackendKind::Local);
        assert!(matches!(ctx.reason, SelectionReason::Unreachable(_)));
        assert_eq!(ctx.write_policy, WritePolicy::Strict);
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_to_local() {
        // Plain HTTP listener behind an https URL: the handshake fails.
        let (base, _db) = fake::start().await;
        let url = base.replace("http://", "https://");

        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let settings = Settings {
            supabase_url: Some(url),
            supabase_key: Some(KEY.to_string()),
            ..Default::default()
        };

        let ctx = select_backend(&settings, local).await;
        assert!(!ctx.is_remote());
        assert!(matches!(ctx.reason, SelectionReason::Unreachable(_)));
    }
}
