//! Process-wide cache of the controller's token verification key.
//!
//! Verification calls read the cache concurrently and refresh it when it is
//! empty or stale. Refreshing is idempotent (fetching the same PEM twice is
//! harmless), so concurrent callers may race to refresh; the lock only guards
//! the swap of the cached value and is never held across an await.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::controller::ControllerError;

/// Remote keys older than this are refetched on next use.
pub const KEY_FRESHNESS: Duration = Duration::from_secs(5 * 60);

const PEM_MARKER: &str = "BEGIN PUBLIC KEY";

#[async_trait]
pub trait PublicKeyFetcher: Send + Sync {
    /// Fetch the PEM public key published by `issuer` (a base URL).
    async fn fetch_public_key(&self, issuer: &str) -> Result<String, ControllerError>;
}

/// Where the cached key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Provisioned through the environment, never replaced
    Static,
    /// Fetched from `<issuer>/probe/pubkey`
    Remote(String),
}

#[derive(Debug, Clone)]
pub struct CachedPublicKey {
    pub pem: Arc<str>,
    pub fetched_at: Instant,
    pub source: KeySource,
}

/// Statically provisioned key material, in order of precedence.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyConfig {
    pub pem: Option<String>,
    pub pem_base64: Option<String>,
    pub pem_file: Option<std::path::PathBuf>,
}

impl StaticKeyConfig {
    /// First usable PEM among the configured sources, if any.
    pub fn resolve(&self) -> Option<String> {
        if let Some(pem) = self.pem.as_deref().filter(|p| p.contains(PEM_MARKER)) {
            return Some(pem.to_string());
        }

        if let Some(b64) = self.pem_base64.as_deref().filter(|b| !b.trim().is_empty()) {
            match STANDARD.decode(b64.trim()) {
                Ok(bytes) => {
                    let pem = String::from_utf8_lossy(&bytes).into_owned();
                    if pem.contains(PEM_MARKER) {
                        return Some(pem);
                    }
                }
                Err(e) => tracing::warn!("ignoring undecodable base64 public key: {}", e),
            }
        }

        if let Some(path) = self.pem_file.as_deref() {
            match read_pem_file(path) {
                Ok(Some(pem)) => return Some(pem),
                Ok(None) => tracing::warn!(path = %path.display(), "public key file has no PEM key"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to read public key file: {}", e)
                }
            }
        }

        None
    }
}

fn read_pem_file(path: &Path) -> std::io::Result<Option<String>> {
    let pem = std::fs::read_to_string(path)?;
    Ok(pem.contains(PEM_MARKER).then_some(pem))
}

pub struct PublicKeyCache {
    current: RwLock<Option<CachedPublicKey>>,
    static_pem: Option<Arc<str>>,
    default_issuer: String,
    trusted_issuers: Vec<String>,
    fetcher: Arc<dyn PublicKeyFetcher>,
    freshness: Duration,
}

impl std::fmt::Debug for PublicKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeyCache")
            .field("default_issuer", &self.default_issuer)
            .field("trusted_issuers", &self.trusted_issuers)
            .field("has_static_key", &self.static_pem.is_some())
            .finish()
    }
}

fn normalize_issuer(issuer: &str) -> String {
    issuer.trim().trim_end_matches('/').to_string()
}

impl PublicKeyCache {
    pub fn new(
        default_issuer: &str,
        trusted_issuers: &[String],
        static_keys: &StaticKeyConfig,
        fetcher: Arc<dyn PublicKeyFetcher>,
    ) -> Self {
        let default_issuer = normalize_issuer(default_issuer);
        let mut trusted: Vec<String> = trusted_issuers
            .iter()
            .map(|i| normalize_issuer(i))
            .filter(|i| !i.is_empty())
            .collect();
        if !default_issuer.is_empty() {
            trusted.push(default_issuer.clone());
        }
        trusted.dedup();

        Self {
            current: RwLock::new(None),
            static_pem: static_keys.resolve().map(Arc::from),
            default_issuer,
            trusted_issuers: trusted,
            fetcher,
            freshness: KEY_FRESHNESS,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Current key without refreshing.
    pub fn snapshot(&self) -> Option<CachedPublicKey> {
        self.current.read().clone()
    }

    fn is_trusted(&self, issuer: &str) -> bool {
        let issuer = normalize_issuer(issuer);
        self.trusted_issuers.iter().any(|t| *t == issuer)
    }

    /// Whether the cached key can be used as is for a token hinting `hint`.
    fn is_usable(&self, cached: &CachedPublicKey, hint: Option<&str>) -> bool {
        match &cached.source {
            KeySource::Static => true,
            KeySource::Remote(source) => {
                if cached.fetched_at.elapsed() >= self.freshness {
                    return false;
                }
                // an issuer we trust but have no key from yet is worth an eager fetch
                match hint {
                    Some(hint) if self.is_trusted(hint) => normalize_issuer(hint) == *source,
                    _ => true,
                }
            }
        }
    }

    fn store(&self, pem: Arc<str>, source: KeySource) -> CachedPublicKey {
        let cached = CachedPublicKey {
            pem,
            fetched_at: Instant::now(),
            source,
        };
        *self.current.write() = Some(cached.clone());
        cached
    }

    async fn fetch_from(&self, issuer: &str) -> Option<CachedPublicKey> {
        match self.fetcher.fetch_public_key(issuer).await {
            Ok(pem) => Some(self.store(Arc::from(pem), KeySource::Remote(issuer.to_string()))),
            Err(e) => {
                tracing::warn!(issuer, "failed to fetch public key: {}", e);
                None
            }
        }
    }

    /// Return a usable key, refreshing it first if it is absent or stale.
    ///
    /// `hint` is the unverified `iss` claim of the token being checked. It is
    /// only followed when it names a trusted issuer; otherwise the default
    /// issuer is used. When every refresh attempt fails the previous key (if
    /// any) is returned.
    pub async fn ensure_fresh(&self, hint: Option<&str>) -> Option<CachedPublicKey> {
        let snapshot = self.snapshot();
        if let Some(cached) = &snapshot {
            if self.is_usable(cached, hint) {
                return snapshot;
            }
        }

        if let Some(pem) = &self.static_pem {
            return Some(self.store(pem.clone(), KeySource::Static));
        }

        if let Some(hint) = hint.filter(|h| self.is_trusted(h)) {
            let hint = normalize_issuer(hint);
            if let Some(fresh) = self.fetch_from(&hint).await {
                return Some(fresh);
            }
        } else if let Some(hint) = hint {
            tracing::debug!(issuer = hint, "ignoring untrusted issuer hint");
        }

        if !self.default_issuer.is_empty() {
            if let Some(fresh) = self.fetch_from(&self.default_issuer).await {
                return Some(fresh);
            }
        }

        self.snapshot()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub(crate) const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/signing_key.pub.pem");

    /// Serves a fixed PEM for a set of issuers and counts fetches.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub keys: Vec<(String, String)>,
        pub calls: AtomicUsize,
        pub requested: parking_lot::Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub(crate) fn serving(issuer: &str, pem: &str) -> Self {
            Self {
                keys: vec![(issuer.to_string(), pem.to_string())],
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PublicKeyFetcher for FakeFetcher {
        async fn fetch_public_key(&self, issuer: &str) -> Result<String, ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().push(issuer.to_string());
            self.keys
                .iter()
                .find(|(i, _)| i == issuer)
                .map(|(_, pem)| pem.clone())
                .ok_or(ControllerError::InvalidPublicKey)
        }
    }

    const CENTRAL: &str = "https://central.example";

    fn cache_with(fetcher: Arc<FakeFetcher>, trusted: &[String]) -> PublicKeyCache {
        PublicKeyCache::new(CENTRAL, trusted, &StaticKeyConfig::default(), fetcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_once_then_serves_from_cache() {
        let fetcher = Arc::new(FakeFetcher::serving(CENTRAL, PUBLIC_PEM));
        let cache = cache_with(fetcher.clone(), &[]);

        let key = cache.ensure_fresh(None).await.unwrap();
        assert_eq!(&*key.pem, PUBLIC_PEM);
        assert_eq!(key.source, KeySource::Remote(CENTRAL.into()));

        cache.ensure_fresh(None).await.unwrap();
        cache.ensure_fresh(Some("https://central.example/")).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_after_freshness_window() {
        let fetcher = Arc::new(FakeFetcher::serving(CENTRAL, PUBLIC_PEM));
        let cache = cache_with(fetcher.clone(), &[]);

        cache.ensure_fresh(None).await.unwrap();
        tokio::time::advance(KEY_FRESHNESS - Duration::from_secs(1)).await;
        cache.ensure_fresh(None).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.ensure_fresh(None).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_stale_key_when_refresh_fails() {
        let fetcher = Arc::new(FakeFetcher::serving(CENTRAL, PUBLIC_PEM));
        let cache = cache_with(fetcher.clone(), &[]);
        cache.ensure_fresh(None).await.unwrap();

        let failing = Arc::new(FakeFetcher::default());
        let cache = PublicKeyCache {
            fetcher: failing,
            ..cache
        };
        tokio::time::advance(KEY_FRESHNESS * 2).await;
        let key = cache.ensure_fresh(None).await.unwrap();
        assert_eq!(&*key.pem, PUBLIC_PEM);
    }

    #[tokio::test]
    async fn test_untrusted_hint_falls_back_to_default() {
        let fetcher = Arc::new(FakeFetcher::serving(CENTRAL, PUBLIC_PEM));
        let cache = cache_with(fetcher.clone(), &[]);

        let key = cache.ensure_fresh(Some("https://evil.example")).await.unwrap();
        assert_eq!(key.source, KeySource::Remote(CENTRAL.into()));
        assert_eq!(*fetcher.requested.lock(), vec![CENTRAL.to_string()]);
    }

    #[tokio::test]
    async fn test_trusted_hint_is_fetched_eagerly() {
        let other = "https://central-2.example";
        let fetcher = Arc::new(FakeFetcher {
            keys: vec![
                (CENTRAL.to_string(), PUBLIC_PEM.to_string()),
                (other.to_string(), PUBLIC_PEM.to_string()),
            ],
            ..Default::default()
        });
        let cache = cache_with(fetcher.clone(), &[other.to_string()]);

        cache.ensure_fresh(None).await.unwrap();
        let key = cache.ensure_fresh(Some(other)).await.unwrap();
        assert_eq!(key.source, KeySource::Remote(other.into()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_key_wins_and_is_never_fetched() {
        let fetcher = Arc::new(FakeFetcher::default());
        let static_keys = StaticKeyConfig {
            pem_base64: Some(STANDARD.encode(PUBLIC_PEM)),
            ..Default::default()
        };
        let cache = PublicKeyCache::new(CENTRAL, &[], &static_keys, fetcher.clone());

        let key = cache.ensure_fresh(Some(CENTRAL)).await.unwrap();
        assert_eq!(key.source, KeySource::Static);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_static_key_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("key.pem");
        std::fs::write(&file, PUBLIC_PEM).unwrap();

        let only_file = StaticKeyConfig {
            pem: Some("not a key".into()),
            pem_base64: Some("%%%".into()),
            pem_file: Some(file.clone()),
        };
        assert_eq!(only_file.resolve().as_deref(), Some(PUBLIC_PEM));

        let missing = StaticKeyConfig {
            pem_file: Some(dir.path().join("missing.pem")),
            ..Default::default()
        };
        assert!(missing.resolve().is_none());
    }

    #[tokio::test]
    async fn test_no_key_anywhere() {
        let cache = cache_with(Arc::new(FakeFetcher::default()), &[]);
        assert!(cache.ensure_fresh(None).await.is_none());
    }
}
