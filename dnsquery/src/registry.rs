//! Cached resolver registry.
//!
//! The registry document lists public resolvers by name. A [`Registry`]
//! downloads it, keeps the resulting [`Snapshot`] for `max_age` and refreshes
//! it on demand with at most one refresh in flight. Failures are never
//! surfaced: a persisted copy or the bundled list takes over.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::task;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use store::Store;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::native::native_endpoints;

pub const DEFAULT_UPDATE_URL: &str = "https://martinheidegger.github.io/dns-query/resolvers.json";

static FALLBACK_RESOLVERS: Lazy<Vec<Resolver>> = Lazy::new(|| {
    match parse_document(include_bytes!("../data/resolvers.json")) {
        Ok(resolvers) => resolvers,
        Err(e) => {
            warn!("bundled resolver list is invalid: {}", e);
            Vec::new()
        }
    }
});

/// One entry of the registry document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolver {
    pub name: String,
    pub endpoint: EndpointDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(alias = "resolvers")]
    data: Vec<Resolver>,
}

pub fn parse_document(data: &[u8]) -> Result<Vec<Resolver>, serde_json::Error> {
    let doc: Document = serde_json::from_slice(data)?;
    Ok(doc.data)
}

/// The resolver list shipped with the crate.
pub fn fallback_resolvers() -> &'static [Resolver] {
    &FALLBACK_RESOLVERS
}

/// Where a snapshot's resolvers came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Remote,
    Persisted,
    Fallback,
}

/// Immutable view of the registry at one point in time.
#[derive(Debug)]
pub struct Snapshot {
    resolvers: Vec<Resolver>,
    resolver_by_name: HashMap<String, usize>,
    endpoints: Vec<Arc<Endpoint>>,
    endpoint_by_name: HashMap<String, Arc<Endpoint>>,
    fetched_at: Instant,
    source: Source,
}

impl Snapshot {
    /// Normalizes every resolver's endpoint and appends the native endpoints.
    pub fn build(
        resolvers: Vec<Resolver>,
        natives: Vec<Arc<Endpoint>>,
        fetched_at: Instant,
        source: Source,
    ) -> Self {
        let mut resolver_by_name = HashMap::with_capacity(resolvers.len());
        let mut endpoint_by_name = HashMap::with_capacity(resolvers.len());
        let mut endpoints = Vec::with_capacity(resolvers.len() + natives.len());
        for (idx, resolver) in resolvers.iter().enumerate() {
            resolver_by_name.insert(resolver.name.clone(), idx);
            match Endpoint::from_descriptor(&resolver.endpoint) {
                Ok(endpoint) => {
                    let endpoint = Arc::new(endpoint.with_name(&resolver.name));
                    endpoint_by_name.insert(resolver.name.clone(), endpoint.clone());
                    endpoints.push(endpoint);
                }
                Err(e) => {
                    warn!(resolver = %resolver.name, "skip resolver with invalid endpoint: {}", e)
                }
            }
        }
        endpoints.extend(natives);
        Snapshot {
            resolvers,
            resolver_by_name,
            endpoints,
            endpoint_by_name,
            fetched_at,
            source,
        }
    }

    pub fn resolvers(&self) -> &[Resolver] {
        &self.resolvers
    }

    pub fn resolver(&self, name: &str) -> Option<&Resolver> {
        self.resolver_by_name
            .get(name)
            .and_then(|idx| self.resolvers.get(*idx))
    }

    /// Registry endpoints followed by the native ones.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoint_by_name.get(name)
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn source(&self) -> Source {
        self.source
    }
}

/// Downloads the registry document.
#[async_trait]
pub trait RegistryFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> anyhow::Result<Vec<u8>>;
}

/// Blocking `ureq` download moved off the async executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct UreqFetcher;

#[async_trait]
impl RegistryFetcher for UreqFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let url = url.to_string();
        task::spawn_blocking(move || {
            let mut data = Vec::new();
            let _size = ureq::get(&url)
                .timeout(timeout)
                .call()?
                .into_reader()
                .read_to_end(&mut data)?;
            Ok::<_, anyhow::Error>(data)
        })
        .await
    }
}

pub type NativeSource = fn() -> Vec<Arc<Endpoint>>;

type Refresh = Shared<BoxFuture<'static, Arc<Snapshot>>>;

#[derive(Default)]
struct State {
    snapshot: Option<Arc<Snapshot>>,
    inflight: Option<Refresh>,
}

struct Inner {
    update: bool,
    update_url: String,
    max_age: Duration,
    timeout: Duration,
    store: Option<Store>,
    fetcher: Arc<dyn RegistryFetcher>,
    native: NativeSource,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("update", &self.inner.update)
            .field("update_url", &self.inner.update_url)
            .field("max_age", &self.inner.max_age)
            .field("persist", &self.inner.store.is_some())
            .finish()
    }
}

impl Registry {
    pub fn new(config: &SessionConfig) -> Self {
        Registry::with_sources(config, Arc::new(UreqFetcher), native_endpoints)
    }

    pub fn with_sources(
        config: &SessionConfig,
        fetcher: Arc<dyn RegistryFetcher>,
        native: NativeSource,
    ) -> Self {
        let store = if config.persist {
            match Store::new(&config.persist_path) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(path = ?config.persist_path, "disable registry persistence: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        Registry {
            inner: Arc::new(Inner {
                update: config.update,
                update_url: config.update_url.clone(),
                max_age: config.max_age,
                timeout: config.timeout,
                store,
                fetcher,
                native,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the cached snapshot while it is younger than `max_age`,
    /// otherwise joins or starts a refresh.
    #[instrument(skip(self))]
    pub async fn fetch(&self, force: bool) -> Arc<Snapshot> {
        let refresh = {
            let mut state = self.inner.state.lock();
            if !force {
                if let Some(snapshot) = &state.snapshot {
                    if snapshot.age() < self.inner.max_age {
                        return snapshot.clone();
                    }
                }
            }
            match &state.inflight {
                Some(refresh) => refresh.clone(),
                None => {
                    // detached so callers that stop waiting do not stall it
                    let refresh = task::spawn(self.inner.clone().refresh()).boxed().shared();
                    state.inflight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    pub async fn wellknown(&self) -> Arc<Snapshot> {
        self.fetch(false).await
    }

    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.fetch(false).await.endpoints().to_vec()
    }

    /// The last snapshot, without refreshing it.
    pub fn cached(&self) -> Option<Arc<Snapshot>> {
        self.inner.state.lock().snapshot.clone()
    }
}

impl Inner {
    async fn refresh(self: Arc<Self>) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.load().await);
        let mut state = self.state.lock();
        state.snapshot = Some(snapshot.clone());
        state.inflight = None;
        snapshot
    }

    async fn load(&self) -> Snapshot {
        let now = Instant::now();
        if !self.update {
            debug!("registry update disabled, use bundled resolvers");
            return self.build(fallback_resolvers().to_vec(), now, Source::Fallback);
        }
        if let Some((resolvers, age)) = self.persisted(Some(self.max_age)) {
            debug!(url = %self.update_url, ?age, "use fresh persisted registry");
            let fetched_at = now.checked_sub(age).unwrap_or(now);
            return self.build(resolvers, fetched_at, Source::Persisted);
        }
        match self.download().await {
            Ok(resolvers) => {
                info!(url = %self.update_url, count = resolvers.len(), "resolver registry updated");
                return self.build(resolvers, now, Source::Remote);
            }
            Err(e) => warn!(url = %self.update_url, "update resolver registry error: {:#}", e),
        }
        if let Some((resolvers, age)) = self.persisted(None) {
            warn!(?age, "use persisted resolver registry instead");
            return self.build(resolvers, now, Source::Persisted);
        }
        warn!("use bundled resolvers instead");
        self.build(fallback_resolvers().to_vec(), now, Source::Fallback)
    }

    async fn download(&self) -> anyhow::Result<Vec<Resolver>> {
        let data = self.fetcher.fetch(&self.update_url, self.timeout).await?;
        let resolvers = parse_document(&data)?;
        if let Some(store) = &self.store {
            if let Err(e) = store.cache_document(&self.update_url, &data) {
                warn!(url = %self.update_url, "persist resolver registry error: {:#}", e);
            }
        }
        Ok(resolvers)
    }

    /// The persisted document, if any and younger than `max_age` when given.
    fn persisted(&self, max_age: Option<Duration>) -> Option<(Vec<Resolver>, Duration)> {
        let store = self.store.as_ref()?;
        let cached = match store.get_cached_document(&self.update_url) {
            Ok(cached) => cached?,
            Err(e) => {
                warn!(url = %self.update_url, "read persisted registry error: {:#}", e);
                return None;
            }
        };
        if max_age.map_or(false, |max_age| cached.age >= max_age) {
            return None;
        }
        match parse_document(&cached.data) {
            Ok(resolvers) => Some((resolvers, cached.age)),
            Err(e) => {
                warn!(url = %self.update_url, "persisted registry is invalid: {}", e);
                None
            }
        }
    }

    fn build(&self, resolvers: Vec<Resolver>, fetched_at: Instant, source: Source) -> Snapshot {
        Snapshot::build(resolvers, (self.native)(), fetched_at, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Protocol;
    use futures_util::future::join_all;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DOCUMENT: &str = r#"{
        "data": [
            { "name": "one", "endpoint": "https://one.example/dns-query", "country": "DE" },
            { "name": "two", "endpoint": "udp://192.0.2.2" },
            { "name": "broken", "endpoint": "tcp://192.0.2.3" }
        ]
    }"#;

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        document: Option<&'static str>,
    }

    impl CountingFetcher {
        fn new(document: Option<&'static str>) -> Arc<Self> {
            Self::with_delay(document, Duration::ZERO)
        }

        fn with_delay(document: Option<&'static str>, delay: Duration) -> Arc<Self> {
            Arc::new(CountingFetcher {
                calls: AtomicUsize::new(0),
                delay,
                document,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            task::sleep(self.delay).await;
            match self.document {
                Some(document) => Ok(document.as_bytes().to_vec()),
                None => anyhow::bail!("registry unreachable"),
            }
        }
    }

    fn no_natives() -> Vec<Arc<Endpoint>> {
        Vec::new()
    }

    fn one_native() -> Vec<Arc<Endpoint>> {
        vec![Arc::new(Endpoint::udp_addr(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            53,
        ))]
    }

    fn config() -> SessionConfig {
        SessionConfig {
            update_url: "https://registry.example/resolvers.json".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bundled_resolvers_parse() {
        let resolvers = fallback_resolvers();
        assert!(!resolvers.is_empty());
        let snapshot =
            Snapshot::build(resolvers.to_vec(), vec![], Instant::now(), Source::Fallback);
        assert_eq!(snapshot.endpoints().len(), resolvers.len());
        assert!(snapshot.endpoints().iter().any(|e| e.protocol().is_doh()));
        assert!(snapshot.endpoints().iter().any(|e| e.protocol().is_udp()));
    }

    #[test]
    fn test_snapshot_skips_invalid_endpoints() {
        let resolvers = parse_document(DOCUMENT.as_bytes()).unwrap();
        let snapshot = Snapshot::build(resolvers, one_native(), Instant::now(), Source::Remote);
        assert_eq!(snapshot.resolvers().len(), 3);
        assert!(snapshot.resolver("broken").is_some());
        assert!(snapshot.endpoint("broken").is_none());
        assert_eq!(snapshot.endpoints().len(), 3);
        assert_eq!(snapshot.endpoint("two").map(|e| e.protocol()), Some(Protocol::Udp4));
        assert_eq!(snapshot.endpoints()[2].name(), None);
        assert_eq!(
            snapshot.resolver("one").and_then(|r| r.country.as_deref()),
            Some("DE")
        );
    }

    #[test]
    fn test_resolvers_key_is_accepted() {
        let resolvers =
            parse_document(br#"{"resolvers": [{"name": "x", "endpoint": "udp://192.0.2.1"}]}"#)
                .unwrap();
        assert_eq!(resolvers.len(), 1);
    }

    #[test]
    fn test_concurrent_fetches_share_one_refresh() {
        task::block_on(async {
            let fetcher = CountingFetcher::with_delay(Some(DOCUMENT), Duration::from_millis(50));
            let registry = Registry::with_sources(&config(), fetcher.clone(), no_natives);
            let snapshots = join_all((0..8).map(|_| registry.wellknown())).await;
            assert_eq!(fetcher.calls(), 1);
            assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
            assert_eq!(snapshots[0].source(), Source::Remote);
        });
    }

    #[test]
    fn test_snapshot_is_reused_until_max_age() {
        task::block_on(async {
            let fetcher = CountingFetcher::new(Some(DOCUMENT));
            let config = SessionConfig {
                max_age: Duration::from_millis(100),
                ..config()
            };
            let registry = Registry::with_sources(&config, fetcher.clone(), no_natives);
            let first = registry.wellknown().await;
            let second = registry.wellknown().await;
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(fetcher.calls(), 1);

            task::sleep(Duration::from_millis(150)).await;
            let third = registry.wellknown().await;
            assert!(!Arc::ptr_eq(&first, &third));
            assert_eq!(fetcher.calls(), 2);

            registry.fetch(true).await;
            assert_eq!(fetcher.calls(), 3);
        });
    }

    #[test]
    fn test_failed_update_uses_fallback_and_natives() {
        task::block_on(async {
            let fetcher = CountingFetcher::new(None);
            let registry = Registry::with_sources(&config(), fetcher.clone(), one_native);
            let snapshot = registry.wellknown().await;
            assert_eq!(fetcher.calls(), 1);
            assert_eq!(snapshot.source(), Source::Fallback);
            assert_eq!(snapshot.resolvers(), fallback_resolvers());
            let endpoints = snapshot.endpoints();
            assert_eq!(endpoints.len(), fallback_resolvers().len() + 1);
            let native = endpoints.last().unwrap();
            assert_eq!(native.name(), None);
            assert_eq!(native.to_string(), "udp4://192.168.1.1:53");
        });
    }

    #[test]
    fn test_update_disabled_never_fetches() {
        task::block_on(async {
            let fetcher = CountingFetcher::new(Some(DOCUMENT));
            let config = SessionConfig {
                update: false,
                ..config()
            };
            let registry = Registry::with_sources(&config, fetcher.clone(), no_natives);
            let snapshot = registry.wellknown().await;
            assert_eq!(fetcher.calls(), 0);
            assert_eq!(snapshot.source(), Source::Fallback);
        });
    }

    #[test]
    fn test_persisted_registry() {
        task::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = SessionConfig {
                persist: true,
                persist_path: dir.path().join("registry.sqlite"),
                ..config()
            };

            let fetcher = CountingFetcher::new(Some(DOCUMENT));
            let registry = Registry::with_sources(&config, fetcher.clone(), no_natives);
            assert_eq!(registry.wellknown().await.source(), Source::Remote);
            assert_eq!(fetcher.calls(), 1);

            // a fresh copy on disk saves the download
            let fetcher = CountingFetcher::new(Some(DOCUMENT));
            let registry = Registry::with_sources(&config, fetcher.clone(), no_natives);
            let snapshot = registry.wellknown().await;
            assert_eq!(fetcher.calls(), 0);
            assert_eq!(snapshot.source(), Source::Persisted);
            assert!(snapshot.endpoint("one").is_some());

            // an outdated copy still beats the bundled list when the download fails
            let config = SessionConfig {
                max_age: Duration::ZERO,
                ..config
            };
            let fetcher = CountingFetcher::new(None);
            let registry = Registry::with_sources(&config, fetcher.clone(), no_natives);
            let snapshot = registry.wellknown().await;
            assert_eq!(fetcher.calls(), 1);
            assert_eq!(snapshot.source(), Source::Persisted);
            assert_eq!(snapshot.resolvers().len(), 3);
        });
    }
}
