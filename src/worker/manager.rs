//! Offline cache manager that sits between callers and the network.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use super::strategy::{FetchOutcome, Strategy};
use crate::cache::{CacheResult, CacheStorage};
use crate::config::CacheConfig;
use crate::net::{resolve_url, Network, Request, Response};

/// HTTP 206 responses are never stored.
const PARTIAL_CONTENT: u16 = 206;

/// Lifecycle position of a manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install or activate failed; this instance will never take control
  Redundant,
}

/// Cache manager handling the install, activate and fetch events.
///
/// All configuration is passed in at construction, so independent instances
/// (and tests) never share state beyond the storage they are given.
pub struct OfflineCacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  origin: Url,
  config: CacheConfig,
  /// Background cache writes scheduled by network-first fetches
  writes: TaskTracker,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage + 'static, N: Network> OfflineCacheManager<S, N> {
  pub fn new(origin: Url, config: CacheConfig, storage: S, network: N) -> Self {
    Self::from_shared(origin, config, Arc::new(storage), Arc::new(network))
  }

  /// Build a manager over storage and network handles that other instances may also hold.
  pub fn from_shared(origin: Url, config: CacheConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      origin,
      config,
      writes: TaskTracker::new(),
      state: Mutex::new(WorkerState::Parsed),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Network fetch bounded by the configured timeout. Expiry counts as a network failure.
  async fn fetch_network(&self, request: &Request) -> Result<Response> {
    let timeout = self.config.network_timeout();
    tokio::time::timeout(timeout, self.network.fetch(request))
      .await
      .map_err(|_| eyre!("Request to {} timed out after {:?}", request.url, timeout))?
  }

  /// Install: precache every manifest entry into the current generation.
  ///
  /// All entries are fetched before anything is written, and the writes are
  /// committed together, so a single failure leaves the generation untouched.
  /// Returns the number of stored entries.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(count) => {
        self.set_state(WorkerState::Installed);
        info!(generation = %self.config.generation, entries = count, "App shell precached");
        Ok(count)
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        warn!(generation = %self.config.generation, error = %e, "Install failed");
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let generation = &self.config.generation;
    self.storage.open(generation)?;
    debug!(generation = %generation, "Cache opened");

    let requests = self
      .config
      .precache
      .iter()
      .map(|entry| resolve_url(&self.origin, entry).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests
      .into_iter()
      .map(|request| self.precache_one(request));

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(generation, &entries)?;

    Ok(entries.len())
  }

  async fn precache_one(&self, request: Request) -> Result<(Request, Response)> {
    let response = self.fetch_network(&request).await?;
    if !response.is_ok() {
      return Err(eyre!(
        "Precache of {} failed with status {}",
        request.url,
        response.status
      ));
    }
    Ok((request, response))
  }

  /// Activate: delete every generation except the current one.
  ///
  /// Returns the names of the deleted generations. The first failing
  /// deletion aborts the remaining ones.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    match self.delete_old_generations() {
      Ok(deleted) => {
        self.set_state(WorkerState::Activated);
        Ok(deleted)
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        warn!(generation = %self.config.generation, error = %e, "Activate failed");
        Err(e)
      }
    }
  }

  fn delete_old_generations(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if name == self.config.generation {
        continue;
      }
      info!(cache = %name, "Deleting old cache");
      if self.storage.delete(&name)? {
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Fetch: answer an intercepted request with the configured strategy.
  ///
  /// Only storage errors are returned as `Err`; network failures become
  /// cache fallbacks or `FetchOutcome::Unresolved`.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !request.is_get() {
      debug!(method = %request.method, url = %request.url, "Passing through non-GET request");
      return Ok(FetchOutcome::Passthrough);
    }

    match self.config.strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<FetchOutcome> {
    if let Some(entry) = self.storage.match_any(request)? {
      debug!(url = %request.url, "Serving from cache");
      return Ok(FetchOutcome::Responded(CacheResult::from_cache(
        entry.response,
        entry.cached_at,
      )));
    }

    // Miss: the network answer is returned as-is and not stored
    match self.fetch_network(request).await {
      Ok(response) => Ok(FetchOutcome::Responded(CacheResult::from_network(response))),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed and request is not cached");
        Ok(FetchOutcome::Unresolved {
          reason: e.to_string(),
        })
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Result<FetchOutcome> {
    match self.fetch_network(request).await {
      Ok(response) => {
        self.schedule_put(request.clone(), response.clone());
        Ok(FetchOutcome::Responded(CacheResult::from_network(response)))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed, trying cache");
        match self.storage.match_any(request)? {
          Some(entry) => Ok(FetchOutcome::Responded(CacheResult::offline(
            entry.response,
            entry.cached_at,
          ))),
          None => Ok(FetchOutcome::Unresolved {
            reason: format!("{} (no cached copy)", e),
          }),
        }
      }
    }
  }

  /// Default handling for a request the fetch handler passed through:
  /// straight to the network, cache untouched, still bounded by the timeout.
  pub async fn passthrough(&self, request: &Request) -> Result<Response> {
    self.fetch_network(request).await
  }

  /// Store a network response in the current generation without making the caller wait.
  fn schedule_put(&self, request: Request, response: Response) {
    if response.status == PARTIAL_CONTENT {
      debug!(url = %request.url, "Not caching partial response");
      return;
    }

    let storage = Arc::clone(&self.storage);
    let generation = self.config.generation.clone();
    self.writes.spawn_blocking(move || {
      if let Err(e) = storage.put(&generation, &request, &response) {
        warn!(url = %request.url, error = %e, "Background cache write failed");
      }
    });
  }

  /// Wait for all scheduled background cache writes to finish.
  pub async fn settle(&self) {
    self.writes.close();
    self.writes.wait().await;
    self.writes.reopen();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use async_trait::async_trait;
  use bytes::Bytes;
  use reqwest::Method;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Clone)]
  enum Route {
    Respond(u16, &'static str),
    Fail,
    Hang,
  }

  /// Scripted network keyed by URL path, counting every call.
  #[derive(Default)]
  struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: AtomicUsize,
  }

  impl FakeNetwork {
    fn with_routes(routes: &[(&str, Route)]) -> Self {
      let network = Self::default();
      for (path, route) in routes {
        network.set(path, route.clone());
      }
      network
    }

    fn set(&self, path: &str, route: Route) {
      self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("offline"));
      }

      let route = self.routes.lock().unwrap().get(request.url.path()).cloned();
      match route {
        Some(Route::Respond(status, body)) => Ok(Response {
          url: request.url.to_string(),
          status,
          headers: vec![("content-type".to_string(), "text/plain".to_string())],
          body: Bytes::from_static(body.as_bytes()),
        }),
        Some(Route::Hang) => {
          tokio::time::sleep(Duration::from_secs(60)).await;
          Err(eyre!("hung"))
        }
        Some(Route::Fail) | None => Err(eyre!("connection refused")),
      }
    }
  }

  /// SQLite storage with injectable delete and put failures.
  struct FlakyStorage {
    inner: SqliteStorage,
    fail_delete: Option<&'static str>,
    fail_put: bool,
  }

  impl FlakyStorage {
    fn new() -> Self {
      Self {
        inner: SqliteStorage::open_in_memory().unwrap(),
        fail_delete: None,
        fail_put: false,
      }
    }
  }

  impl CacheStorage for FlakyStorage {
    fn open(&self, name: &str) -> Result<()> {
      self.inner.open(name)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }

    fn delete(&self, name: &str) -> Result<bool> {
      if self.fail_delete == Some(name) {
        return Err(eyre!("disk I/O error deleting {}", name));
      }
      self.inner.delete(name)
    }

    fn match_request(
      &self,
      name: &str,
      request: &Request,
    ) -> Result<Option<crate::cache::CachedEntry>> {
      self.inner.match_request(name, request)
    }

    fn match_any(&self, request: &Request) -> Result<Option<crate::cache::CachedEntry>> {
      self.inner.match_any(request)
    }

    fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
      if self.fail_put {
        return Err(eyre!("database is locked"));
      }
      self.inner.put(name, request, response)
    }

    fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
      self.inner.put_all(name, entries)
    }

    fn entries(&self, name: &str) -> Result<Vec<String>> {
      self.inner.entries(name)
    }

    fn generations(&self) -> Result<Vec<crate::cache::GenerationInfo>> {
      self.inner.generations()
    }
  }

  fn origin() -> Url {
    Url::parse("http://localhost:5000").unwrap()
  }

  fn config(strategy: Strategy, precache: &[&str]) -> CacheConfig {
    CacheConfig {
      generation: "control-salidas-cache-v4".to_string(),
      precache: precache.iter().map(|s| s.to_string()).collect(),
      strategy,
      network_timeout_secs: 1,
    }
  }

  fn manager(
    strategy: Strategy,
    precache: &[&str],
    network: FakeNetwork,
  ) -> OfflineCacheManager<SqliteStorage, FakeNetwork> {
    OfflineCacheManager::new(
      origin(),
      config(strategy, precache),
      SqliteStorage::open_in_memory().unwrap(),
      network,
    )
  }

  fn get(path: &str) -> Request {
    Request::get(origin().join(path).unwrap())
  }

  fn body(outcome: &FetchOutcome) -> &[u8] {
    &outcome.response().expect("expected a response").body
  }

  fn source(outcome: &FetchOutcome) -> CacheSource {
    match outcome {
      FetchOutcome::Responded(result) => result.source,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_install_stores_every_manifest_entry() {
    let network = FakeNetwork::with_routes(&[
      ("/a", Route::Respond(200, "a")),
      ("/b", Route::Respond(200, "b")),
    ]);
    let mgr = manager(Strategy::NetworkFirst, &["/a", "/b"], network);

    assert_eq!(mgr.state(), WorkerState::Parsed);
    assert_eq!(mgr.install().await.unwrap(), 2);
    assert_eq!(mgr.state(), WorkerState::Installed);

    let keys = mgr.storage().entries("control-salidas-cache-v4").unwrap();
    assert_eq!(
      keys,
      vec!["http://localhost:5000/a", "http://localhost:5000/b"]
    );
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = FakeNetwork::with_routes(&[
      ("/", Route::Respond(200, "home")),
      ("/scan", Route::Fail),
    ]);
    let mgr = manager(Strategy::NetworkFirst, &["/", "/scan"], network);

    assert!(mgr.install().await.is_err());
    assert_eq!(mgr.state(), WorkerState::Redundant);
    assert!(mgr
      .storage()
      .entries("control-salidas-cache-v4")
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let network = FakeNetwork::with_routes(&[
      ("/", Route::Respond(200, "home")),
      ("/static/img/logo.png", Route::Respond(404, "missing")),
    ]);
    let mgr = manager(Strategy::NetworkFirst, &["/", "/static/img/logo.png"], network);

    let err = mgr.install().await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert!(mgr.storage().match_any(&get("/")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_install_timeout_fails_install() {
    let network = FakeNetwork::with_routes(&[
      ("/", Route::Respond(200, "home")),
      ("/scan", Route::Hang),
    ]);
    let mgr = manager(Strategy::NetworkFirst, &["/", "/scan"], network);

    let err = mgr.install().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(mgr.state(), WorkerState::Redundant);
    assert!(mgr
      .storage()
      .entries("control-salidas-cache-v4")
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_activate_aborts_on_delete_failure() {
    let storage = FlakyStorage {
      fail_delete: Some("v2"),
      ..FlakyStorage::new()
    };
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    storage.open("v3").unwrap();
    storage.open("control-salidas-cache-v4").unwrap();

    let mgr = OfflineCacheManager::new(
      origin(),
      config(Strategy::NetworkFirst, &[]),
      storage,
      FakeNetwork::default(),
    );

    assert!(mgr.activate().await.is_err());
    assert_eq!(mgr.state(), WorkerState::Redundant);
    // v1 went before the failure; v3 was never reached
    assert_eq!(
      mgr.storage().keys().unwrap(),
      vec!["v2", "v3", "control-salidas-cache-v4"]
    );
  }

  #[tokio::test]
  async fn test_background_write_failure_is_not_surfaced() {
    let storage = FlakyStorage {
      fail_put: true,
      ..FlakyStorage::new()
    };
    let mgr = OfflineCacheManager::new(
      origin(),
      config(Strategy::NetworkFirst, &[]),
      storage,
      FakeNetwork::with_routes(&[("/index", Route::Respond(200, "fresh"))]),
    );

    let outcome = mgr.handle_fetch(&get("/index")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Network);
    assert_eq!(body(&outcome), b"fresh");

    mgr.settle().await;
    assert!(mgr.storage().match_any(&get("/index")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_passthrough_is_bounded_by_timeout() {
    let network = FakeNetwork::with_routes(&[("/scan", Route::Hang)]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);

    let post = Request::new(Method::POST, origin().join("/scan").unwrap());
    assert!(mgr.handle_fetch(&post).await.unwrap().is_passthrough());

    let err = mgr.passthrough(&post).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert!(mgr.storage().match_any(&get("/scan")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_activate_deletes_other_generations() {
    let mgr = manager(Strategy::NetworkFirst, &[], FakeNetwork::default());
    let storage = mgr.storage();
    storage.open("control-salidas-cache-v2").unwrap();
    storage.open("control-salidas-cache-v4").unwrap();
    storage.open("control-salidas-cache-v3").unwrap();

    let deleted = mgr.activate().await.unwrap();
    assert_eq!(
      deleted,
      vec!["control-salidas-cache-v2", "control-salidas-cache-v3"]
    );
    assert_eq!(storage.keys().unwrap(), vec!["control-salidas-cache-v4"]);
    assert_eq!(mgr.state(), WorkerState::Activated);

    // Nothing left to collect on a second run
    assert!(mgr.activate().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_passes_through_non_get() {
    let network = FakeNetwork::with_routes(&[("/scan", Route::Respond(200, "ok"))]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);

    let post = Request::new(Method::POST, origin().join("/scan").unwrap());
    let outcome = mgr.handle_fetch(&post).await.unwrap();

    assert!(outcome.is_passthrough());
    assert_eq!(mgr.network().calls(), 0);
  }

  #[tokio::test]
  async fn test_network_first_returns_network_and_caches_copy() {
    let network = FakeNetwork::with_routes(&[("/index", Route::Respond(200, "fresh"))]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);

    let outcome = mgr.handle_fetch(&get("/index")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Network);
    assert_eq!(body(&outcome), b"fresh");

    mgr.settle().await;
    let entry = mgr
      .storage()
      .match_request("control-salidas-cache-v4", &get("/index"))
      .unwrap()
      .expect("response should be cached");
    assert_eq!(entry.digest, outcome.response().unwrap().digest());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_when_offline() {
    let network = FakeNetwork::with_routes(&[("/scan", Route::Respond(200, "v1"))]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);

    mgr.handle_fetch(&get("/scan")).await.unwrap();
    mgr.settle().await;

    mgr.network().set_offline(true);
    let outcome = mgr.handle_fetch(&get("/scan")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Offline);
    assert_eq!(body(&outcome), b"v1");
  }

  #[tokio::test]
  async fn test_network_first_unresolved_without_cache() {
    let mgr = manager(Strategy::NetworkFirst, &[], FakeNetwork::default());
    mgr.network().set_offline(true);

    let outcome = mgr.handle_fetch(&get("/index")).await.unwrap();
    assert!(outcome.is_unresolved());
  }

  #[tokio::test]
  async fn test_network_first_timeout_falls_back_to_cache() {
    let network = FakeNetwork::with_routes(&[("/", Route::Hang)]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);
    mgr
      .storage()
      .put(
        "control-salidas-cache-v4",
        &get("/"),
        &Response {
          url: "http://localhost:5000/".to_string(),
          status: 200,
          headers: Vec::new(),
          body: Bytes::from_static(b"shell"),
        },
      )
      .unwrap();

    let outcome = mgr.handle_fetch(&get("/")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Offline);
    assert_eq!(body(&outcome), b"shell");
  }

  #[tokio::test]
  async fn test_network_first_skips_partial_content() {
    let network = FakeNetwork::with_routes(&[("/video", Route::Respond(206, "part"))]);
    let mgr = manager(Strategy::NetworkFirst, &[], network);

    let outcome = mgr.handle_fetch(&get("/video")).await.unwrap();
    assert_eq!(body(&outcome), b"part");

    mgr.settle().await;
    assert!(mgr.storage().match_any(&get("/video")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let network = FakeNetwork::with_routes(&[("/a", Route::Respond(200, "a"))]);
    let mgr = manager(Strategy::CacheFirst, &["/a"], network);
    mgr.install().await.unwrap();
    let calls_after_install = mgr.network().calls();

    let outcome = mgr.handle_fetch(&get("/a")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Cache);
    assert_eq!(body(&outcome), b"a");
    assert_eq!(mgr.network().calls(), calls_after_install);
  }

  #[tokio::test]
  async fn test_cache_first_miss_does_not_store() {
    let network = FakeNetwork::with_routes(&[("/index", Route::Respond(200, "page"))]);
    let mgr = manager(Strategy::CacheFirst, &[], network);

    let outcome = mgr.handle_fetch(&get("/index")).await.unwrap();
    assert_eq!(source(&outcome), CacheSource::Network);

    mgr.settle().await;
    assert!(mgr.storage().match_any(&get("/index")).unwrap().is_none());
    assert_eq!(mgr.network().calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_unresolved() {
    let mgr = manager(Strategy::CacheFirst, &[], FakeNetwork::default());
    mgr.network().set_offline(true);

    assert!(mgr.handle_fetch(&get("/")).await.unwrap().is_unresolved());
  }

  #[tokio::test]
  async fn test_version_bump_cycle() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let old = OfflineCacheManager::from_shared(
      origin(),
      CacheConfig {
        generation: "control-salidas-cache-v2".to_string(),
        ..config(Strategy::CacheFirst, &["/"])
      },
      Arc::clone(&storage),
      Arc::new(FakeNetwork::with_routes(&[("/", Route::Respond(200, "v2 shell"))])),
    );
    old.install().await.unwrap();

    let network = Arc::new(FakeNetwork::with_routes(&[("/", Route::Respond(200, "v4 shell"))]));
    let new = OfflineCacheManager::from_shared(
      origin(),
      config(Strategy::NetworkFirst, &["/"]),
      Arc::clone(&storage),
      Arc::clone(&network),
    );

    // Before the new generation is installed, offline lookups still find the old one
    network.set_offline(true);
    let outcome = new.handle_fetch(&get("/")).await.unwrap();
    assert_eq!(body(&outcome), b"v2 shell");

    network.set_offline(false);
    new.install().await.unwrap();
    assert_eq!(
      new.activate().await.unwrap(),
      vec!["control-salidas-cache-v2"]
    );

    network.set_offline(true);
    let outcome = new.handle_fetch(&get("/")).await.unwrap();
    assert_eq!(body(&outcome), b"v4 shell");
    assert_eq!(storage.keys().unwrap(), vec!["control-salidas-cache-v4"]);
  }
}
