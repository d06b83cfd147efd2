//! Node context: the set of locally-known sources plus the knobs that
//! govern their lifetime (spec.md §3 "Node context", §4.6).
//!
//! Deliberately thin — this is a registry, not a policy engine. Relay
//! composition (triggering upstream subscribes/publishes, prefix-based
//! notify) lives in [`crate::relay`] and is built on top of this.
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::util::Watch;

/// Creates (and is expected to register) a cache for a URL with no local
/// source yet — the relay's "default source" factory (spec.md §4.6 step
/// 1-3). Installed by [`crate::relay`]; absent in origin-only mode.
pub type DefaultSourceFn = dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Cache>> + Send + Sync;

/// Notified after a brand-new cache is registered via [`Node::resolve_publish`],
/// so the relay can kick off an upstream `POST` and cancel any upstream
/// subscribe it had started speculatively (spec.md §4.6 publish steps 2-3).
pub type OnPublishFn = dyn Fn(Vec<u8>, Cache) + Send + Sync;

/// Shared, cheaply-cloneable registry of `url -> Cache` for one node.
///
/// Mirrors the map-of-named-things shape `moq-transport`'s broadcast state
/// uses for tracks, except the values here are independently-owned
/// [`Cache`] handles rather than `Watch`-backed sub-state, since a cache
/// already is its own `Watch`-backed handle.
#[derive(Clone)]
pub struct Node {
	sources: Watch<BTreeMap<Vec<u8>, Cache>>,
	/// Upper bound on how long a real-time cache retains a fully-received
	/// object before `purge_all` reclaims it (spec.md §4.1 `purge`).
	pub cache_duration_max: u64,
	/// How long a closed, subscriber-less cache is kept registered before
	/// `purge_all` callers should drop it entirely, in case its publisher
	/// reconnects under the same URL (spec.md §7, §9 Open Question 2 —
	/// made tunable rather than a hard-coded 30s).
	pub cache_delete_grace: u64,
	default_source: Option<Arc<DefaultSourceFn>>,
	on_publish: Option<Arc<OnPublishFn>>,
}

impl Node {
	pub fn new(cache_duration_max: u64) -> Self {
		Self {
			sources: Watch::new(BTreeMap::new()),
			cache_duration_max,
			cache_delete_grace: 30_000_000,
			default_source: None,
			on_publish: None,
		}
	}

	pub fn with_default_source(mut self, factory: Arc<DefaultSourceFn>) -> Self {
		self.default_source = Some(factory);
		self
	}

	pub fn with_on_publish(mut self, hook: Arc<OnPublishFn>) -> Self {
		self.on_publish = Some(hook);
		self
	}

	/// Resolve a subscribe: return the existing cache for `url`, or invoke
	/// the installed default-source factory to create and register one
	/// (relay mode), or fail with [`Error::NotFound`] (origin mode, no
	/// local publish for this URL).
	pub async fn resolve_subscribe(&self, url: &[u8]) -> Result<Cache> {
		if let Some(cache) = self.lookup(url) {
			return Ok(cache);
		}
		let Some(factory) = &self.default_source else {
			return Err(Error::NotFound);
		};
		let cache = factory(url.to_vec()).await?;
		self.register(url.to_vec(), cache.clone());
		Ok(cache)
	}

	/// Resolve a publish: return the existing cache for `url` if one is
	/// already registered (e.g. a relay's upstream-subscribe placeholder,
	/// which this upload now supersedes), otherwise create and register a
	/// fresh real-time cache and run the `on_publish` hook.
	pub fn resolve_publish(&self, url: &[u8]) -> Cache {
		if let Some(cache) = self.lookup(url) {
			return cache;
		}
		let cache = Cache::new(url.to_vec(), true);
		self.register(url.to_vec(), cache.clone());
		if let Some(hook) = &self.on_publish {
			hook(url.to_vec(), cache.clone());
		}
		cache
	}

	/// Look up an existing source without creating one.
	pub fn lookup(&self, url: &[u8]) -> Option<Cache> {
		self.sources.lock().get(url).cloned()
	}

	/// Register (or replace) the cache for `url`. Used both when a `POST`
	/// creates a brand-new local source and when a publish supersedes a
	/// relay's upstream-subscribe placeholder (spec.md §4.6 step 3).
	pub fn register(&self, url: Vec<u8>, cache: Cache) {
		self.sources.lock_mut().insert(url, cache);
	}

	pub fn remove(&self, url: &[u8]) -> Option<Cache> {
		self.sources.lock_mut().remove(url)
	}

	/// Every currently-registered URL sharing `prefix`, for the relay's
	/// prefix-based notify mechanism (spec.md §4.6).
	pub fn urls_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
		self.sources.lock().keys().filter(|url| url.starts_with(prefix)).cloned().collect()
	}

	/// Start watching for new registrations under `prefix` — the "notify"
	/// mechanism (spec.md §4.6), matched with "pattern is a byte prefix,
	/// not a glob" semantics like `original_source/lib/relay.c`'s
	/// `quicrq_subscribe_pattern`. No wire message for this exists in
	/// spec.md §6's table, so this is the in-process primitive a local
	/// prefix-subscriber (or the relay's own upstream-prefix bookkeeping)
	/// polls against.
	pub fn watch_prefix(&self, prefix: Vec<u8>) -> PrefixWatcher {
		let seen = self.urls_with_prefix(&prefix).into_iter().collect();
		PrefixWatcher {
			node: self.clone(),
			prefix,
			seen,
		}
	}

	pub fn all(&self) -> Vec<(Vec<u8>, Cache)> {
		self.sources.lock().iter().map(|(url, cache)| (url.clone(), cache.clone())).collect()
	}

	/// Resolves once the source map changes (a registration or removal).
	pub async fn changed(&self) {
		self.sources.lock().changed().await
	}

	/// Periodic purge across every locally-owned cache (spec.md §4.6).
	/// `keep_above` gives the lowest active publisher cursor per URL, if
	/// any is tracked for it; a URL with no entry purges down to whatever
	/// `Cache::purge`'s age/completeness rules alone allow.
	pub fn purge_all(&self, now: u64, keep_above: &BTreeMap<Vec<u8>, (u64, u64)>) {
		for (url, cache) in self.sources.lock().iter() {
			cache.purge(now, self.cache_duration_max, keep_above.get(url).copied());
		}
	}
}

impl Default for Node {
	fn default() -> Self {
		Self::new(10_000_000)
	}
}

/// Yields URLs matching a prefix as they're registered, each exactly once
/// (spec.md §4.6 "notify").
pub struct PrefixWatcher {
	node: Node,
	prefix: Vec<u8>,
	seen: std::collections::HashSet<Vec<u8>>,
}

impl PrefixWatcher {
	pub async fn next_new_url(&mut self) -> Vec<u8> {
		loop {
			for url in self.node.urls_with_prefix(&self.prefix) {
				if !self.seen.contains(&url) {
					self.seen.insert(url.clone());
					return url;
				}
			}
			self.node.changed().await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn prefix_watcher_yields_each_new_url_once() {
		let node = Node::default();
		node.register(b"/live/a".to_vec(), Cache::new(b"/live/a".to_vec(), true));

		let mut watcher = node.watch_prefix(b"/live/".to_vec());
		let node_clone = node.clone();
		let handle = tokio::spawn(async move { watcher.next_new_url().await });

		tokio::task::yield_now().await;
		node_clone.register(b"/live/b".to_vec(), Cache::new(b"/live/b".to_vec(), true));

		let url = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
			.await
			.expect("timed out")
			.unwrap();
		assert_eq!(url, b"/live/b".to_vec());
	}

	#[test]
	fn register_then_lookup_roundtrips() {
		let node = Node::default();
		let cache = Cache::new(b"/live/a".to_vec(), true);
		node.register(b"/live/a".to_vec(), cache.clone());

		let found = node.lookup(b"/live/a").unwrap();
		assert_eq!(&*found.url, b"/live/a".as_slice());
	}

	#[test]
	fn lookup_of_unknown_url_is_none() {
		let node = Node::default();
		assert!(node.lookup(b"/live/missing").is_none());
	}

	#[test]
	fn urls_with_prefix_filters_by_prefix() {
		let node = Node::default();
		node.register(b"/live/a".to_vec(), Cache::new(b"/live/a".to_vec(), true));
		node.register(b"/live/b".to_vec(), Cache::new(b"/live/b".to_vec(), true));
		node.register(b"/vod/c".to_vec(), Cache::new(b"/vod/c".to_vec(), true));

		let mut live = node.urls_with_prefix(b"/live/");
		live.sort();
		assert_eq!(live, vec![b"/live/a".to_vec(), b"/live/b".to_vec()]);
	}

	#[test]
	fn remove_drops_registration() {
		let node = Node::default();
		node.register(b"/live/a".to_vec(), Cache::new(b"/live/a".to_vec(), true));
		assert!(node.remove(b"/live/a").is_some());
		assert!(node.lookup(b"/live/a").is_none());
	}

	#[tokio::test]
	async fn resolve_subscribe_without_default_source_is_not_found() {
		let node = Node::default();
		assert!(matches!(node.resolve_subscribe(b"/live/a").await, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn resolve_subscribe_invokes_default_source_and_registers_result() {
		let node = Node::default().with_default_source(Arc::new(|url: Vec<u8>| {
			Box::pin(async move { Ok(Cache::new(url, true)) })
		}));

		let cache = node.resolve_subscribe(b"/live/a").await.unwrap();
		assert_eq!(&*cache.url, b"/live/a".as_slice());
		assert!(node.lookup(b"/live/a").is_some());
	}

	#[test]
	fn resolve_publish_runs_hook_only_for_brand_new_caches() {
		use std::sync::atomic::{AtomicUsize, Ordering};
		let hook_calls = Arc::new(AtomicUsize::new(0));
		let hook_calls_clone = hook_calls.clone();

		let node = Node::default().with_on_publish(Arc::new(move |_url, _cache| {
			hook_calls_clone.fetch_add(1, Ordering::SeqCst);
		}));

		node.resolve_publish(b"/live/a");
		node.resolve_publish(b"/live/a");

		assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
	}
}
