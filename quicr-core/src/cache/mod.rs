//! The per-URL fragment cache (spec.md §3, §4.1).
//!
//! Storage is split exactly as spec.md describes: an ordered map keyed by
//! `(group_id, object_id, offset)` for lookup-by-position and object-order
//! iteration, and a separate arrival-order index for datagram-mode
//! publishers that forward without reordering. Rather than an intrusive
//! splay tree plus doubly linked list (the C original,
//! `original_source/lib/fragment.c`), we use two `BTreeMap`s: fragments are
//! owned once by `by_position`, and `arrival_order` maps a monotonically
//! increasing arrival sequence number to the fragment's position — so a
//! publisher's arrival cursor is just a `u64` sequence number, robust across
//! purges (spec.md §9's "generation-counted handle" note) since looking up
//! "the next fragment after seq N" via `BTreeMap::range` simply skips
//! anything purged in between.
mod state;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::fragment::{Fragment, Position};
use crate::util::Watch;

pub(crate) use state::State;

/// A shared handle to one URL's fragment cache. Cloning is cheap; every
/// clone observes the same underlying state (spec.md §3: "the cache
/// outlives each [publisher]").
#[derive(Clone)]
pub struct Cache {
	state: Watch<State>,
	pub url: Arc<[u8]>,
}

impl Cache {
	pub fn new(url: impl Into<Vec<u8>>, is_cache_real_time: bool) -> Self {
		Self {
			state: Watch::new(State::new(is_cache_real_time)),
			url: Arc::from(url.into()),
		}
	}

	/// Insert a fragment, splitting it to enforce non-overlap with anything
	/// already stored for that object (spec.md §4.1 `propose`).
	pub fn propose(&self, fragment: Fragment, now: u64) -> Result<()> {
		let mut state = self.state.lock_mut();
		state.propose(fragment, now)?;
		Ok(())
	}

	/// Move the retention/contiguity start point forward, discarding
	/// anything strictly before it (spec.md §4.1 `learn_start`).
	pub fn learn_start(&self, group_id: u64, object_id: u64) {
		self.state.lock_mut().learn_start(group_id, object_id);
	}

	/// Record the final position of the media, once known (spec.md §4.1
	/// `learn_end`).
	pub fn learn_end(&self, group_id: u64, object_id: u64) {
		self.state.lock_mut().learn_end(group_id, object_id);
	}

	/// Drop fully-received objects older than `max_age`, never purging at or
	/// above `keep_above` (an active publisher's read cursor). Real-time
	/// caches only; a no-op otherwise (spec.md §4.1 `purge`, §4.6).
	pub fn purge(&self, now: u64, max_age: u64, keep_above: Option<(u64, u64)>) {
		self.state.lock_mut().purge(now, max_age, keep_above);
	}

	pub fn lookup(&self, group_id: u64, object_id: u64, offset: u64) -> Option<Fragment> {
		self.state.lock().lookup(group_id, object_id, offset)
	}

	pub fn next_position(&self) -> Position {
		self.state.lock().next_position()
	}

	pub fn first_position(&self) -> (u64, u64) {
		let state = self.state.lock();
		(state.first_group_id, state.first_object_id)
	}

	pub fn final_position(&self) -> Option<(u64, u64)> {
		self.state.lock().final_position()
	}

	pub fn nb_object_received(&self) -> u64 {
		self.state.lock().nb_object_received
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().is_closed
	}

	/// Close the cache (its writer went away, or a protocol/transport error
	/// occurred). Further proposals are rejected.
	pub fn close(&self, err: Error) {
		self.state.lock_mut().close(err);
	}

	/// Resolves the next time the cache's state changes (a new fragment, a
	/// `learn_start`/`learn_end`, or a close). Callers must re-check their
	/// condition after waking, since unrelated changes also wake.
	pub async fn changed(&self) {
		let notify = self.state.lock().changed();
		notify.await;
	}

	/// The next fragment strictly after arrival-sequence `after` (`None`
	/// means "from the very start of whatever's still cached"), used by
	/// datagram-mode publishers (spec.md §4.2).
	pub fn next_in_arrival_order(&self, after: Option<u64>) -> Option<(u64, Fragment)> {
		self.state.lock().next_in_arrival_order(after)
	}

	/// The next fragment at or after `from` in `(group, object, offset)`
	/// order, used by stream-mode publishers and repair lookups (spec.md
	/// §4.2, §4.5).
	pub fn next_in_position_order(&self, from: Position) -> Option<Fragment> {
		self.state.lock().next_in_position_order(from)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frag(group: u64, object: u64, offset: u64, data: &[u8], is_last: bool) -> Fragment {
		Fragment {
			group_id: group,
			object_id: object,
			offset,
			data: Bytes::copy_from_slice(data),
			is_last_fragment: is_last,
			flags: 0,
			queue_delay: 0,
			nb_objects_previous_group: 0,
			cache_time: 0,
		}
	}

	#[test]
	fn publish_subscribe_one_object() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, &[0u8; 100], false), 0).unwrap();
		cache.propose(frag(0, 0, 100, &[1u8; 100], true), 0).unwrap();

		assert_eq!(cache.next_position(), Position { group_id: 0, object_id: 1, offset: 0 });
		assert_eq!(cache.nb_object_received(), 1);
	}

	#[test]
	fn out_of_order_arrival() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 100, &[1u8; 100], true), 0).unwrap();
		cache.propose(frag(0, 0, 0, &[0u8; 100], false), 0).unwrap();

		assert_eq!(cache.next_position(), Position { group_id: 0, object_id: 1, offset: 0 });

		let (seq0, first) = cache.next_in_arrival_order(None).unwrap();
		assert_eq!(first.offset, 100);
		let (_, second) = cache.next_in_arrival_order(Some(seq0)).unwrap();
		assert_eq!(second.offset, 0);
	}

	#[test]
	fn group_rollover() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"a", true), 0).unwrap();
		cache.propose(frag(0, 1, 0, b"b", true), 0).unwrap();

		let mut second = frag(1, 0, 0, b"c", true);
		second.nb_objects_previous_group = 2;
		cache.propose(second, 0).unwrap();

		assert_eq!(cache.next_position(), Position { group_id: 1, object_id: 1, offset: 0 });
	}

	#[test]
	fn idempotent_propose() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		let f = frag(0, 0, 0, b"hello world", true);
		cache.propose(f.clone(), 0).unwrap();
		cache.propose(f, 0).unwrap();

		assert_eq!(cache.next_position(), Position { group_id: 0, object_id: 1, offset: 0 });
		assert_eq!(cache.nb_object_received(), 1);
	}

	#[test]
	fn overlapping_fragments_do_not_duplicate_bytes() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"0123456789", false), 0).unwrap();
		// Overlaps [0,10) and extends to 15, is_last.
		cache.propose(frag(0, 0, 0, b"01234567890ABCD", true), 0).unwrap();

		let reconstructed = {
			let mut out = Vec::new();
			let mut pos = Position::ZERO;
			while let Some(f) = cache.next_in_position_order(pos) {
				out.extend_from_slice(&f.data);
				pos = Position {
					offset: f.end_offset(),
					..f.position()
				};
				if f.is_last_fragment {
					break;
				}
			}
			out
		};

		assert_eq!(reconstructed, b"01234567890ABCD");
		assert_eq!(cache.next_position(), Position { group_id: 0, object_id: 1, offset: 0 });
	}

	#[test]
	fn cache_purge_advances_first_object() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		for obj in 0..10u64 {
			cache.propose(frag(0, obj, 0, b"x", true), 0).unwrap();
		}
		assert_eq!(cache.nb_object_received(), 10);

		// Nothing is older than max_age yet.
		cache.purge(5_000_000, 5_000_000, None);
		assert_eq!(cache.first_position(), (0, 0));

		// 6s later, everything received at time 0 is strictly older than 5s.
		cache.purge(6_000_000, 5_000_000, None);
		assert_eq!(cache.first_position(), (0, 10));
		assert!(cache.lookup(0, 0, 0).is_none());
	}

	#[test]
	fn purge_respects_active_subscriber_cursor() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		for obj in 0..5u64 {
			cache.propose(frag(0, obj, 0, b"x", true), 0).unwrap();
		}

		cache.purge(10_000_000, 1, Some((0, 2)));
		assert_eq!(cache.first_position(), (0, 2));
		assert!(cache.lookup(0, 2, 0).is_some());
	}

	#[test]
	fn learn_start_drops_earlier_objects_and_wakes_late_subscribers() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		for obj in 0..5u64 {
			cache.propose(frag(0, obj, 0, b"x", true), 0).unwrap();
		}

		cache.learn_start(0, 3);
		assert!(cache.lookup(0, 1, 0).is_none());
		assert!(cache.lookup(0, 3, 0).is_some());
		assert_eq!(cache.first_position(), (0, 3));
	}
}
