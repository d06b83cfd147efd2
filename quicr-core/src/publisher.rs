//! The per-subscriber publisher state machine (spec.md §4.2).
//!
//! A single `Publisher` can drive either emission mode described by the
//! spec — stream (in `(group, object, offset)` order, framed as repair
//! messages) or datagram (in cache arrival order, with congestion-driven
//! skipping) — against one shared [`Cache`]. The session layer picks which
//! method to call based on whether the peer asked for `OPEN_STREAM` or
//! `OPEN_DATAGRAM`.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::fragment::{Fragment, Position};

/// Decides whether an arriving-but-stale fragment should be dropped rather
/// than sent. The exact oracle used by the original implementation
/// (`quicrq_congestion_check_per_cnx`) isn't specified beyond a ~33ms
/// threshold, so it's modeled as a trait with one default implementation —
/// swap in a different policy per connection without touching the
/// publisher loop.
pub trait CongestionOracle: Send + Sync {
	/// `delay_us` is the arrival-to-now age of the fragment; `flags` are the
	/// fragment's priority flags, carried through unexamined by the default
	/// policy but available to a custom oracle.
	fn should_skip(&self, flags: u8, delay_us: u64) -> bool;
}

/// Drops an object once it has sat in the cache for more than ~33ms before
/// we got around to sending it — the threshold named (without derivation)
/// in the original source.
pub struct DefaultCongestionOracle {
	pub threshold_us: u64,
}

impl Default for DefaultCongestionOracle {
	fn default() -> Self {
		Self { threshold_us: 33_000 }
	}
}

impl CongestionOracle for DefaultCongestionOracle {
	fn should_skip(&self, _flags: u8, delay_us: u64) -> bool {
		delay_us > self.threshold_us
	}
}

#[derive(Default, Clone, Copy)]
struct ObjectRecord {
	bytes_sent: u64,
	final_offset: Option<u64>,
	is_sent: bool,
	is_dropped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
	Repair(Fragment),
	Fin { final_group_id: u64, final_object_id: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatagramEvent {
	Fragment(Fragment),
	/// The object was dropped for congestion; emit a zero-length skip
	/// datagram for it (spec.md §6).
	Skip { group_id: u64, object_id: u64 },
	EndOfMedia { final_group_id: u64, final_object_id: u64 },
}

pub struct Publisher {
	cache: Cache,
	oracle: Arc<dyn CongestionOracle>,

	stream_cursor: Position,
	is_fin_sent: bool,

	arrival_cursor: Option<u64>,
	current_object: Option<(u64, u64)>,
	objects: BTreeMap<(u64, u64), ObjectRecord>,
	end_of_media_sent: bool,
}

impl Publisher {
	pub fn new(cache: Cache) -> Self {
		Self::with_oracle(cache, Arc::new(DefaultCongestionOracle::default()))
	}

	pub fn with_oracle(cache: Cache, oracle: Arc<dyn CongestionOracle>) -> Self {
		let (group_id, object_id) = cache.first_position();
		Self {
			cache,
			oracle,
			stream_cursor: Position {
				group_id,
				object_id,
				offset: 0,
			},
			is_fin_sent: false,
			arrival_cursor: None,
			current_object: None,
			objects: BTreeMap::new(),
			end_of_media_sent: false,
		}
	}

	/// Stream-mode emission: fragments in position order, then a single FIN
	/// once the cursor reaches the cache's known final position.
	pub async fn next_stream_event(&mut self) -> Result<Option<StreamEvent>> {
		loop {
			if let Some(fragment) = self.cache.next_in_position_order(self.stream_cursor) {
				let pos = fragment.position();
				if pos == self.stream_cursor {
					self.stream_cursor = Position {
						offset: fragment.end_offset(),
						..pos
					};
					if fragment.is_last_fragment {
						self.stream_cursor = Position {
							group_id: pos.group_id,
							object_id: pos.object_id + 1,
							offset: 0,
						};
					}
					return Ok(Some(StreamEvent::Repair(fragment)));
				} else if pos > self.stream_cursor {
					self.stream_cursor = pos;
					continue;
				}
			}

			if !self.is_fin_sent {
				if let Some(final_key) = self.cache.final_position() {
					if self.stream_cursor.object_key() >= final_key {
						self.is_fin_sent = true;
						return Ok(Some(StreamEvent::Fin {
							final_group_id: final_key.0,
							final_object_id: final_key.1,
						}));
					}
				}
			}

			if self.cache.is_closed() {
				return Err(Error::Closed);
			}
			if self.is_fin_sent {
				return Ok(None);
			}

			self.cache.changed().await;
		}
	}

	/// Datagram-mode emission: fragments in arrival order, skipping objects
	/// the congestion oracle rejects and pruning the per-object bookkeeping
	/// as objects finish sending (spec.md §4.2 steps 1-5).
	pub async fn next_datagram_event(&mut self, now: u64) -> Result<Option<DatagramEvent>> {
		loop {
			let next = self.cache.next_in_arrival_order(self.arrival_cursor);

			let Some((seq, fragment)) = next else {
				if self.cache.is_closed() {
					return Err(Error::Closed);
				}
				if let Some(final_key) = self.cache.final_position() {
					if !self.end_of_media_sent {
						self.end_of_media_sent = true;
						return Ok(Some(DatagramEvent::EndOfMedia {
							final_group_id: final_key.0,
							final_object_id: final_key.1,
						}));
					}
					return Ok(None);
				}
				self.cache.changed().await;
				continue;
			};

			self.arrival_cursor = Some(seq);
			let key = (fragment.group_id, fragment.object_id);
			self.current_object = Some(key);

			if self.objects.get(&key).map(|r| r.is_dropped).unwrap_or(false) {
				continue;
			}

			let delay_us = now.saturating_sub(fragment.cache_time);
			if self.oracle.should_skip(fragment.flags, delay_us) {
				self.objects.entry(key).or_default().is_dropped = true;
				self.prune_objects();
				return Ok(Some(DatagramEvent::Skip {
					group_id: key.0,
					object_id: key.1,
				}));
			}

			{
				let record = self.objects.entry(key).or_default();
				record.bytes_sent += fragment.data_length() as u64;
				if fragment.is_last_fragment {
					record.final_offset = Some(fragment.end_offset());
				}
				if record.final_offset.map(|f| record.bytes_sent >= f).unwrap_or(false) {
					record.is_sent = true;
				}
			}

			self.prune_objects();
			return Ok(Some(DatagramEvent::Fragment(fragment)));
		}
	}

	/// Drop leading fully-sent object records, keeping only the one
	/// currently in flight (spec.md §4.2 step 5, bounding memory).
	fn prune_objects(&mut self) {
		while let Some((&key, record)) = self.objects.iter().next() {
			if !record.is_sent || Some(key) == self.current_object {
				break;
			}
			self.objects.remove(&key);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

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

	#[tokio::test]
	async fn stream_mode_emits_fragments_then_fin() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"abc", true), 0).unwrap();
		cache.learn_end(0, 1);

		let mut publisher = Publisher::new(cache);
		let first = publisher.next_stream_event().await.unwrap().unwrap();
		assert!(matches!(first, StreamEvent::Repair(f) if f.offset == 0));

		let second = publisher.next_stream_event().await.unwrap().unwrap();
		assert!(matches!(second, StreamEvent::Fin { final_group_id: 0, final_object_id: 1 }));

		assert!(publisher.next_stream_event().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn datagram_mode_emits_in_arrival_order_completeness() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 100, b"second", true), 0).unwrap();
		cache.propose(frag(0, 0, 0, b"first_", false), 0).unwrap();
		cache.learn_end(0, 1);

		let mut publisher = Publisher::new(cache);
		let first = publisher.next_datagram_event(0).await.unwrap().unwrap();
		let second = publisher.next_datagram_event(0).await.unwrap().unwrap();

		assert!(matches!(first, DatagramEvent::Fragment(f) if f.offset == 100));
		assert!(matches!(second, DatagramEvent::Fragment(f) if f.offset == 0));

		let end = publisher.next_datagram_event(0).await.unwrap().unwrap();
		assert!(matches!(end, DatagramEvent::EndOfMedia { final_group_id: 0, final_object_id: 1 }));
	}

	#[tokio::test]
	async fn datagram_mode_skips_congested_object_once() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"stale", true), 0).unwrap();
		cache.propose(frag(0, 1, 0, b"fresh", true), 0).unwrap();

		struct AlwaysSkipFirstObject;
		impl CongestionOracle for AlwaysSkipFirstObject {
			fn should_skip(&self, _flags: u8, delay_us: u64) -> bool {
				delay_us > 0
			}
		}

		let mut publisher = Publisher::with_oracle(cache, Arc::new(AlwaysSkipFirstObject));
		let first = publisher.next_datagram_event(1_000).await.unwrap().unwrap();
		assert!(matches!(first, DatagramEvent::Skip { group_id: 0, object_id: 0 }));

		let second = publisher.next_datagram_event(0).await.unwrap().unwrap();
		assert!(matches!(second, DatagramEvent::Fragment(f) if f.object_id == 1));
	}
}
