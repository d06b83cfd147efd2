//! Whole-object reassembly over a [`Cache`] (spec.md §4.3).
//!
//! Used wherever something downstream needs whole objects rather than raw
//! fragments: a relay feeding an upstream-subscribed cache, or a local
//! consumer. Maintains its own `(group, object, offset)` cursor with the
//! same semantics as the cache's `next_*`, but independently — a reassembly
//! reader attached late only walks forward from wherever it started,
//! skipping ahead automatically if the cache's retention floor moves past
//! its cursor (`learn_start`) or a group boundary is crossed.
use bytes::{Bytes, BytesMut};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::fragment::{Fragment, Position};

/// One fully-reassembled object, ready to hand to the next relay hop or a
/// local consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReassembledObject {
	pub group_id: u64,
	pub object_id: u64,
	pub data: Bytes,
}

pub struct Reassembly {
	cache: Cache,
	cursor: Position,
}

impl Reassembly {
	pub fn new(cache: Cache) -> Self {
		let cursor = cache.first_position();
		Self {
			cache,
			cursor: Position {
				group_id: cursor.0,
				object_id: cursor.1,
				offset: 0,
			},
		}
	}

	/// Block until either the next fragment lands (`datagram_ready`), the
	/// final position becomes known and the cursor has already reached it
	/// (returns `Ok(None)`), or the cache closes (`close`, surfaced as an
	/// error).
	pub async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
		loop {
			if let Some(fragment) = self.cache.next_in_position_order(self.cursor) {
				let pos = fragment.position();
				if pos == self.cursor {
					self.cursor = Position {
						offset: fragment.end_offset(),
						..pos
					};
					if fragment.is_last_fragment {
						self.cursor = Position {
							group_id: pos.group_id,
							object_id: pos.object_id + 1,
							offset: 0,
						};
					}
					return Ok(Some(fragment));
				} else if pos > self.cursor {
					// The floor moved past us (learn_start) or a group rolled
					// over; the true next position is ahead of our guess.
					self.cursor = pos;
					continue;
				}
			}

			if self.cache.is_closed() {
				return Err(Error::Closed);
			}
			if let Some(final_key) = self.cache.final_position() {
				if self.cursor.object_key() >= final_key {
					return Ok(None);
				}
			}

			self.cache.changed().await;
		}
	}

	/// Block until a whole object is available, concatenating its
	/// fragments in offset order.
	pub async fn next_object(&mut self) -> Result<Option<ReassembledObject>> {
		let mut buf = BytesMut::new();
		let mut current: Option<(u64, u64)> = None;

		loop {
			let Some(fragment) = self.next_fragment().await? else {
				return Ok(None);
			};
			match current {
				None => current = Some((fragment.group_id, fragment.object_id)),
				Some(key) if key != (fragment.group_id, fragment.object_id) => {
					return Err(Error::protocol("reassembly observed an object boundary mid-object"));
				}
				_ => {}
			}
			buf.extend_from_slice(&fragment.data);
			if fragment.is_last_fragment {
				let (group_id, object_id) = current.unwrap();
				return Ok(Some(ReassembledObject {
					group_id,
					object_id,
					data: buf.freeze(),
				}));
			}
		}
	}

	/// Resolves once the cache's final position is known, or immediately if
	/// it already is.
	pub async fn wait_final(&self) -> (u64, u64) {
		loop {
			if let Some(final_key) = self.cache.final_position() {
				return final_key;
			}
			self.cache.changed().await;
		}
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

	#[tokio::test]
	async fn reassembles_object_across_two_fragments() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"hello ", false), 0).unwrap();
		cache.propose(frag(0, 0, 6, b"world", true), 0).unwrap();

		let mut reassembly = Reassembly::new(cache);
		let object = reassembly.next_object().await.unwrap().unwrap();
		assert_eq!(object.data, Bytes::from_static(b"hello world"));
		assert_eq!((object.group_id, object.object_id), (0, 0));
	}

	#[tokio::test]
	async fn waits_for_missing_fragment_before_delivering() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"hello ", false), 0).unwrap();

		let cache_clone = cache.clone();
		let handle = tokio::spawn(async move {
			let mut reassembly = Reassembly::new(cache_clone);
			reassembly.next_object().await.unwrap().unwrap()
		});

		tokio::task::yield_now().await;
		cache.propose(frag(0, 0, 6, b"world", true), 0).unwrap();

		let object = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
			.await
			.expect("timed out")
			.unwrap();
		assert_eq!(object.data, Bytes::from_static(b"hello world"));
	}

	#[tokio::test]
	async fn returns_none_once_final_position_reached() {
		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"only", true), 0).unwrap();
		cache.learn_end(0, 1);

		let mut reassembly = Reassembly::new(cache);
		let object = reassembly.next_object().await.unwrap().unwrap();
		assert_eq!(object.data, Bytes::from_static(b"only"));

		assert!(reassembly.next_object().await.unwrap().is_none());
	}
}
