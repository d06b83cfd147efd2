//! Per-sender-stream datagram acknowledgement tracking (spec.md §4.4).
//!
//! Outstanding datagrams are kept in an ordered map keyed by
//! `(group_id, object_id, offset)`, same as the cache. Acking the
//! lowest-keyed entry collapses it into a `horizon` — the position below
//! which everything is known delivered — so the tracker's resident size is
//! bounded by outstanding (unacked or out-of-order) fragments rather than by
//! everything ever sent.
use bytes::Bytes;

use crate::datagram::DATAGRAM_HEADER_MAX;
use crate::fragment::Position;

#[derive(Clone, Debug)]
pub struct AckEntry {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub length: u64,
	pub is_last_fragment: bool,
	pub flags: u8,
	pub nb_objects_previous_group: u64,
	pub queue_delay: u64,
	/// Kept so `lost` can re-emit without revisiting the cache.
	pub data: Bytes,
	pub is_acked: bool,
	pub fec_needed: bool,
	pub last_sent_time: u64,
}

impl AckEntry {
	fn position(&self) -> Position {
		Position {
			group_id: self.group_id,
			object_id: self.object_id,
			offset: self.offset,
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum InitOutcome {
	Inserted,
	/// Already tracked, or already subsumed by the horizon — either way the
	/// caller should skip retransmission bookkeeping for it.
	AlreadyPresent,
}

pub struct DatagramAckTracker {
	entries: std::collections::BTreeMap<Position, AckEntry>,
	horizon: Position,
	horizon_is_last_fragment: bool,
}

impl DatagramAckTracker {
	pub fn new() -> Self {
		Self {
			entries: std::collections::BTreeMap::new(),
			horizon: Position::ZERO,
			horizon_is_last_fragment: false,
		}
	}

	pub fn horizon(&self) -> (Position, bool) {
		(self.horizon, self.horizon_is_last_fragment)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn init(&mut self, entry: AckEntry) -> InitOutcome {
		let pos = entry.position();
		if pos < self.horizon || self.entries.contains_key(&pos) {
			return InitOutcome::AlreadyPresent;
		}
		self.entries.insert(pos, entry);
		InitOutcome::Inserted
	}

	pub fn ack(&mut self, group_id: u64, object_id: u64, offset: u64) {
		let pos = Position {
			group_id,
			object_id,
			offset,
		};
		if let Some(entry) = self.entries.get_mut(&pos) {
			entry.is_acked = true;
		}
		self.collapse_horizon();
	}

	/// Treated identically to [`Self::ack`] — a spurious-loss report means
	/// the datagram did arrive after all.
	pub fn spurious(&mut self, group_id: u64, object_id: u64, offset: u64) {
		self.ack(group_id, object_id, offset);
	}

	fn collapse_horizon(&mut self) {
		loop {
			let Some((&pos, entry)) = self.entries.iter().next() else {
				break;
			};
			if !entry.is_acked {
				break;
			}

			let contiguous = if pos.object_key() == self.horizon.object_key() {
				pos.offset == self.horizon.offset
			} else {
				pos.group_id == self.horizon.group_id + 1
					&& pos.object_id == 0
					&& pos.offset == 0
					&& entry.nb_objects_previous_group == self.horizon.object_id
			};
			if !contiguous {
				break;
			}

			let is_last = entry.is_last_fragment;
			let end_offset = pos.offset + entry.length;
			self.entries.remove(&pos);

			self.horizon = if is_last {
				Position {
					group_id: pos.group_id,
					object_id: pos.object_id + 1,
					offset: 0,
				}
			} else {
				Position {
					group_id: pos.group_id,
					object_id: pos.object_id,
					offset: end_offset,
				}
			};
			self.horizon_is_last_fragment = is_last;
		}
	}

	/// A loss report for a datagram sent at `sent_time`. Returns the
	/// datagram(s) to retransmit, splitting the payload if it no longer fits
	/// a single datagram alongside its header (spec.md §4.4, §9).
	pub fn lost(&mut self, group_id: u64, object_id: u64, offset: u64, sent_time: u64, max_datagram_payload: usize) -> Vec<AckEntry> {
		let pos = Position {
			group_id,
			object_id,
			offset,
		};
		let Some(entry) = self.entries.get_mut(&pos) else {
			return Vec::new();
		};
		if entry.is_acked || entry.last_sent_time > sent_time {
			return Vec::new();
		}
		entry.fec_needed = true;

		if entry.data.len() + DATAGRAM_HEADER_MAX <= max_datagram_payload {
			return vec![entry.clone()];
		}

		let split_at = max_datagram_payload.saturating_sub(DATAGRAM_HEADER_MAX).max(1).min(entry.data.len());
		let first_data = entry.data.slice(0..split_at);
		let second_data = entry.data.slice(split_at..);

		let mut first = entry.clone();
		first.data = first_data;
		first.length = first.data.len() as u64;
		first.is_last_fragment = false;

		let mut second = entry.clone();
		second.offset = offset + first.length;
		second.data = second_data;
		second.length = second.data.len() as u64;
		second.nb_objects_previous_group = 0;

		*entry = first.clone();
		self.entries.insert(second.position(), second.clone());

		vec![first, second]
	}
}

impl Default for DatagramAckTracker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(group: u64, object: u64, offset: u64, len: u64, is_last: bool) -> AckEntry {
		AckEntry {
			group_id: group,
			object_id: object,
			offset,
			length: len,
			is_last_fragment: is_last,
			flags: 0,
			nb_objects_previous_group: 0,
			queue_delay: 0,
			data: Bytes::from(vec![0u8; len as usize]),
			is_acked: false,
			fec_needed: false,
			last_sent_time: 0,
		}
	}

	#[test]
	fn horizon_progresses_regardless_of_ack_order() {
		let mut tracker = DatagramAckTracker::new();
		tracker.init(entry(0, 0, 0, 50, false));
		tracker.init(entry(0, 0, 50, 50, true));

		tracker.ack(0, 0, 50);
		tracker.ack(0, 0, 0);

		assert!(tracker.is_empty());
		assert_eq!(tracker.horizon(), (Position { group_id: 0, object_id: 1, offset: 0 }, true));
	}

	#[test]
	fn horizon_crosses_group_boundary_via_nb_objects_previous_group() {
		let mut tracker = DatagramAckTracker::new();
		tracker.init(entry(0, 0, 0, 10, true));
		let mut next_group = entry(1, 0, 0, 10, true);
		next_group.nb_objects_previous_group = 1;
		tracker.init(next_group);

		tracker.ack(0, 0, 0);
		tracker.ack(1, 0, 0);

		assert!(tracker.is_empty());
		assert_eq!(tracker.horizon().0, Position { group_id: 1, object_id: 1, offset: 0 });
	}

	#[test]
	fn lost_requeues_and_splits_oversized_payload() {
		let mut tracker = DatagramAckTracker::new();
		tracker.init(entry(0, 0, 0, 100, true));

		let resent = tracker.lost(0, 0, 0, 0, 50);
		assert_eq!(resent.len(), 2);
		assert!(!resent[0].is_last_fragment);
		assert!(resent[1].is_last_fragment);
		assert_eq!(resent[0].length + resent[1].length, 100);
		assert_eq!(tracker.len(), 2);
	}

	#[test]
	fn lost_ignores_already_acked_entries() {
		let mut tracker = DatagramAckTracker::new();
		tracker.init(entry(0, 0, 0, 10, true));
		tracker.ack(0, 0, 0);

		assert!(tracker.lost(0, 0, 0, 0, 1500).is_empty());
	}

	#[test]
	fn init_is_idempotent() {
		let mut tracker = DatagramAckTracker::new();
		assert_eq!(tracker.init(entry(0, 0, 0, 10, true)), InitOutcome::Inserted);
		assert_eq!(tracker.init(entry(0, 0, 0, 10, true)), InitOutcome::AlreadyPresent);
	}
}
