use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::fragment::{Fragment, Position};

/// The mutable cache body, guarded by a [`crate::util::Watch`]. See
/// `cache/mod.rs` for the storage rationale.
pub(crate) struct State {
	by_position: BTreeMap<Position, Fragment>,
	/// Arrival sequence number -> position, for datagram-mode forwarding.
	arrival_order: BTreeMap<u64, Position>,
	next_arrival_seq: u64,

	pub(crate) first_group_id: u64,
	pub(crate) first_object_id: u64,

	next_group_id: u64,
	next_object_id: u64,
	next_offset: u64,

	final_group_id: Option<u64>,
	final_object_id: Option<u64>,

	pub(crate) nb_object_received: u64,
	pub(crate) is_closed: bool,
	is_cache_real_time: bool,
	close_reason: Option<Error>,
}

impl State {
	pub(crate) fn new(is_cache_real_time: bool) -> Self {
		Self {
			by_position: BTreeMap::new(),
			arrival_order: BTreeMap::new(),
			next_arrival_seq: 0,
			first_group_id: 0,
			first_object_id: 0,
			next_group_id: 0,
			next_object_id: 0,
			next_offset: 0,
			final_group_id: None,
			final_object_id: None,
			nb_object_received: 0,
			is_closed: false,
			is_cache_real_time,
			close_reason: None,
		}
	}

	pub(crate) fn close(&mut self, err: Error) {
		self.is_closed = true;
		self.close_reason = Some(err);
	}

	/// Insert a fragment, trimming it to the byte ranges not already covered
	/// by fragments stored for the same object (spec.md §4.1, §8 "fragments
	/// never overlap after insertion"). Proposing an already-fully-covered
	/// range is a no-op, making `propose` idempotent.
	pub(crate) fn propose(&mut self, fragment: Fragment, now: u64) -> Result<()> {
		if self.is_closed {
			return Err(Error::Closed);
		}
		if (fragment.group_id, fragment.object_id) < (self.first_group_id, self.first_object_id) {
			return Ok(());
		}

		let start = fragment.offset;
		let end = fragment.end_offset();

		let lo = Position {
			group_id: fragment.group_id,
			object_id: fragment.object_id,
			offset: 0,
		};
		let hi = Position {
			group_id: fragment.group_id,
			object_id: fragment.object_id,
			offset: u64::MAX,
		};
		let existing: Vec<(u64, u64)> = self
			.by_position
			.range(lo..=hi)
			.map(|(pos, f)| (pos.offset, f.end_offset()))
			.filter(|&(s, e)| e > start && s < end)
			.collect();

		let mut pieces = Vec::new();
		let mut cursor = start;
		for (e_start, e_end) in existing {
			if cursor < e_start {
				pieces.push((cursor, e_start));
			}
			cursor = cursor.max(e_end);
		}
		if cursor < end {
			pieces.push((cursor, end));
		}

		for (i, (p_start, p_end)) in pieces.into_iter().enumerate() {
			let piece_data = fragment.data.slice((p_start - start) as usize..(p_end - start) as usize);
			let piece = Fragment {
				group_id: fragment.group_id,
				object_id: fragment.object_id,
				offset: p_start,
				data: piece_data,
				is_last_fragment: fragment.is_last_fragment && p_end == end,
				flags: fragment.flags,
				queue_delay: fragment.queue_delay,
				nb_objects_previous_group: if i == 0 { fragment.nb_objects_previous_group } else { 0 },
				cache_time: now,
			};
			let pos = piece.position();
			self.by_position.insert(pos, piece);
			self.arrival_order.insert(self.next_arrival_seq, pos);
			self.next_arrival_seq += 1;
		}

		self.advance_next();
		Ok(())
	}

	/// Walk `next_*` forward over whatever contiguous run of fragments is now
	/// available, counting completed objects and following group rollovers
	/// announced via `nb_objects_previous_group` (spec.md §3, §4.1).
	fn advance_next(&mut self) {
		loop {
			let pos = Position {
				group_id: self.next_group_id,
				object_id: self.next_object_id,
				offset: self.next_offset,
			};
			if let Some(fragment) = self.by_position.get(&pos) {
				self.next_offset = fragment.end_offset();
				if fragment.is_last_fragment {
					self.nb_object_received += 1;
					self.next_object_id += 1;
					self.next_offset = 0;
				}
				continue;
			}

			if self.next_offset == 0 {
				let rollover_pos = Position {
					group_id: self.next_group_id + 1,
					object_id: 0,
					offset: 0,
				};
				if let Some(rollover) = self.by_position.get(&rollover_pos) {
					if rollover.nb_objects_previous_group == self.next_object_id {
						self.next_group_id += 1;
						self.next_object_id = 0;
						continue;
					}
				}
			}
			break;
		}
	}

	/// Advance the retention start point, dropping anything strictly before
	/// it and picking up any fragments already buffered past it (spec.md
	/// §4.1 `learn_start`).
	pub(crate) fn learn_start(&mut self, group_id: u64, object_id: u64) {
		if (group_id, object_id) <= (self.first_group_id, self.first_object_id) {
			return;
		}
		self.first_group_id = group_id;
		self.first_object_id = object_id;

		if (self.next_group_id, self.next_object_id, self.next_offset) < (group_id, object_id, 0) {
			self.next_group_id = group_id;
			self.next_object_id = object_id;
			self.next_offset = 0;
		}

		self.drop_before(group_id, object_id);
		self.advance_next();
	}

	pub(crate) fn learn_end(&mut self, group_id: u64, object_id: u64) {
		self.final_group_id = Some(group_id);
		self.final_object_id = Some(object_id);
	}

	fn drop_before(&mut self, group_id: u64, object_id: u64) {
		let min = (group_id, object_id);
		let removed: HashSet<Position> = self
			.by_position
			.iter()
			.filter(|(pos, _)| pos.object_key() < min)
			.map(|(pos, _)| *pos)
			.collect();
		for pos in &removed {
			self.by_position.remove(pos);
		}
		self.arrival_order.retain(|_, pos| !removed.contains(pos));
	}

	fn drop_object(&mut self, group_id: u64, object_id: u64) {
		let lo = Position {
			group_id,
			object_id,
			offset: 0,
		};
		let hi = Position {
			group_id,
			object_id,
			offset: u64::MAX,
		};
		let removed: HashSet<Position> = self.by_position.range(lo..=hi).map(|(pos, _)| *pos).collect();
		for pos in &removed {
			self.by_position.remove(pos);
		}
		self.arrival_order.retain(|_, pos| !removed.contains(pos));
	}

	fn object_first_seen(&self, group_id: u64, object_id: u64) -> Option<u64> {
		let lo = Position {
			group_id,
			object_id,
			offset: 0,
		};
		let hi = Position {
			group_id,
			object_id,
			offset: u64::MAX,
		};
		self.by_position.range(lo..=hi).map(|(_, f)| f.cache_time).min()
	}

	fn object_is_fully_received(&self, group_id: u64, object_id: u64) -> bool {
		let lo = Position {
			group_id,
			object_id,
			offset: 0,
		};
		let hi = Position {
			group_id,
			object_id,
			offset: u64::MAX,
		};
		let mut expect = 0u64;
		for (pos, fragment) in self.by_position.range(lo..=hi) {
			if pos.offset != expect {
				return false;
			}
			expect = fragment.end_offset();
			if fragment.is_last_fragment {
				return true;
			}
		}
		false
	}

	/// Drop fully-received objects strictly older than `max_age`, stopping at
	/// the first object that isn't eligible, and never advancing past
	/// `keep_above` (spec.md §4.1, §4.6). `first_group_id`/`first_object_id`
	/// only ever serve as a lower bound for the next real fragment, so
	/// advancing them past an object that turns out to start a new group is
	/// self-correcting on the next iteration.
	pub(crate) fn purge(&mut self, now: u64, max_age: u64, keep_above: Option<(u64, u64)>) {
		if !self.is_cache_real_time {
			return;
		}
		loop {
			let lo = Position {
				group_id: self.first_group_id,
				object_id: self.first_object_id,
				offset: 0,
			};
			let Some((&pos, _)) = self.by_position.range(lo..).next() else {
				break;
			};
			let object_key = pos.object_key();
			if let Some(keep) = keep_above {
				if object_key >= keep {
					break;
				}
			}

			let first_seen = self.object_first_seen(object_key.0, object_key.1).unwrap();
			let age_ok = self.is_closed || now.saturating_sub(first_seen) > max_age;
			if !age_ok {
				break;
			}
			let complete_ok = self.is_closed || self.object_is_fully_received(object_key.0, object_key.1);
			if !complete_ok {
				break;
			}

			self.drop_object(object_key.0, object_key.1);
			self.first_group_id = object_key.0;
			self.first_object_id = object_key.1 + 1;
		}
	}

	pub(crate) fn lookup(&self, group_id: u64, object_id: u64, offset: u64) -> Option<Fragment> {
		self.by_position
			.get(&Position {
				group_id,
				object_id,
				offset,
			})
			.cloned()
	}

	pub(crate) fn next_position(&self) -> Position {
		Position {
			group_id: self.next_group_id,
			object_id: self.next_object_id,
			offset: self.next_offset,
		}
	}

	pub(crate) fn final_position(&self) -> Option<(u64, u64)> {
		match (self.final_group_id, self.final_object_id) {
			(Some(g), Some(o)) => Some((g, o)),
			_ => None,
		}
	}

	pub(crate) fn next_in_arrival_order(&self, after: Option<u64>) -> Option<(u64, Fragment)> {
		let from = after.map(|seq| seq + 1).unwrap_or(0);
		let (&seq, pos) = self.arrival_order.range(from..).next()?;
		let fragment = self.by_position.get(pos)?.clone();
		Some((seq, fragment))
	}

	pub(crate) fn next_in_position_order(&self, from: Position) -> Option<Fragment> {
		self.by_position.range(from..).next().map(|(_, f)| f.clone())
	}
}
