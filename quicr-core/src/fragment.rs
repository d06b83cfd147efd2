//! The fragment data model (spec.md §3).
use bytes::Bytes;

/// A contiguous byte range of one object: the smallest unit that travels the
/// wire, and the unit the cache stores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub data: Bytes,
	/// True if this fragment ends the object; implicitly communicates the
	/// object's final length as `offset + data.len()`.
	pub is_last_fragment: bool,
	pub flags: u8,
	pub queue_delay: u64,
	/// Set (non-zero) only on the first fragment of a group, to let
	/// consumers detect group completion without seeing every fragment of
	/// the previous group (spec.md §3).
	pub nb_objects_previous_group: u64,
	pub cache_time: u64,
}

impl Fragment {
	pub fn data_length(&self) -> usize {
		self.data.len()
	}

	pub fn end_offset(&self) -> u64 {
		self.offset + self.data.len() as u64
	}

	pub fn position(&self) -> Position {
		Position {
			group_id: self.group_id,
			object_id: self.object_id,
			offset: self.offset,
		}
	}
}

/// The `(group_id, object_id, offset)` ordering key used throughout the
/// cache and ack tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
}

impl Position {
	pub const ZERO: Position = Position {
		group_id: 0,
		object_id: 0,
		offset: 0,
	};

	/// Ordering key ignoring offset, for comparing which (group, object) is
	/// ahead.
	pub fn object_key(&self) -> (u64, u64) {
		(self.group_id, self.object_id)
	}
}
