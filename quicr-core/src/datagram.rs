//! Datagram fragment wire format (spec.md §6) and the skip marker that
//! denotes a congestion-dropped object.
use crate::coding::VarInt;
use crate::error::Error;

/// Header fields are bounded so that the encoded header never exceeds this
/// many bytes (spec.md §6); the publisher reserves this much space up front
/// and re-encodes in place if a varint width changes (spec.md §9 Design
/// Notes), falling back to the longer form rather than reshuffling payload.
pub const DATAGRAM_HEADER_MAX: usize = 16;

/// `flags == SKIP_FLAGS && is_last_fragment` denotes a zero-length "skip"
/// datagram: the object was dropped upstream due to congestion (spec.md §6,
/// §4.2 step 3).
pub const SKIP_FLAGS: u8 = 0xff;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
	pub datagram_stream_id: u64,
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub queue_delay: u64,
	pub flags: u8,
	pub nb_objects_previous_group: u64,
	pub is_last_fragment: bool,
}

impl DatagramHeader {
	pub fn is_skip_marker(&self) -> bool {
		self.flags == SKIP_FLAGS && self.is_last_fragment
	}

	/// Build a zero-length skip marker for `(group_id, object_id)` (spec.md
	/// §4.2 step 3, §6).
	pub fn skip_marker(datagram_stream_id: u64, group_id: u64, object_id: u64) -> Self {
		Self {
			datagram_stream_id,
			group_id,
			object_id,
			offset: 0,
			queue_delay: 0,
			flags: SKIP_FLAGS,
			nb_objects_previous_group: 0,
			is_last_fragment: true,
		}
	}

	/// Write the header fields into `buf`. Called twice by the publisher:
	/// once to reserve space assuming `is_last_fragment = false`, and again
	/// in place once the real value is known (spec.md §9's "measure then
	/// re-encode" contract) — callers that don't need that dance can just
	/// call this once.
	pub fn encode(&self, buf: &mut Vec<u8>) {
		VarInt::try_from(self.datagram_stream_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.group_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.object_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.offset).unwrap().encode_buf(buf);
		VarInt::try_from(self.queue_delay).unwrap().encode_buf(buf);
		buf.push(self.flags);
		VarInt::try_from(self.nb_objects_previous_group).unwrap().encode_buf(buf);
		buf.push(self.is_last_fragment as u8);
	}

	pub fn encoded_len(&self) -> usize {
		let mut buf = Vec::with_capacity(DATAGRAM_HEADER_MAX);
		self.encode(&mut buf);
		buf.len()
	}

	pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
		let mut pos = 0;
		let (datagram_stream_id, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let (group_id, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let (object_id, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let (offset, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let (queue_delay, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let flags = *buf.get(pos).ok_or_else(|| Error::protocol("truncated datagram header"))?;
		pos += 1;
		let (nb_objects_previous_group, used) = VarInt::decode_slice(&buf[pos..])?;
		pos += used;
		let is_last_fragment = *buf.get(pos).ok_or_else(|| Error::protocol("truncated datagram header"))? != 0;
		pos += 1;

		Ok((
			Self {
				datagram_stream_id: datagram_stream_id.into_inner(),
				group_id: group_id.into_inner(),
				object_id: object_id.into_inner(),
				offset: offset.into_inner(),
				queue_delay: queue_delay.into_inner(),
				flags,
				nb_objects_previous_group: nb_objects_previous_group.into_inner(),
				is_last_fragment,
			},
			pos,
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let header = DatagramHeader {
			datagram_stream_id: 3,
			group_id: 0,
			object_id: 100_000,
			offset: 128,
			queue_delay: 9,
			flags: 0,
			nb_objects_previous_group: 0,
			is_last_fragment: true,
		};

		let mut buf = Vec::new();
		header.encode(&mut buf);
		assert!(buf.len() <= DATAGRAM_HEADER_MAX);

		let (decoded, used) = DatagramHeader::decode(&buf).unwrap();
		assert_eq!(used, buf.len());
		assert_eq!(decoded, header);
	}

	#[test]
	fn skip_marker_is_recognized() {
		let marker = DatagramHeader::skip_marker(1, 5, 6);
		assert!(marker.is_skip_marker());

		let mut buf = Vec::new();
		marker.encode(&mut buf);
		let (decoded, _) = DatagramHeader::decode(&buf).unwrap();
		assert!(decoded.is_skip_marker());
	}
}
