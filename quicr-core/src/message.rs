//! Control-stream message protocol (spec.md §4.5, §6).
//!
//! Every message is framed as `length: u16 (BE)` followed by exactly
//! `length` bytes of body, the first of which is the 1-byte tag; `length`
//! does not count itself. We read the whole frame before decoding fields
//! (mirroring `original_source/lib/quicrq.c`'s `quicrq_message_buffer_t`
//! accumulate-then-parse approach) rather than decoding fields directly off
//! the stream the way `moq-transport::message` does, since control messages
//! here can arrive split across arbitrarily many `stream_data` callbacks.
use std::io::Cursor;

use crate::coding::{decode_bytes, encode_bytes, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, VarInt};
use crate::error::Error;

/// Maximum size of a single control message frame. Bounds allocation when
/// buffering a partially-received message.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

macro_rules! message_types {
	{$($name:ident = $val:expr,)*} => {
		#[derive(Clone, Debug)]
		pub enum Message {
			$($name($name)),*
		}

		impl Message {
			fn tag(&self) -> u8 {
				match self {
					$(Self::$name(_) => $val,)*
				}
			}

			fn encode_body(&self, buf: &mut Vec<u8>) {
				match self {
					$(Self::$name(m) => m.encode_body(buf),)*
				}
			}

			fn decode_body(tag: u8, buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
				match tag {
					$($val => Ok(Self::$name($name::decode_body(buf)?)),)*
					other => Err(Error::protocol(format!("unknown control message tag {other}"))),
				}
			}

			/// Read one length-prefixed frame from the stream and decode it.
			pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
				let len = r.read_u16().await? as usize;
				if len == 0 {
					return Err(Error::protocol("zero-length control message"));
				}
				if len > MAX_MESSAGE_LEN {
					return Err(Error::protocol("control message too large"));
				}

				let mut body = vec![0u8; len];
				r.read_exact(&mut body).await?;

				let tag = body[0];
				let mut cursor = Cursor::new(body.split_off(1));
				Self::decode_body(tag, &mut cursor)
			}

			/// Encode this message as one length-prefixed frame.
			pub async fn encode<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), Error> {
				let mut body = vec![self.tag()];
				self.encode_body(&mut body);

				let len: u16 = (body.len() - 1)
					.try_into()
					.map_err(|_| Error::protocol("control message too large to encode"))?;

				w.write_u16(len).await?;
				w.write_all(&body).await?;
				Ok(())
			}
		}

		$(impl From<$name> for Message {
			fn from(m: $name) -> Self {
				Message::$name(m)
			}
		})*
	}
}

message_types! {
	OpenStream = 1,
	OpenDatagram = 2,
	FinDatagram = 3,
	RequestRepair = 4,
	Repair = 5,
	Post = 6,
	Accept = 7,
}

fn read_varint(buf: &mut Cursor<Vec<u8>>) -> Result<VarInt, Error> {
	let rest = &buf.get_ref()[buf.position() as usize..];
	let (v, used) = VarInt::decode_slice(rest)?;
	buf.set_position(buf.position() + used as u64);
	Ok(v)
}

fn read_u8(buf: &mut Cursor<Vec<u8>>) -> Result<u8, Error> {
	let pos = buf.position() as usize;
	let byte = *buf.get_ref().get(pos).ok_or_else(|| Error::protocol("truncated message"))?;
	buf.set_position(buf.position() + 1);
	Ok(byte)
}

fn read_bytes(buf: &mut Cursor<Vec<u8>>, len: usize) -> Result<Vec<u8>, Error> {
	let pos = buf.position() as usize;
	let slice = buf
		.get_ref()
		.get(pos..pos + len)
		.ok_or_else(|| Error::protocol("truncated message"))?;
	let out = slice.to_vec();
	buf.set_position(buf.position() + len as u64);
	Ok(out)
}

fn read_url(buf: &mut Cursor<Vec<u8>>) -> Result<Vec<u8>, Error> {
	let len = read_varint(buf)?.into_inner() as usize;
	if len > crate::coding::MAX_URL_LEN {
		return Err(Error::protocol("url too long"));
	}
	read_bytes(buf, len)
}

fn write_url(url: &[u8], buf: &mut Vec<u8>) {
	VarInt::try_from(url.len()).expect("url length checked at construction").encode_buf(buf);
	buf.extend_from_slice(url);
}

/// Request to open a stream-mode subscription to `url`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenStream {
	pub url: Vec<u8>,
}

impl OpenStream {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		Ok(Self { url: read_url(buf)? })
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		write_url(&self.url, buf);
	}
}

/// Request to open a datagram-mode subscription to `url`, multiplexed under
/// `datagram_stream_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenDatagram {
	pub url: Vec<u8>,
	pub datagram_stream_id: u64,
}

impl OpenDatagram {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let url = read_url(buf)?;
		let datagram_stream_id = read_varint(buf)?.into_inner();
		Ok(Self { url, datagram_stream_id })
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		write_url(&self.url, buf);
		VarInt::try_from(self.datagram_stream_id).unwrap().encode_buf(buf);
	}
}

/// Sent once datagram delivery is complete, announcing the final position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinDatagram {
	pub final_group_id: u64,
	pub final_object_id: u64,
}

impl FinDatagram {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let final_group_id = read_varint(buf)?.into_inner();
		let final_object_id = read_varint(buf)?.into_inner();
		Ok(Self {
			final_group_id,
			final_object_id,
		})
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		VarInt::try_from(self.final_group_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.final_object_id).unwrap().encode_buf(buf);
	}
}

/// Asks the sender to re-send bytes `[offset, offset+length)` of an object,
/// over the control stream instead of as a datagram. Implements the
/// `QUICRQ_ACTION_REQUEST_REPAIR` wire shape that the original C source left
/// unimplemented (spec.md §9 Open Questions; see SPEC_FULL.md).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRepair {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub is_last_fragment: bool,
	pub length: u64,
}

impl RequestRepair {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let group_id = read_varint(buf)?.into_inner();
		let object_id = read_varint(buf)?.into_inner();
		let offset = read_varint(buf)?.into_inner();
		let is_last_fragment = read_u8(buf)? != 0;
		let length = read_varint(buf)?.into_inner();
		Ok(Self {
			group_id,
			object_id,
			offset,
			is_last_fragment,
			length,
		})
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		VarInt::try_from(self.group_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.object_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.offset).unwrap().encode_buf(buf);
		buf.push(self.is_last_fragment as u8);
		VarInt::try_from(self.length).unwrap().encode_buf(buf);
	}
}

/// A retransmitted fragment, sent over the control stream in response to a
/// datagram loss or an explicit [`RequestRepair`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repair {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub is_last_fragment: bool,
	pub payload: Vec<u8>,
}

impl Repair {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let group_id = read_varint(buf)?.into_inner();
		let object_id = read_varint(buf)?.into_inner();
		let offset = read_varint(buf)?.into_inner();
		let is_last_fragment = read_u8(buf)? != 0;
		let length = read_varint(buf)?.into_inner() as usize;
		let payload = read_bytes(buf, length)?;
		Ok(Self {
			group_id,
			object_id,
			offset,
			is_last_fragment,
			payload,
		})
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		VarInt::try_from(self.group_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.object_id).unwrap().encode_buf(buf);
		VarInt::try_from(self.offset).unwrap().encode_buf(buf);
		buf.push(self.is_last_fragment as u8);
		VarInt::try_from(self.payload.len()).unwrap().encode_buf(buf);
		buf.extend_from_slice(&self.payload);
	}
}

/// Request to upload `url` to the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Post {
	pub url: Vec<u8>,
	pub use_datagram: bool,
}

impl Post {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let url = read_url(buf)?;
		let use_datagram = read_u8(buf)? != 0;
		Ok(Self { url, use_datagram })
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		write_url(&self.url, buf);
		buf.push(self.use_datagram as u8);
	}
}

/// Confirms a [`Post`], naming the datagram-stream-id to use if the upload
/// will be sent as datagrams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
	pub use_datagram: bool,
	pub datagram_stream_id: u64,
}

impl Accept {
	fn decode_body(buf: &mut Cursor<Vec<u8>>) -> Result<Self, Error> {
		let use_datagram = read_u8(buf)? != 0;
		let datagram_stream_id = read_varint(buf)?.into_inner();
		Ok(Self {
			use_datagram,
			datagram_stream_id,
		})
	}

	fn encode_body(&self, buf: &mut Vec<u8>) {
		buf.push(self.use_datagram as u8);
		VarInt::try_from(self.datagram_stream_id).unwrap().encode_buf(buf);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn round_trip(msg: Message) -> Message {
		let mut buf = Vec::new();
		msg.encode(&mut buf).await.unwrap();
		let mut cursor = Cursor::new(buf);
		Message::decode(&mut cursor).await.unwrap()
	}

	#[tokio::test]
	async fn round_trips_every_message_type() {
		let cases = vec![
			Message::OpenStream(OpenStream { url: b"/live/a".to_vec() }),
			Message::OpenDatagram(OpenDatagram {
				url: b"/live/a".to_vec(),
				datagram_stream_id: 7,
			}),
			Message::FinDatagram(FinDatagram {
				final_group_id: 12,
				final_object_id: 0,
			}),
			Message::RequestRepair(RequestRepair {
				group_id: 1,
				object_id: 2,
				offset: 100,
				is_last_fragment: true,
				length: 50,
			}),
			Message::Repair(Repair {
				group_id: 1,
				object_id: 2,
				offset: 0,
				is_last_fragment: false,
				payload: vec![1, 2, 3, 4],
			}),
			Message::Post(Post {
				url: b"/live/b".to_vec(),
				use_datagram: true,
			}),
			Message::Accept(Accept {
				use_datagram: true,
				datagram_stream_id: 3,
			}),
		];

		for case in cases {
			let decoded = round_trip(case.clone()).await;
			assert_eq!(format!("{case:?}"), format!("{decoded:?}"));
		}
	}

	#[tokio::test]
	async fn rejects_unknown_tag() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&1u16.to_be_bytes());
		buf.push(0xEE);
		let mut cursor = Cursor::new(buf);
		assert!(Message::decode(&mut cursor).await.is_err());
	}

	#[tokio::test]
	async fn rejects_oversized_frame() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(MAX_MESSAGE_LEN as u16 + 1).to_be_bytes().map(|_| 0));
		// Construct a frame claiming more bytes than MAX_MESSAGE_LEN allows.
		buf.clear();
		buf.extend_from_slice(&u16::MAX.to_be_bytes());
		let mut cursor = Cursor::new(buf);
		let err = Message::decode(&mut cursor).await;
		assert!(err.is_err());
	}
}
