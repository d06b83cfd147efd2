// Derived from quinn-proto, via moq-transport::coding::varint.
// https://github.com/quinn-rs/quinn/blob/main/quinn-proto/src/varint.rs
// Licensed via Apache 2.0 and MIT

use std::convert::{TryFrom, TryInto};
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// A QUIC-style variable-length integer: 1, 2, 4, or 8 bytes, with the top
/// two bits of the first byte encoding the length. Values are restricted to
/// less than 2^62.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
	pub const MAX: Self = Self((1 << 62) - 1);
	pub const MAX_SIZE: usize = 8;

	pub const fn from_u32(x: u32) -> Self {
		Self(x as u64)
	}

	/// Succeeds iff `x` < 2^62.
	pub fn from_u64(x: u64) -> Result<Self, Error> {
		if x < 2u64.pow(62) {
			Ok(Self(x))
		} else {
			Err(Error::protocol("varint value too large"))
		}
	}

	pub fn into_inner(self) -> u64 {
		self.0
	}

	/// Number of bytes this value encodes to.
	pub fn size(&self) -> usize {
		let x = self.0;
		if x < 2u64.pow(6) {
			1
		} else if x < 2u64.pow(14) {
			2
		} else if x < 2u64.pow(30) {
			4
		} else {
			8
		}
	}

	pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let mut buf = [0; 8];
		r.read_exact(buf[0..1].as_mut()).await?;

		let tag = buf[0] >> 6;
		buf[0] &= 0b0011_1111;

		let x = match tag {
			0b00 => u64::from(buf[0]),
			0b01 => {
				r.read_exact(buf[1..2].as_mut()).await?;
				u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
			}
			0b10 => {
				r.read_exact(buf[1..4].as_mut()).await?;
				u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
			}
			0b11 => {
				r.read_exact(buf[1..8].as_mut()).await?;
				u64::from_be_bytes(buf)
			}
			_ => unreachable!(),
		};

		Ok(Self(x))
	}

	pub async fn encode<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), Error> {
		let x = self.0;
		if x < 2u64.pow(6) {
			w.write_u8(x as u8).await?;
		} else if x < 2u64.pow(14) {
			w.write_u16(0b01 << 14 | x as u16).await?;
		} else if x < 2u64.pow(30) {
			w.write_u32(0b10 << 30 | x as u32).await?;
		} else if x < 2u64.pow(62) {
			w.write_u64(0b11 << 62 | x).await?;
		} else {
			return Err(Error::protocol("malformed varint"));
		}

		Ok(())
	}

	/// Encode into a plain byte buffer, for the datagram fast path where we
	/// build the whole packet before handing it to the transport.
	pub fn encode_buf(&self, buf: &mut Vec<u8>) {
		let x = self.0;
		if x < 2u64.pow(6) {
			buf.push(x as u8);
		} else if x < 2u64.pow(14) {
			buf.extend_from_slice(&(0b01 << 14 | x as u16).to_be_bytes());
		} else if x < 2u64.pow(30) {
			buf.extend_from_slice(&(0b10 << 30 | x as u32).to_be_bytes());
		} else {
			buf.extend_from_slice(&(0b11 << 62 | x).to_be_bytes());
		}
	}

	/// Decode from a plain byte slice, returning the value and the number of
	/// bytes consumed.
	pub fn decode_slice(buf: &[u8]) -> Result<(Self, usize), Error> {
		let first = *buf.first().ok_or_else(|| Error::protocol("truncated varint"))?;
		let tag = first >> 6;
		let len = 1usize << tag;
		if buf.len() < len {
			return Err(Error::protocol("truncated varint"));
		}
		let mut tmp = [0u8; 8];
		tmp[8 - len..].copy_from_slice(&buf[..len]);
		tmp[8 - len] &= 0b0011_1111;
		let x = u64::from_be_bytes(tmp);
		Ok((Self(x), len))
	}
}

impl From<VarInt> for u64 {
	fn from(x: VarInt) -> Self {
		x.0
	}
}

impl From<VarInt> for usize {
	fn from(x: VarInt) -> Self {
		x.0 as usize
	}
}

impl From<u8> for VarInt {
	fn from(x: u8) -> Self {
		Self(x.into())
	}
}

impl From<u32> for VarInt {
	fn from(x: u32) -> Self {
		Self(x.into())
	}
}

impl From<u64> for VarInt {
	fn from(x: u64) -> Self {
		// Callers are expected to only use this for values already known to
		// fit; use `try_from` at protocol boundaries instead.
		debug_assert!(x < 2u64.pow(62));
		Self(x)
	}
}

impl TryFrom<u64> for VarInt {
	type Error = Error;
	fn try_from(x: u64) -> Result<Self, Error> {
		Self::from_u64(x)
	}
}

impl TryFrom<usize> for VarInt {
	type Error = Error;
	fn try_from(x: usize) -> Result<Self, Error> {
		Self::from_u64(x as u64)
	}
}

impl fmt::Debug for VarInt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl fmt::Display for VarInt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_trips_all_widths() {
		for value in [0u64, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, VarInt::MAX.0] {
			let v = VarInt::from_u64(value).unwrap();
			let mut buf = Vec::new();
			v.encode(&mut buf).await.unwrap();
			let mut cursor = std::io::Cursor::new(buf.clone());
			let decoded = VarInt::decode(&mut cursor).await.unwrap();
			assert_eq!(decoded.into_inner(), value);

			let (decoded_slice, len) = VarInt::decode_slice(&buf).unwrap();
			assert_eq!(decoded_slice.into_inner(), value);
			assert_eq!(len, buf.len());
		}
	}

	#[test]
	fn rejects_values_too_large() {
		assert!(VarInt::from_u64(1 << 62).is_err());
	}
}
