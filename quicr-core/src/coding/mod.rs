mod varint;
pub use varint::VarInt;

pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Maximum length of an opaque URL we'll accept off the wire. URLs are not
/// interpreted (spec.md §1 Non-goals); this only bounds allocation.
pub const MAX_URL_LEN: usize = 16 * 1024;

/// Decode a varint-length-prefixed opaque byte string (used for URLs, which
/// are matched only by equality or prefix — never parsed).
pub async fn decode_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, Error> {
	let len = VarInt::decode(r).await?.into_inner() as usize;
	if len > MAX_URL_LEN {
		return Err(Error::protocol("string too long"));
	}
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf).await?;
	Ok(buf)
}

pub async fn encode_bytes<W: AsyncWrite + Unpin>(data: &[u8], w: &mut W) -> Result<(), Error> {
	VarInt::try_from(data.len())?.encode(w).await?;
	w.write_all(data).await?;
	Ok(())
}
