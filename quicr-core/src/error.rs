//! Errors shared across the fragment cache, publisher, ack tracker, and
//! session layers. One enum, mirroring `moq-transport::error::Error`, rather
//! than a proliferation of per-module error types: most call sites need to
//! propagate any of these interchangeably (e.g. a closed cache and a closed
//! stream both end up closing a publisher the same way).
use thiserror::Error;

/// A core error, with an associated wire error code per spec.md §7.
#[derive(Clone, Debug, Error)]
pub enum Error {
	/// Clean termination: the writer side was dropped, or the peer closed
	/// cleanly. Not a failure.
	#[error("done")]
	Done,

	/// A resource (cache, track, stream context) was explicitly closed with
	/// an error.
	#[error("closed")]
	Closed,

	/// A chunk/fragment didn't fit the size that was promised up front.
	#[error("wrong size")]
	WrongSize,

	/// Attempted to insert a duplicate key (group/object id, URL, etc).
	#[error("duplicate")]
	Duplicate,

	/// The cache/track is in an incompatible mode (e.g. datagram vs stream).
	#[error("wrong mode")]
	Mode,

	/// The requested URL/track/position is unknown.
	#[error("not found")]
	NotFound,

	/// Allocation or other internal failure. Maps to wire code 0x01.
	#[error("internal error: {0}")]
	Internal(String),

	/// A malformed message, unexpected state transition, or length mismatch.
	/// Maps to wire code 0x02.
	#[error("protocol violation: {0}")]
	Protocol(String),

	/// Failure reading from the underlying transport.
	#[error("read error")]
	Read,

	/// Failure writing to the underlying transport.
	#[error("write error")]
	Write,
}

impl Error {
	/// The integer code sent over the wire (or used to close a QUIC stream),
	/// per spec.md §7.
	pub fn code(&self) -> u32 {
		match self {
			Self::Done | Self::Closed => 0,
			Self::Internal(_) => 0x01,
			Self::Protocol(_) => 0x02,
			Self::NotFound => 404,
			Self::Duplicate => 409,
			Self::Mode => 410,
			Self::WrongSize => 411,
			Self::Read => 502,
			Self::Write => 501,
		}
	}

	pub fn protocol(reason: impl Into<String>) -> Self {
		Self::Protocol(reason.into())
	}

	pub fn internal(reason: impl Into<String>) -> Self {
		Self::Internal(reason.into())
	}
}

impl From<std::io::Error> for Error {
	fn from(_err: std::io::Error) -> Self {
		Self::Read
	}
}

pub type Result<T> = std::result::Result<T, Error>;
