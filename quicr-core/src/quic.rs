//! The external QUIC layer contract (spec.md §6, §2 "external collaborator").
//!
//! `quicr-core` never talks to a concrete QUIC implementation directly;
//! everything above this module is generic over [`Connection`]. The
//! production binary binds this to `quinn` (see `quicr-relay`); tests can
//! bind it to an in-memory pair.
use bytes::Bytes;

use crate::coding::{AsyncRead, AsyncWrite};
use crate::error::Result;

/// ALPN identifying this protocol (spec.md §6).
pub const ALPN: &[u8] = b"quicr-h00";
pub const DEFAULT_PORT: u16 = 853;

/// Initial transport parameters the core expects the QUIC layer to
/// negotiate (spec.md §6). Expressed as plain data so a `quinn::TransportConfig`
/// (or any other binding) can be built from it without this crate knowing
/// about `quinn`.
#[derive(Clone, Copy, Debug)]
pub struct TransportParams {
	pub initial_max_stream_data_bidi_local: u32,
	pub initial_max_stream_data_bidi_remote: u32,
	pub initial_max_stream_data_uni: u32,
	pub initial_max_data: u32,
	pub max_bidi_streams: u64,
	pub max_uni_streams: u64,
	pub idle_timeout_secs: u32,
	pub max_datagram_frame_size: u16,
}

impl TransportParams {
	pub fn server() -> Self {
		Self {
			max_bidi_streams: 2048,
			max_uni_streams: 2050,
			..Self::shared()
		}
	}

	pub fn client() -> Self {
		Self {
			max_bidi_streams: 2049,
			max_uni_streams: 2051,
			..Self::shared()
		}
	}

	fn shared() -> Self {
		Self {
			initial_max_stream_data_bidi_local: 0x200000,
			initial_max_stream_data_bidi_remote: 65535,
			initial_max_stream_data_uni: 65535,
			initial_max_data: 0x100000,
			max_bidi_streams: 0,
			max_uni_streams: 0,
			idle_timeout_secs: 30,
			// PICOQUIC_MAX_PACKET_SIZE in the original; the largest datagram
			// payload a QUIC packet can carry without fragmentation.
			max_datagram_frame_size: 1440,
		}
	}
}

/// A delivery-status report for one previously sent datagram, fed to
/// [`crate::ack::DatagramAckTracker`] (spec.md §4.4, §5). Carries back the
/// exact bytes handed to [`Connection::send_datagram`] plus that call's
/// `sent_time`, mirroring the picoquic `datagram_ack`/`datagram_lost`/
/// `datagram_spurious` callbacks, which hand the application its own
/// previously-sent payload rather than any transport-level identifier — so
/// the core (not the binding) decodes the `DatagramHeader` to recover which
/// stream, group, object, and offset the report is about.
#[derive(Clone, Debug)]
pub enum DatagramFeedback {
	Acked { data: Bytes, sent_time: u64 },
	Lost { data: Bytes, sent_time: u64 },
	Spurious { data: Bytes, sent_time: u64 },
}

/// One QUIC connection, generic over the concrete stream types the binding
/// provides. Streams only need to satisfy `AsyncRead`/`AsyncWrite`, so the
/// control-stream and message codec in this crate work unmodified against
/// any binding.
pub trait Connection: Clone + Send + Sync + 'static {
	type SendStream: AsyncWrite + Unpin + Send + 'static;
	type RecvStream: AsyncRead + Unpin + Send + 'static;

	/// Open a new bidirectional stream (used to start a subscribe/post).
	fn open_bidi(&self) -> impl std::future::Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;

	/// Accept the next bidirectional stream opened by the peer.
	fn accept_bidi(&self) -> impl std::future::Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;

	fn send_datagram(&self, data: Bytes) -> impl std::future::Future<Output = Result<()>> + Send;

	fn read_datagram(&self) -> impl std::future::Future<Output = Result<Bytes>> + Send;

	/// Resolves once the connection is closed, locally or by the peer.
	fn closed(&self) -> impl std::future::Future<Output = ()> + Send;

	/// The largest payload (not counting the QUIC packet's own overhead)
	/// that can be handed to [`Self::send_datagram`].
	fn max_datagram_size(&self) -> usize;

	/// Resolves to the next datagram delivery report this connection can
	/// produce (spec.md §5's `datagram_ack`/`datagram_lost`/
	/// `datagram_spurious` callbacks). A binding with no native per-datagram
	/// delivery signal must still approximate one — there is no other way
	/// for the ack tracker to ever learn about loss — and should say so in
	/// its own docs.
	fn next_datagram_feedback(&self) -> impl std::future::Future<Output = DatagramFeedback> + Send;
}
