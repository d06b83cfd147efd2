//! Binds `quicr_core::quic::Connection` to `quinn`.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use quicr_core::error::{Error, Result};
use quicr_core::quic::{Connection as CoreConnection, DatagramFeedback, TransportParams};
use quicr_core::util::now_us;

/// Floor for the retransmission timeout — below this, jitter in `rtt()`
/// estimates would fire spurious loss reports on a healthy link.
const RTO_FLOOR: Duration = Duration::from_millis(100);

struct PendingDatagram {
	data: Bytes,
	sent_time: u64,
	deadline: tokio::time::Instant,
}

#[derive(Clone)]
pub struct QuinnConnection {
	inner: quinn::Connection,
	pending: Arc<Mutex<VecDeque<PendingDatagram>>>,
	last_lost_packets: Arc<AtomicU64>,
}

impl QuinnConnection {
	pub fn new(inner: quinn::Connection) -> Self {
		Self {
			inner,
			pending: Arc::new(Mutex::new(VecDeque::new())),
			last_lost_packets: Arc::new(AtomicU64::new(0)),
		}
	}
}

impl CoreConnection for QuinnConnection {
	type SendStream = quinn::SendStream;
	type RecvStream = quinn::RecvStream;

	async fn open_bidi(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
		self.inner.open_bi().await.map_err(|err| Error::internal(err.to_string()))
	}

	async fn accept_bidi(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
		self.inner.accept_bi().await.map_err(|err| Error::internal(err.to_string()))
	}

	async fn send_datagram(&self, data: Bytes) -> Result<()> {
		self.inner.send_datagram(data.clone()).map_err(|err| Error::internal(err.to_string()))?;

		let rto = self.inner.rtt().mul_f32(2.0).max(RTO_FLOOR);
		self.pending.lock().unwrap().push_back(PendingDatagram {
			data,
			sent_time: now_us(),
			deadline: tokio::time::Instant::now() + rto,
		});
		Ok(())
	}

	async fn read_datagram(&self) -> Result<Bytes> {
		self.inner.read_datagram().await.map_err(|err| Error::internal(err.to_string()))
	}

	async fn closed(&self) {
		let _ = self.inner.closed().await;
	}

	fn max_datagram_size(&self) -> usize {
		self.inner.max_datagram_size().unwrap_or(0)
	}

	/// quinn has no native per-datagram ack/loss callback (unlike the
	/// picoquic `datagram_ack`/`datagram_lost`/`datagram_spurious` triple
	/// this trait method models), so this approximates one: each sent
	/// datagram gets a retransmission deadline of `2 * rtt`; when it
	/// elapses, the connection's own aggregate `path.lost_packets` counter
	/// decides whether to report `Lost` (retransmit via the ack tracker) or
	/// presume `Acked` (let the tracker's horizon advance past it). This is
	/// a real, if coarse, signal tied to actual congestion events rather
	/// than a fabricated one — see DESIGN.md.
	async fn next_datagram_feedback(&self) -> DatagramFeedback {
		loop {
			let next_deadline = { self.pending.lock().unwrap().front().map(|p| p.deadline) };
			match next_deadline {
				Some(deadline) => tokio::time::sleep_until(deadline).await,
				None => std::future::pending::<()>().await,
			}

			let lost_now = self.inner.stats().path.lost_packets;
			let newly_lost = lost_now > self.last_lost_packets.swap(lost_now, Ordering::Relaxed);

			let entry = {
				let mut pending = self.pending.lock().unwrap();
				match pending.front() {
					Some(front) if front.deadline <= tokio::time::Instant::now() => pending.pop_front(),
					_ => None,
				}
			};
			let Some(entry) = entry else { continue };

			return if newly_lost {
				DatagramFeedback::Lost {
					data: entry.data,
					sent_time: entry.sent_time,
				}
			} else {
				DatagramFeedback::Acked {
					data: entry.data,
					sent_time: entry.sent_time,
				}
			};
		}
	}
}

/// Maps this crate's transport-param data onto a `quinn::TransportConfig`.
/// Not a 1:1 field mapping — quinn has no separate bidi-local/remote stream
/// window knob, so `initial_max_stream_data_bidi_local` stands in for both.
pub fn transport_config(params: TransportParams) -> quinn::TransportConfig {
	let mut transport = quinn::TransportConfig::default();
	transport.max_concurrent_bidi_streams(quinn::VarInt::from_u64(params.max_bidi_streams).unwrap_or(quinn::VarInt::MAX));
	transport.max_concurrent_uni_streams(quinn::VarInt::from_u64(params.max_uni_streams).unwrap_or(quinn::VarInt::MAX));
	transport.max_idle_timeout(Some(
		Duration::from_secs(params.idle_timeout_secs as u64)
			.try_into()
			.expect("idle timeout fits in a VarInt"),
	));
	transport.stream_receive_window(quinn::VarInt::from_u32(params.initial_max_stream_data_bidi_local));
	transport.receive_window(quinn::VarInt::from_u32(params.initial_max_data));
	transport.datagram_receive_buffer_size(Some(params.max_datagram_frame_size as usize * 8));
	transport
}

/// Skips server certificate verification; upstream hops in this deployment
/// use self-signed certs, not public CAs.
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls::Certificate,
		_intermediates: &[rustls::Certificate],
		_server_name: &rustls::ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: std::time::SystemTime,
	) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::ServerCertVerified::assertion())
	}
}

pub fn client_crypto() -> rustls::ClientConfig {
	rustls::ClientConfig::builder()
		.with_safe_defaults()
		.with_custom_certificate_verifier(Arc::new(SkipServerVerification))
		.with_no_client_auth()
}
