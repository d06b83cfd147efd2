//! Control-stream role negotiation and per-stream drive loops (spec.md
//! §4.5).
//!
//! The original state machine is re-entered one buffer at a time from QUIC
//! callbacks (spec.md §5); here each control stream gets its own async task
//! that owns both stream halves for its whole life. Same invariant — one
//! non-yielding mutation at a time — just expressed as a loop body instead
//! of callback re-entry (the "callback-and-void-pointer polymorphism"
//! re-architecture spec.md §9 calls for). The granular per-byte
//! `initial`/`repair`/`offset` drain states collapse here into "encode one
//! whole message, await the write", since `Message::encode` already does
//! the measure-then-fill step internally (spec.md §9's `write_into`
//! simplification).
use crate::cache::Cache;
use crate::coding::{AsyncRead, AsyncWrite};
use crate::error::{Error, Result};
use crate::fragment::Fragment;
use crate::message::{Accept, FinDatagram, Message, OpenDatagram, OpenStream, Post, Repair};
use crate::publisher::Publisher;

/// How a subscribe was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeMode {
	Stream,
	Datagram { datagram_stream_id: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRequest {
	pub url: Vec<u8>,
	pub use_datagram: bool,
}

/// The role of the local side of a server-accepted bidirectional stream,
/// determined by the first message received on it (spec.md §4.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingRole {
	/// Peer wants to receive `url`; we become a sender.
	Subscribe { url: Vec<u8>, mode: SubscribeMode },
	/// Peer wants to upload `url`; we become a receiver once we reply ACCEPT.
	Publish(PublishRequest),
}

/// Classify an accepted stream by its first message. Any other message as
/// the first one is a protocol violation (spec.md §4.5: "all other
/// message/state combinations are protocol errors").
pub async fn read_role<R: AsyncRead + Unpin>(recv: &mut R) -> Result<IncomingRole> {
	match Message::decode(recv).await? {
		Message::OpenStream(OpenStream { url }) => Ok(IncomingRole::Subscribe {
			url,
			mode: SubscribeMode::Stream,
		}),
		Message::OpenDatagram(OpenDatagram { url, datagram_stream_id }) => Ok(IncomingRole::Subscribe {
			url,
			mode: SubscribeMode::Datagram { datagram_stream_id },
		}),
		Message::Post(post) => Ok(IncomingRole::Publish(PublishRequest {
			url: post.url,
			use_datagram: post.use_datagram,
		})),
		other => Err(Error::protocol(format!("{other:?} is not a legal first message on an accepted stream"))),
	}
}

/// Announce a subscribe on a freshly-opened stream (the local-initiated
/// side of `OPEN_STREAM`/`OPEN_DATAGRAM`).
pub async fn open_subscribe<W: AsyncWrite + Unpin>(send: &mut W, url: Vec<u8>, mode: SubscribeMode) -> Result<()> {
	let msg: Message = match mode {
		SubscribeMode::Stream => OpenStream { url }.into(),
		SubscribeMode::Datagram { datagram_stream_id } => OpenDatagram { url, datagram_stream_id }.into(),
	};
	msg.encode(send).await
}

/// Announce a publish (upload) on a freshly-opened stream, then wait for
/// the peer's `ACCEPT`.
pub async fn open_publish<W, R>(send: &mut W, recv: &mut R, url: Vec<u8>, use_datagram: bool) -> Result<Accept>
where
	W: AsyncWrite + Unpin,
	R: AsyncRead + Unpin,
{
	Message::from(Post { url, use_datagram }).encode(send).await?;
	match Message::decode(recv).await? {
		Message::Accept(accept) => Ok(accept),
		other => Err(Error::protocol(format!("expected ACCEPT, got {other:?}"))),
	}
}

pub async fn send_accept<W: AsyncWrite + Unpin>(send: &mut W, use_datagram: bool, datagram_stream_id: u64) -> Result<()> {
	Message::from(Accept {
		use_datagram,
		datagram_stream_id,
	})
	.encode(send)
	.await
}

/// Receiver-side drive loop for stream-mode content: every `REPAIR` message
/// is a fragment, folded straight into `cache`; `FIN_DATAGRAM` ends the
/// stream cleanly. Used both for a local subscribe's `stream`/`repair`
/// states and for ingesting a stream-mode `POST` upload — the wire shape is
/// identical either way.
pub async fn drive_stream_receiver<R: AsyncRead + Unpin>(recv: &mut R, cache: &Cache) -> Result<()> {
	loop {
		match Message::decode(recv).await? {
			Message::Repair(r) => {
				let fragment = Fragment {
					group_id: r.group_id,
					object_id: r.object_id,
					offset: r.offset,
					data: r.payload.into(),
					is_last_fragment: r.is_last_fragment,
					flags: 0,
					queue_delay: 0,
					nb_objects_previous_group: 0,
					cache_time: 0,
				};
				cache.propose(fragment, 0)?;
			}
			Message::FinDatagram(f) => {
				cache.learn_end(f.final_group_id, f.final_object_id);
				return Ok(());
			}
			other => return Err(Error::protocol(format!("unexpected message in stream-receive state: {other:?}"))),
		}
	}
}

/// Sender-side drive loop for stream-mode content: walks `cache` with a
/// [`Publisher`] in position order, encoding each fragment as `REPAIR` and
/// finishing with `FIN_DATAGRAM` once the final position is reached
/// (spec.md §4.5 sender states `ready`/`repair`/`offset`/`fin` collapsed
/// into one loop body).
pub async fn drive_stream_sender<W: AsyncWrite + Unpin>(send: &mut W, cache: Cache) -> Result<()> {
	let mut publisher = Publisher::new(cache);
	loop {
		match publisher.next_stream_event().await? {
			Some(crate::publisher::StreamEvent::Repair(fragment)) => {
				let repair = Repair {
					group_id: fragment.group_id,
					object_id: fragment.object_id,
					offset: fragment.offset,
					is_last_fragment: fragment.is_last_fragment,
					payload: fragment.data.to_vec(),
				};
				Message::from(repair).encode(send).await?;
			}
			Some(crate::publisher::StreamEvent::Fin {
				final_group_id,
				final_object_id,
			}) => {
				Message::from(FinDatagram {
					final_group_id,
					final_object_id,
				})
				.encode(send)
				.await?;
			}
			None => return Ok(()),
		}
	}
}

/// The control-stream companion to a datagram-mode flow: replies to
/// `REQUEST_REPAIR` by looking the fragment back up in `cache`, and sends
/// `FIN_DATAGRAM` once the cache's final position becomes known (spec.md
/// §4.2 "end-of-media", §4.5 `repair` state).
pub async fn drive_repair_side<W, R>(send: &mut W, recv: &mut R, cache: Cache) -> Result<()>
where
	W: AsyncWrite + Unpin,
	R: AsyncRead + Unpin,
{
	let mut fin_sent = false;
	loop {
		if !fin_sent {
			if let Some((final_group_id, final_object_id)) = cache.final_position() {
				Message::from(FinDatagram {
					final_group_id,
					final_object_id,
				})
				.encode(send)
				.await?;
				fin_sent = true;
			}
		}

		let changed = cache.changed();
		tokio::select! {
			msg = Message::decode(recv) => {
				match msg? {
					Message::RequestRepair(r) => {
						if let Some(fragment) = cache.lookup(r.group_id, r.object_id, r.offset) {
							let repair = Repair {
								group_id: fragment.group_id,
								object_id: fragment.object_id,
								offset: fragment.offset,
								is_last_fragment: fragment.is_last_fragment,
								payload: fragment.data.to_vec(),
							};
							Message::from(repair).encode(send).await?;
						}
					}
					other => return Err(Error::protocol(format!(
						"unexpected message in repair-responder state: {other:?}"
					))),
				}
			}
			_ = changed, if !fin_sent => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use tokio::io::duplex;

	fn frag(group: u64, object: u64, offset: u64, data: &[u8], is_last: bool) -> Fragment {
		Fragment {
			group_id: group,
			object_id: object,
			offset,
			data: Bytes::copy_from_slice(data),
			is_last_fragment: is_last,
			flags: 0,
			queue_delay: 0,
			nb_objects_previous_group: 0,
			cache_time: 0,
		}
	}

	#[tokio::test]
	async fn read_role_classifies_open_stream() {
		let (mut a, mut b) = duplex(4096);
		Message::from(OpenStream { url: b"/live/a".to_vec() }).encode(&mut a).await.unwrap();
		let role = read_role(&mut b).await.unwrap();
		assert_eq!(
			role,
			IncomingRole::Subscribe {
				url: b"/live/a".to_vec(),
				mode: SubscribeMode::Stream,
			}
		);
	}

	#[tokio::test]
	async fn read_role_rejects_repair_as_first_message() {
		let (mut a, mut b) = duplex(4096);
		Message::from(Repair {
			group_id: 0,
			object_id: 0,
			offset: 0,
			is_last_fragment: true,
			payload: vec![1],
		})
		.encode(&mut a)
		.await
		.unwrap();
		assert!(read_role(&mut b).await.is_err());
	}

	#[tokio::test]
	async fn stream_sender_and_receiver_round_trip_an_object() {
		let (mut sender_send, mut receiver_recv) = duplex(8192);

		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"hello ", false), 0).unwrap();
		cache.propose(frag(0, 0, 6, b"world", true), 0).unwrap();
		cache.learn_end(0, 1);

		let send_task = tokio::spawn(async move { drive_stream_sender(&mut sender_send, cache).await });

		let receiver_cache = Cache::new(b"/live/a".to_vec(), true);
		drive_stream_receiver(&mut receiver_recv, &receiver_cache).await.unwrap();

		send_task.await.unwrap().unwrap();

		assert_eq!(receiver_cache.next_position(), crate::fragment::Position { group_id: 0, object_id: 1, offset: 0 });
		let first = receiver_cache.lookup(0, 0, 0).unwrap();
		assert_eq!(&first.data[..], b"hello ");
	}

	#[tokio::test]
	async fn repair_side_answers_request_repair_and_sends_fin() {
		let (mut responder_send, mut requester_recv) = duplex(8192);
		let (mut requester_send, mut responder_recv) = duplex(8192);

		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"payload", true), 0).unwrap();
		let driver_cache = cache.clone();

		let responder = tokio::spawn(async move { drive_repair_side(&mut responder_send, &mut responder_recv, driver_cache).await });

		Message::from(crate::message::RequestRepair {
			group_id: 0,
			object_id: 0,
			offset: 0,
			is_last_fragment: true,
			length: 7,
		})
		.encode(&mut requester_send)
		.await
		.unwrap();

		let repair = Message::decode(&mut requester_recv).await.unwrap();
		assert!(matches!(repair, Message::Repair(r) if r.payload == b"payload"));

		cache.learn_end(0, 1);

		let fin = Message::decode(&mut requester_recv).await.unwrap();
		assert!(matches!(fin, Message::FinDatagram(f) if f.final_group_id == 0 && f.final_object_id == 1));

		drop(requester_send);
		let _ = responder.await;
	}
}
