//! Relay composition: wires a [`Node`]'s default-source and on-publish
//! hooks to an upstream connection, so a subscribe or publish for an
//! unknown URL transparently triggers the matching upstream action
//! (spec.md §4.6).
//!
//! Grounded on `moq-relay::remote::{Remotes, Remote}` for the
//! connect-on-demand, cached-connection shape; the upstream hop always
//! uses stream mode (`OPEN_STREAM`/`POST` with `use_datagram = false`) —
//! datagram-mode would need a second per-upstream-connection datagram
//! router identical in shape to [`crate::session::connection::Connection`]'s,
//! and spec.md §4.6 doesn't require the upstream leg specifically use
//! datagrams, so stream mode alone satisfies it without duplicating that
//! dispatcher for a client role.
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::quic::Connection as QuicConnection;
use crate::session::control::{self, SubscribeMode};
use crate::util::Watch;

/// Dials (or returns) the single shared upstream connection for a relay.
struct UpstreamDialer<C: QuicConnection> {
	connect: Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>,
	cached: Watch<Option<C>>,
}

impl<C: QuicConnection> UpstreamDialer<C> {
	async fn connection(&self) -> Result<C> {
		if let Some(conn) = self.cached.lock().clone() {
			return Ok(conn);
		}
		let conn = (self.connect)().await?;
		let mut guard = self.cached.lock_mut();
		if guard.is_none() {
			*guard = Some(conn.clone());
		}
		Ok(guard.clone().expect("just inserted"))
	}
}

/// Builds the [`Node`] for a relay: subscribes to an unknown URL pull data
/// from upstream (spec.md §4.6 subscribe steps 1-4); publishes to an
/// unknown URL also push it upstream (publish steps 1-2). Publish always
/// wins a race with an in-flight upstream subscribe for the same URL,
/// since [`Node::resolve_publish`] reuses (rather than replaces) whatever
/// cache is already registered — including one a subscribe created —  and
/// the subscribe's receive loop simply stops being fed once the upload
/// starts writing into the same cache (spec.md §4.6 publish step 3).
pub fn build_node<C: QuicConnection>(cache_duration_max: u64, connect_upstream: Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>) -> Node {
	let dialer = Arc::new(UpstreamDialer {
		connect: connect_upstream,
		cached: Watch::new(None),
	});

	let default_source = {
		let dialer = dialer.clone();
		Arc::new(move |url: Vec<u8>| {
			let dialer = dialer.clone();
			Box::pin(async move { subscribe_upstream(&*dialer, url).await }) as BoxFuture<'static, Result<Cache>>
		})
	};

	let on_publish = {
		let dialer = dialer.clone();
		Arc::new(move |url: Vec<u8>, cache: Cache| {
			let dialer = dialer.clone();
			tokio::spawn(async move {
				if let Err(err) = publish_upstream(&*dialer, url, cache.clone()).await {
					log::warn!("upstream publish failed, closing local cache: {err}");
					cache.close(err);
				}
			});
		})
	};

	Node::new(cache_duration_max).with_default_source(default_source).with_on_publish(on_publish)
}

async fn subscribe_upstream<C: QuicConnection>(dialer: &UpstreamDialer<C>, url: Vec<u8>) -> Result<Cache> {
	let conn = dialer.connection().await?;
	let cache = Cache::new(url.clone(), true);

	let (mut send, mut recv) = conn.open_bidi().await?;
	control::open_subscribe(&mut send, url, SubscribeMode::Stream).await?;

	let receiver_cache = cache.clone();
	tokio::spawn(async move {
		if let Err(err) = control::drive_stream_receiver(&mut recv, &receiver_cache).await {
			log::info!("upstream subscribe ended: {err}");
			receiver_cache.close(err);
		}
	});

	Ok(cache)
}

async fn publish_upstream<C: QuicConnection>(dialer: &UpstreamDialer<C>, url: Vec<u8>, cache: Cache) -> Result<()> {
	let conn = dialer.connection().await?;
	let (mut send, mut recv) = conn.open_bidi().await?;

	let accept = control::open_publish(&mut send, &mut recv, url, false).await?;
	if accept.use_datagram {
		return Err(Error::protocol("upstream accepted a stream-mode POST as datagram-mode"));
	}

	control::drive_stream_sender(&mut send, cache).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fragment::Fragment;
	use crate::message::{Accept, FinDatagram, Message, OpenStream, Post, Repair};
	use crate::quic::DatagramFeedback;
	use bytes::Bytes;
	use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

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

	/// A connection whose single `open_bidi` call hands back one pre-wired
	/// stream half-pair; the test keeps the peer half to act as the
	/// simulated upstream.
	#[derive(Clone)]
	struct FakeConnection {
		stream: Arc<std::sync::Mutex<Option<(WriteHalf<DuplexStream>, ReadHalf<DuplexStream>)>>>,
	}

	impl QuicConnection for FakeConnection {
		type SendStream = WriteHalf<DuplexStream>;
		type RecvStream = ReadHalf<DuplexStream>;

		async fn open_bidi(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
			Ok(self.stream.lock().unwrap().take().expect("no pre-wired stream left"))
		}

		async fn accept_bidi(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
			unreachable!("not used by relay tests")
		}

		async fn send_datagram(&self, _data: Bytes) -> Result<()> {
			unreachable!("not used by relay tests")
		}

		async fn read_datagram(&self) -> Result<Bytes> {
			unreachable!("not used by relay tests")
		}

		async fn closed(&self) {
			std::future::pending().await
		}

		fn max_datagram_size(&self) -> usize {
			1200
		}

		async fn next_datagram_feedback(&self) -> DatagramFeedback {
			std::future::pending().await
		}
	}

	fn fake_dialer(conn: FakeConnection) -> UpstreamDialer<FakeConnection> {
		UpstreamDialer {
			connect: Arc::new(move || {
				let conn = conn.clone();
				Box::pin(async move { Ok(conn) })
			}),
			cached: Watch::new(None),
		}
	}

	#[tokio::test]
	async fn subscribe_upstream_sends_open_stream_and_fills_cache() {
		let (local, mut remote) = tokio::io::duplex(8192);
		let (local_read, local_write) = split(local);
		let conn = FakeConnection {
			stream: Arc::new(std::sync::Mutex::new(Some((local_write, local_read)))),
		};
		let dialer = fake_dialer(conn);

		let cache = subscribe_upstream(&dialer, b"/live/a".to_vec()).await.unwrap();

		let role = Message::decode(&mut remote).await.unwrap();
		assert!(matches!(role, Message::OpenStream(OpenStream { url }) if url == b"/live/a"));

		Message::from(Repair {
			group_id: 0,
			object_id: 0,
			offset: 0,
			is_last_fragment: true,
			payload: b"hi".to_vec(),
		})
		.encode(&mut remote)
		.await
		.unwrap();
		Message::from(FinDatagram {
			final_group_id: 0,
			final_object_id: 1,
		})
		.encode(&mut remote)
		.await
		.unwrap();

		loop {
			if cache.final_position().is_some() {
				break;
			}
			cache.changed().await;
		}
		assert_eq!(&cache.lookup(0, 0, 0).unwrap().data[..], b"hi");
	}

	#[tokio::test]
	async fn publish_upstream_sends_post_and_streams_cache_content() {
		let (local, mut remote) = tokio::io::duplex(8192);
		let (local_read, local_write) = split(local);
		let conn = FakeConnection {
			stream: Arc::new(std::sync::Mutex::new(Some((local_write, local_read)))),
		};
		let dialer = fake_dialer(conn);

		let cache = Cache::new(b"/live/a".to_vec(), true);
		cache.propose(frag(0, 0, 0, b"hi", true), 0).unwrap();
		cache.learn_end(0, 1);

		let publish_fut = publish_upstream(&dialer, b"/live/a".to_vec(), cache);

		let remote_fut = async {
			let post = Message::decode(&mut remote).await.unwrap();
			assert!(matches!(post, Message::Post(Post { ref url, use_datagram }) if url == b"/live/a" && !use_datagram));

			Message::from(Accept {
				use_datagram: false,
				datagram_stream_id: 0,
			})
			.encode(&mut remote)
			.await
			.unwrap();

			let repair = Message::decode(&mut remote).await.unwrap();
			assert!(matches!(repair, Message::Repair(ref r) if r.payload == b"hi"));

			let fin = Message::decode(&mut remote).await.unwrap();
			assert!(matches!(fin, Message::FinDatagram(f) if f.final_group_id == 0 && f.final_object_id == 1));
		};

		let (publish_result, _) = tokio::join!(publish_fut, remote_fut);
		publish_result.unwrap();
	}
}
