//! A small `Watch<T>` primitive: shared, mutable state plus async change
//! notification. Every cache, track, and relay table in this crate is built
//! on top of it instead of a bare `Arc<Mutex<T>>`, so that readers can block
//! until a writer makes progress without polling.
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

/// Microseconds since the Unix epoch. The one clock every cache timestamp,
/// ack-tracker `sent_time`, and QUIC-binding retransmission deadline is
/// measured against, so that a timestamp recorded in one crate stays
/// comparable to one recorded in another (`quicr-relay`'s QUIC binding reads
/// its own ack/loss feedback against this same clock).
pub fn now_us() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

struct Inner<T> {
	value: Mutex<T>,
	notify: Notify,
}

/// A cloneable handle to shared state. Cloning is cheap (an `Arc` bump); all
/// clones observe the same state and the same notifications.
pub struct Watch<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Watch<T> {
	pub fn new(value: T) -> Self {
		Self {
			inner: Arc::new(Inner {
				value: Mutex::new(value),
				notify: Notify::new(),
			}),
		}
	}

	/// Lock for read. The returned guard can be awaited for the next change
	/// via [`WatchRef::changed`], or upgraded to a write lock via
	/// [`WatchRef::into_mut`].
	pub fn lock(&self) -> WatchRef<'_, T> {
		WatchRef {
			guard: self.inner.value.lock().unwrap(),
			inner: &self.inner,
		}
	}

	/// Lock for write. Every drop of the returned guard wakes all waiters,
	/// even if the caller didn't actually mutate anything; callers that loop
	/// on `changed()` must re-check their condition rather than assume
	/// progress.
	pub fn lock_mut(&self) -> WatchMut<'_, T> {
		WatchMut {
			guard: self.inner.value.lock().unwrap(),
			notify: &self.inner.notify,
		}
	}

	pub fn downgrade(&self) -> WatchWeak<T> {
		WatchWeak {
			inner: Arc::downgrade(&self.inner),
		}
	}
}

impl<T> Clone for Watch<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

pub struct WatchRef<'a, T> {
	guard: MutexGuard<'a, T>,
	inner: &'a Inner<T>,
}

impl<'a, T> WatchRef<'a, T> {
	/// Resolves once the state changes after this call. Must be called
	/// before the guard is dropped to avoid missing a concurrent update.
	pub fn changed(self) -> impl std::future::Future<Output = ()> + 'a {
		let notified = self.inner.notify.notified();
		drop(self.guard);
		notified
	}

	/// Upgrade to a write guard without re-checking the condition that led
	/// here; used when a read-only check determined a mutation is needed.
	pub fn into_mut(self) -> WatchMut<'a, T> {
		WatchMut {
			guard: self.guard,
			notify: &self.inner.notify,
		}
	}
}

impl<'a, T> Deref for WatchRef<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.guard
	}
}

pub struct WatchMut<'a, T> {
	guard: MutexGuard<'a, T>,
	notify: &'a Notify,
}

impl<'a, T> Deref for WatchMut<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.guard
	}
}

impl<'a, T> DerefMut for WatchMut<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.guard
	}
}

impl<'a, T> Drop for WatchMut<'a, T> {
	fn drop(&mut self) {
		self.notify.notify_waiters();
	}
}

/// A weak handle, used to break ownership cycles (e.g. a cache entry that
/// shouldn't keep its whole cache alive).
pub struct WatchWeak<T> {
	inner: std::sync::Weak<Inner<T>>,
}

impl<T> WatchWeak<T> {
	pub fn upgrade(&self) -> Option<Watch<T>> {
		self.inner.upgrade().map(|inner| Watch { inner })
	}
}

impl<T> Clone for WatchWeak<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wakes_waiter_on_mutation() {
		let watch = Watch::new(0);
		let reader = watch.clone();

		let task = tokio::spawn(async move {
			loop {
				let notify = {
					let state = reader.lock();
					if *state == 42 {
						return;
					}
					state.changed()
				};
				notify.await;
			}
		});

		tokio::task::yield_now().await;
		*watch.lock_mut() = 42;

		tokio::time::timeout(std::time::Duration::from_secs(1), task)
			.await
			.expect("timed out waiting for notification")
			.unwrap();
	}
}
