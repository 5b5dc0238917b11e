//! Fan-out of command output to subscribers.
//!
//! Subscribers register per channel and receive every event on that channel
//! for every command, in the order the command produced them. Delivery is
//! synchronous on the thread running the command. A subscriber that returns
//! an error or panics is logged and skipped; the command and the remaining
//! subscribers are unaffected.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use p4_protocol::ReplyChannel;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::CallbackError;
use crate::registry::CommandId;
use crate::results::ResultEvent;

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(CommandId, &ResultEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Token returned by [`ResultBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
	id: u64,
	channel: ReplyChannel,
}

impl SubscriptionHandle {
	pub fn channel(&self) -> ReplyChannel {
		self.channel
	}
}

#[derive(Default)]
pub struct ResultBroadcaster {
	next_id: AtomicU64,
	subscribers: RwLock<HashMap<ReplyChannel, Vec<(u64, Handler)>>>,
}

impl std::fmt::Debug for ResultBroadcaster {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let counts: HashMap<ReplyChannel, usize> = self.subscribers.read().iter().map(|(channel, subs)| (*channel, subs.len())).collect();
		f.debug_struct("ResultBroadcaster").field("subscribers", &counts).finish()
	}
}

impl ResultBroadcaster {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, channel: ReplyChannel, handler: Handler) -> SubscriptionHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.subscribers.write().entry(channel).or_default().push((id, handler));
		SubscriptionHandle { id, channel }
	}

	/// Removes a subscription; returns whether it was registered.
	pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
		let mut subscribers = self.subscribers.write();
		let Some(list) = subscribers.get_mut(&handle.channel) else {
			return false;
		};
		let before = list.len();
		list.retain(|(id, _)| *id != handle.id);
		list.len() != before
	}

	pub fn subscriber_count(&self, channel: ReplyChannel) -> usize {
		self.subscribers.read().get(&channel).map_or(0, Vec::len)
	}

	/// Delivers `event` to every subscriber of its channel.
	///
	/// The subscriber list is copied before delivery, so handlers may
	/// subscribe or unsubscribe without deadlocking.
	pub fn emit(&self, id: CommandId, event: &ResultEvent) {
		let channel = event.channel();
		let handlers: Vec<Handler> = match self.subscribers.read().get(&channel) {
			Some(list) if !list.is_empty() => list.iter().map(|(_, handler)| handler.clone()).collect(),
			_ => return,
		};

		for handler in handlers {
			match catch_unwind(AssertUnwindSafe(|| handler(id, event))) {
				Ok(Ok(())) => {}
				Ok(Err(err)) => warn!(target = "p4.broadcast", %id, ?channel, error = %err, "subscriber failed"),
				Err(panic) => warn!(target = "p4.broadcast", %id, ?channel, panic = %panic_message(panic.as_ref()), "subscriber panicked"),
			}
		}
	}
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use p4_protocol::InfoMessage;
	use parking_lot::Mutex;

	fn info(text: &str) -> ResultEvent {
		ResultEvent::Info(InfoMessage::new(0, 0, text))
	}

	#[test]
	fn failing_and_panicking_subscribers_are_isolated() {
		let broadcaster = ResultBroadcaster::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		broadcaster.subscribe(ReplyChannel::Info, Arc::new(|_, _| Err(CallbackError::new("boom"))));
		broadcaster.subscribe(ReplyChannel::Info, Arc::new(|_, _| panic!("subscriber bug")));
		let sink = seen.clone();
		broadcaster.subscribe(
			ReplyChannel::Info,
			Arc::new(move |id, event| {
				if let ResultEvent::Info(info) = event {
					sink.lock().push((id, info.text.clone()));
				}
				Ok(())
			}),
		);

		broadcaster.emit(CommandId(1), &info("first"));
		broadcaster.emit(CommandId(1), &info("second"));

		assert_eq!(*seen.lock(), vec![(CommandId(1), "first".to_string()), (CommandId(1), "second".to_string())]);
	}

	#[test]
	fn events_only_reach_their_channel() {
		let broadcaster = ResultBroadcaster::new();
		let hits = Arc::new(Mutex::new(0));
		let counter = hits.clone();
		broadcaster.subscribe(
			ReplyChannel::Text,
			Arc::new(move |_, _| {
				*counter.lock() += 1;
				Ok(())
			}),
		);

		broadcaster.emit(CommandId(1), &info("not text"));
		broadcaster.emit(CommandId(1), &ResultEvent::Text("text".into()));
		assert_eq!(*hits.lock(), 1);
	}

	#[test]
	fn unsubscribe_stops_delivery() {
		let broadcaster = ResultBroadcaster::new();
		let handle = broadcaster.subscribe(ReplyChannel::Info, Arc::new(|_, _| Ok(())));
		assert_eq!(broadcaster.subscriber_count(ReplyChannel::Info), 1);
		assert!(broadcaster.unsubscribe(handle));
		assert!(!broadcaster.unsubscribe(handle));
		assert_eq!(broadcaster.subscriber_count(ReplyChannel::Info), 0);
	}

	#[test]
	fn handler_may_unsubscribe_itself_during_delivery() {
		let broadcaster = Arc::new(ResultBroadcaster::new());
		let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
		let (inner, own) = (broadcaster.clone(), slot.clone());
		let handle = broadcaster.subscribe(
			ReplyChannel::Info,
			Arc::new(move |_, _| {
				if let Some(handle) = own.lock().take() {
					inner.unsubscribe(handle);
				}
				Ok(())
			}),
		);
		*slot.lock() = Some(handle);

		broadcaster.emit(CommandId(1), &info("once"));
		assert_eq!(broadcaster.subscriber_count(ReplyChannel::Info), 0);
	}
}
