//! Idle disconnect.
//!
//! A monitor thread closes the session's connection once no command has been
//! running for the configured wait. The countdown starts when the last
//! command finishes and is abandoned as soon as another one starts. The
//! monitor holds only a weak reference and exits when the session is dropped.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::SessionInner;

/// Upper bound on how long the monitor sleeps before re-checking its session.
const POLL: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct IdleState {
	wait: Duration,
	active: usize,
	last_activity: Instant,
	/// Set when a command finishes; cleared once the connection is closed.
	armed: bool,
	shutdown: bool,
}

#[derive(Debug)]
pub(crate) struct IdleShared {
	state: Mutex<IdleState>,
	signal: Condvar,
}

impl IdleShared {
	pub(crate) fn new(wait: Duration) -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(IdleState {
				wait,
				active: 0,
				last_activity: Instant::now(),
				armed: false,
				shutdown: false,
			}),
			signal: Condvar::new(),
		})
	}

	/// Marks a command as running until the guard drops.
	pub(crate) fn enter(self: &Arc<Self>) -> ActiveGuard {
		self.state.lock().active += 1;
		ActiveGuard { shared: self.clone() }
	}

	fn leave(&self) {
		let mut state = self.state.lock();
		state.active = state.active.saturating_sub(1);
		state.last_activity = Instant::now();
		state.armed = true;
		self.signal.notify_all();
	}

	pub(crate) fn wait(&self) -> Duration {
		self.state.lock().wait
	}

	pub(crate) fn set_wait(&self, wait: Duration) {
		self.state.lock().wait = wait;
		self.signal.notify_all();
	}

	/// Restarts the countdown without arming it.
	pub(crate) fn touch(&self) {
		self.state.lock().last_activity = Instant::now();
	}

	pub(crate) fn disarm(&self) {
		self.state.lock().armed = false;
	}

	/// Returns `true` when the countdown has run out with no command running.
	pub(crate) fn expired_and_quiet(&self) -> bool {
		let state = self.state.lock();
		state.armed && state.active == 0 && !state.wait.is_zero() && state.last_activity.elapsed() >= state.wait
	}

	pub(crate) fn shutdown(&self) {
		self.state.lock().shutdown = true;
		self.signal.notify_all();
	}
}

pub(crate) struct ActiveGuard {
	shared: Arc<IdleShared>,
}

impl Drop for ActiveGuard {
	fn drop(&mut self) {
		self.shared.leave();
	}
}

pub(crate) fn spawn_monitor(shared: Arc<IdleShared>, session: Weak<SessionInner>) -> io::Result<JoinHandle<()>> {
	thread::Builder::new().name("p4-idle".into()).spawn(move || monitor(&shared, &session))
}

fn monitor(shared: &IdleShared, session: &Weak<SessionInner>) {
	loop {
		let mut state = shared.state.lock();
		if state.shutdown {
			return;
		}

		let counting = state.armed && state.active == 0 && !state.wait.is_zero();
		if !counting {
			shared.signal.wait_for(&mut state, POLL);
		} else {
			let deadline = state.last_activity + state.wait;
			let now = Instant::now();
			if now < deadline {
				shared.signal.wait_for(&mut state, (deadline - now).min(POLL));
			} else {
				drop(state);
				let Some(inner) = session.upgrade() else {
					return;
				};
				trace!(target = "p4.idle", "idle wait elapsed");
				inner.idle_disconnect();
				continue;
			}
		}
		drop(state);

		if session.strong_count() == 0 {
			return;
		}
	}
}
