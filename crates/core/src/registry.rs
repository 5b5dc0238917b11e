//! Command registry.
//!
//! Every command a session runs is registered under a caller-chosen
//! [`CommandId`]. The registry map lock is held only long enough to look up
//! or insert an entry; each entry carries its own lock, so output arriving for
//! one command never blocks another.
//!
//! Lifecycle: `Pending` while the session connects, then `Running` until the
//! command completes, fails or is cancelled.
//! Terminal states are final. Results become readable once terminal and stay
//! readable until the entry is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::results::{ErrorRecord, ResultBundle, ResultEvent};

/// Caller-chosen identifier for a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u32);

impl fmt::Display for CommandId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl From<u32> for CommandId {
	fn from(id: u32) -> Self {
		CommandId(id)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
	/// Registered, waiting for a connection.
	Pending,
	Running,
	Completed,
	Failed,
	Cancelled,
}

impl CommandState {
	pub fn is_terminal(self) -> bool {
		!matches!(self, CommandState::Pending | CommandState::Running)
	}
}

/// What a running command should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
	Continue,
	Cancelled,
	TimedOut,
}

/// Size of a parallel operation, recorded when any of its workers failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParallelSummary {
	pub workers: usize,
	pub failed: usize,
}

/// Cancellation flag shared by a command and everything working on its behalf.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[derive(Debug)]
struct EntryState {
	state: CommandState,
	owner: Option<ThreadId>,
	live: ResultBundle,
	frozen: Option<Arc<ResultBundle>>,
	data_set: Option<String>,
	deadline: Option<(Instant, Duration)>,
	parallel: Option<ParallelSummary>,
}

#[derive(Debug)]
struct CommandEntry {
	id: CommandId,
	name: String,
	args: Vec<String>,
	tagged: bool,
	cancel: CancelToken,
	state: Mutex<EntryState>,
}

/// Shared handle on one registered command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
	entry: Arc<CommandEntry>,
}

impl CommandHandle {
	pub fn id(&self) -> CommandId {
		self.entry.id
	}

	pub fn name(&self) -> &str {
		&self.entry.name
	}

	pub fn args(&self) -> &[String] {
		&self.entry.args
	}

	pub fn tagged(&self) -> bool {
		self.entry.tagged
	}

	pub fn state(&self) -> CommandState {
		self.entry.state.lock().state
	}

	pub fn owner(&self) -> Option<ThreadId> {
		self.entry.state.lock().owner
	}

	pub fn cancel_token(&self) -> CancelToken {
		self.entry.cancel.clone()
	}

	pub fn is_cancelled(&self) -> bool {
		self.entry.cancel.is_cancelled()
	}

	pub fn data_set(&self) -> Option<String> {
		self.entry.state.lock().data_set.clone()
	}

	pub fn set_data_set(&self, data: Option<String>) {
		self.entry.state.lock().data_set = data;
	}

	/// Results of a terminal command; `None` while it is still running.
	pub fn results(&self) -> Option<Arc<ResultBundle>> {
		self.entry.state.lock().frozen.clone()
	}

	pub fn parallel_summary(&self) -> Option<ParallelSummary> {
		self.entry.state.lock().parallel
	}

	/// Run timeout configured when the command started.
	pub fn timeout(&self) -> Option<Duration> {
		self.entry.state.lock().deadline.map(|(_, timeout)| timeout)
	}

	pub(crate) fn set_owner(&self, owner: Option<ThreadId>) {
		self.entry.state.lock().owner = owner;
	}

	/// Pending to Running; no effect once the command has moved on.
	pub(crate) fn start(&self) {
		let mut state = self.entry.state.lock();
		if state.state == CommandState::Pending {
			state.state = CommandState::Running;
		}
	}

	pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
		self.entry.state.lock().deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));
	}

	pub(crate) fn set_parallel_summary(&self, summary: ParallelSummary) {
		self.entry.state.lock().parallel = Some(summary);
	}

	/// Decides whether the command may continue.
	///
	/// Cancellation wins over an expired deadline.
	pub fn checkpoint(&self) -> Checkpoint {
		if self.entry.cancel.is_cancelled() {
			return Checkpoint::Cancelled;
		}
		match self.entry.state.lock().deadline {
			Some((deadline, _)) if Instant::now() >= deadline => Checkpoint::TimedOut,
			_ => Checkpoint::Continue,
		}
	}

	/// Appends an event to the live results.
	///
	/// Returns `false` when the command is already terminal and the event was dropped.
	pub(crate) fn record(&self, event: &ResultEvent) -> bool {
		let mut state = self.entry.state.lock();
		if state.state.is_terminal() {
			trace!(target = "p4.registry", id = %self.entry.id, "late output dropped");
			return false;
		}
		state.live.push(event);
		true
	}

	/// Requests cancellation. Has no effect on a terminal command.
	pub fn cancel(&self) -> bool {
		let state = self.entry.state.lock();
		if state.state.is_terminal() {
			return false;
		}
		self.entry.cancel.cancel();
		debug!(target = "p4.registry", id = %self.entry.id, "cancellation requested");
		true
	}

	/// Moves the command into a terminal state and freezes its results.
	///
	/// The first transition wins; later calls return the already frozen results.
	pub(crate) fn finish(&self, outcome: CommandState) -> Arc<ResultBundle> {
		let mut state = self.entry.state.lock();
		if let Some(frozen) = &state.frozen {
			return frozen.clone();
		}
		state.state = if outcome.is_terminal() { outcome } else { CommandState::Completed };
		let frozen = Arc::new(std::mem::take(&mut state.live));
		state.frozen = Some(frozen.clone());
		debug!(target = "p4.registry", id = %self.entry.id, state = ?state.state, "command finished");
		frozen
	}

	/// Completed when no recorded error reached `Failed`, otherwise Failed.
	pub(crate) fn complete(&self) -> Arc<ResultBundle> {
		let success = self.entry.state.lock().live.success();
		self.finish(if success { CommandState::Completed } else { CommandState::Failed })
	}

	pub(crate) fn fail(&self, error: ErrorRecord) -> Arc<ResultBundle> {
		self.record(&ResultEvent::Error(error));
		self.finish(CommandState::Failed)
	}
}

/// Map of command ids to their handles.
#[derive(Debug, Default)]
pub struct CommandRegistry {
	entries: RwLock<HashMap<CommandId, CommandHandle>>,
	staged_data: Mutex<HashMap<CommandId, String>>,
	staged_owners: Mutex<HashMap<CommandId, ThreadId>>,
}

impl CommandRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a pending command.
	///
	/// A terminal entry with the same id is replaced; a running one is an error.
	pub fn begin(&self, id: CommandId, name: &str, args: Vec<String>, tagged: bool) -> Result<CommandHandle> {
		let mut entries = self.entries.write();
		if entries.get(&id).is_some_and(|existing| !existing.state().is_terminal()) {
			return Err(Error::DuplicateActiveId(id));
		}

		// Staged input belongs to the command that actually registers.
		let handle = CommandHandle {
			entry: Arc::new(CommandEntry {
				id,
				name: name.to_string(),
				args,
				tagged,
				cancel: CancelToken::default(),
				state: Mutex::new(EntryState {
					state: CommandState::Pending,
					owner: self.staged_owners.lock().remove(&id),
					live: ResultBundle::default(),
					frozen: None,
					data_set: self.staged_data.lock().remove(&id),
					deadline: None,
					parallel: None,
				}),
			}),
		};
		entries.insert(id, handle.clone());
		trace!(target = "p4.registry", %id, name, "command registered");
		Ok(handle)
	}

	pub fn get(&self, id: CommandId) -> Option<CommandHandle> {
		self.entries.read().get(&id).cloned()
	}

	/// Requests cancellation of a running command; returns whether it was running.
	pub fn cancel(&self, id: CommandId) -> bool {
		self.get(id).is_some_and(|handle| handle.cancel())
	}

	pub fn complete(&self, id: CommandId) -> Result<Arc<ResultBundle>> {
		Ok(self.get(id).ok_or(Error::UnknownCommand(id))?.complete())
	}

	pub fn fail(&self, id: CommandId, error: ErrorRecord) -> Result<Arc<ResultBundle>> {
		Ok(self.get(id).ok_or(Error::UnknownCommand(id))?.fail(error))
	}

	/// Frozen results of a terminal command.
	pub fn results_for(&self, id: CommandId) -> Option<Arc<ResultBundle>> {
		self.get(id)?.results()
	}

	/// Drops a terminal command's entry and results; running commands are kept.
	pub fn release(&self, id: CommandId) -> bool {
		let mut entries = self.entries.write();
		match entries.get(&id) {
			Some(handle) if handle.state().is_terminal() => {
				entries.remove(&id);
				true
			}
			_ => false,
		}
	}

	/// Returns a terminal command's results and releases its entry.
	pub fn take_results(&self, id: CommandId) -> Option<Arc<ResultBundle>> {
		let mut entries = self.entries.write();
		let results = entries.get(&id)?.results()?;
		entries.remove(&id);
		Some(results)
	}

	/// Input to hand to the command with `id` when it prompts.
	///
	/// Applies to the running command, or is held for the next command started with that id.
	pub fn set_data_set(&self, id: CommandId, data: Option<String>) {
		if let Some(handle) = self.get(id).filter(|handle| !handle.state().is_terminal()) {
			handle.set_data_set(data);
			return;
		}
		let mut staged = self.staged_data.lock();
		match data {
			Some(data) => staged.insert(id, data),
			None => staged.remove(&id),
		};
	}

	/// Owner thread for the running command with `id`, or for the next command started with it.
	pub fn set_owner(&self, id: CommandId, thread: ThreadId) {
		match self.get(id).filter(|handle| !handle.state().is_terminal()) {
			Some(handle) => handle.set_owner(Some(thread)),
			None => {
				self.staged_owners.lock().insert(id, thread);
			}
		}
	}

	pub fn data_set(&self, id: CommandId) -> Option<String> {
		if let Some(handle) = self.get(id) {
			return handle.data_set();
		}
		self.staged_data.lock().get(&id).cloned()
	}

	pub fn active_ids(&self) -> Vec<CommandId> {
		let mut ids: Vec<CommandId> = self
			.entries
			.read()
			.values()
			.filter(|handle| !handle.state().is_terminal())
			.map(CommandHandle::id)
			.collect();
		ids.sort();
		ids
	}

	/// Running commands owned by `thread`.
	pub fn owned_by(&self, thread: ThreadId) -> Vec<CommandId> {
		let mut ids: Vec<CommandId> = self
			.entries
			.read()
			.values()
			.filter(|handle| !handle.state().is_terminal() && handle.owner() == Some(thread))
			.map(CommandHandle::id)
			.collect();
		ids.sort();
		ids
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use p4_protocol::{ClientError, ErrorSeverity, InfoMessage};

	fn info(text: &str) -> ResultEvent {
		ResultEvent::Info(InfoMessage::new(0, 0, text))
	}

	#[test]
	fn results_are_hidden_until_terminal() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(1), "dirs", vec!["//depot/*".into()], false).unwrap();
		handle.record(&info("//depot/main"));
		assert!(registry.results_for(CommandId(1)).is_none());

		registry.complete(CommandId(1)).unwrap();
		let results = registry.results_for(CommandId(1)).unwrap();
		assert_eq!(results.info().len(), 1);
		assert_eq!(handle.state(), CommandState::Completed);
	}

	#[test]
	fn duplicate_running_id_is_rejected() {
		let registry = CommandRegistry::new();
		registry.begin(CommandId(5), "sync", Vec::new(), true).unwrap();
		let err = registry.begin(CommandId(5), "sync", Vec::new(), true).unwrap_err();
		assert!(matches!(err, Error::DuplicateActiveId(CommandId(5))));
	}

	#[test]
	fn terminal_id_can_be_reused() {
		let registry = CommandRegistry::new();
		let first = registry.begin(CommandId(2), "info", Vec::new(), true).unwrap();
		first.record(&info("first"));
		first.complete();

		let second = registry.begin(CommandId(2), "info", Vec::new(), true).unwrap();
		second.complete();
		assert!(registry.results_for(CommandId(2)).unwrap().info().is_empty());
	}

	#[test]
	fn terminal_state_is_final() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(3), "sync", Vec::new(), true).unwrap();
		handle.finish(CommandState::Cancelled);

		assert!(!handle.cancel());
		handle.complete();
		assert_eq!(handle.state(), CommandState::Cancelled);
		assert!(!handle.record(&info("late")));
		assert!(handle.results().unwrap().info().is_empty());
	}

	#[test]
	fn failure_severity_decides_completion_state() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(4), "have", Vec::new(), true).unwrap();
		handle.record(&ResultEvent::Error(ClientError::new(ErrorSeverity::Failed, 1, "unknown client").into()));
		handle.complete();
		assert_eq!(handle.state(), CommandState::Failed);
	}

	#[test]
	fn release_keeps_running_commands() {
		let registry = CommandRegistry::new();
		registry.begin(CommandId(8), "sync", Vec::new(), true).unwrap();
		assert!(!registry.release(CommandId(8)));
		assert_eq!(registry.active_ids(), vec![CommandId(8)]);

		registry.complete(CommandId(8)).unwrap();
		assert!(registry.take_results(CommandId(8)).is_some());
		assert!(registry.is_empty());
	}

	#[test]
	fn cancel_is_observed_at_checkpoint() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(9), "sync", Vec::new(), true).unwrap();
		assert_eq!(handle.checkpoint(), Checkpoint::Continue);
		assert!(registry.cancel(CommandId(9)));
		assert_eq!(handle.checkpoint(), Checkpoint::Cancelled);
		assert!(!registry.cancel(CommandId(404)));
	}

	#[test]
	fn expired_deadline_times_out() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(10), "sync", Vec::new(), true).unwrap();
		handle.set_timeout(Some(Duration::ZERO));
		assert_eq!(handle.checkpoint(), Checkpoint::TimedOut);
		assert_eq!(handle.timeout(), Some(Duration::ZERO));
	}

	#[test]
	fn staged_data_set_is_picked_up_by_next_command() {
		let registry = CommandRegistry::new();
		registry.set_data_set(CommandId(11), Some("old\nnew\nnew\n".into()));
		assert_eq!(registry.data_set(CommandId(11)).as_deref(), Some("old\nnew\nnew\n"));

		let handle = registry.begin(CommandId(11), "passwd", Vec::new(), false).unwrap();
		assert_eq!(handle.data_set().as_deref(), Some("old\nnew\nnew\n"));
	}

	#[test]
	fn rejected_duplicate_leaves_staged_input_for_the_next_command() {
		let registry = CommandRegistry::new();
		let running = registry.begin(CommandId(16), "sync", Vec::new(), true).unwrap();
		let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
		// Staged by a caller that saw no live command with this id.
		registry.staged_data.lock().insert(CommandId(16), "answer\n".into());
		registry.staged_owners.lock().insert(CommandId(16), other);

		assert!(matches!(registry.begin(CommandId(16), "passwd", Vec::new(), false), Err(Error::DuplicateActiveId(CommandId(16)))));
		assert_eq!(running.data_set(), None);

		running.complete();
		let next = registry.begin(CommandId(16), "passwd", Vec::new(), false).unwrap();
		assert_eq!(next.data_set().as_deref(), Some("answer\n"));
		assert_eq!(next.owner(), Some(other));
	}

	#[test]
	fn command_is_pending_until_started() {
		let registry = CommandRegistry::new();
		let handle = registry.begin(CommandId(14), "info", Vec::new(), true).unwrap();
		assert_eq!(handle.state(), CommandState::Pending);
		assert_eq!(registry.active_ids(), vec![CommandId(14)]);

		handle.start();
		assert_eq!(handle.state(), CommandState::Running);
		handle.complete();
		handle.start();
		assert_eq!(handle.state(), CommandState::Completed);
	}

	#[test]
	fn staged_owner_is_picked_up_by_next_command() {
		let registry = CommandRegistry::new();
		let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
		registry.set_owner(CommandId(15), other);

		let handle = registry.begin(CommandId(15), "passwd", Vec::new(), false).unwrap();
		assert_eq!(handle.owner(), Some(other));
	}

	#[test]
	fn owned_by_filters_on_owner_thread() {
		let registry = CommandRegistry::new();
		let mine = registry.begin(CommandId(12), "sync", Vec::new(), true).unwrap();
		registry.begin(CommandId(13), "sync", Vec::new(), true).unwrap();
		mine.set_owner(Some(std::thread::current().id()));
		assert_eq!(registry.owned_by(std::thread::current().id()), vec![CommandId(12)]);
	}
}
