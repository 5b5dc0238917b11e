//! Running one command end to end.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use p4_protocol::{ErrorSeverity, ServerReply, TransferPlan, codes};
use tracing::{debug, info, warn};

use super::slot::LiveConnection;
use super::{PromptRequest, SessionInner};
use crate::broadcast::panic_message;
use crate::error::{ConnectFailure, Error, Result};
use crate::parallel::{ParallelOptions, ParallelTransferCoordinator};
use crate::registry::{Checkpoint, CommandHandle, CommandId, CommandState};
use crate::results::{ErrorKind, ErrorRecord, ResultEvent};
use crate::transport::{CommandIo, CommandRequest, Flow, TransferOutcome, TransportFault};

impl SessionInner {
	pub(crate) fn execute(&self, id: CommandId, name: &str, args: Vec<String>, tagged: bool) -> Result<bool> {
		let handle = self.registry.begin(id, name, args, tagged)?;
		if handle.owner().is_none() {
			handle.set_owner(Some(thread::current().id()));
		}
		debug!(target = "p4.command", %id, name, tagged, "command started");

		let lease = match self.lease() {
			Ok(lease) => lease,
			Err(err) => {
				let record = ErrorRecord::from_error(&err);
				self.deliver(&handle, ResultEvent::Error(record));
				if handle.is_cancelled() {
					self.cancelled(&handle, None);
					return self.report(&handle);
				}
				let results = handle.finish(CommandState::Failed);
				warn!(target = "p4.command", %id, name, error = %err, "command could not reach the server");
				return match self.settings.read().throw_threshold {
					Some(threshold) if ErrorSeverity::Failed >= threshold => Err(err.with_errors(results.errors().to_vec())),
					_ => Ok(false),
				};
			}
		};

		handle.start();
		if handle.checkpoint() == Checkpoint::Cancelled {
			self.cancelled(&handle, Some(&lease.live));
			drop(lease);
			return self.report(&handle);
		}
		let timeout = self.settings.read().command_timeout;
		handle.set_timeout(timeout);
		let values = lease.live.target.values();
		let request = CommandRequest {
			id,
			name: name.to_string(),
			args: handle.args().to_vec(),
			tagged,
			program_name: values.program_name.clone(),
			program_version: values.program_version.clone(),
			protocol: values.protocol.clone(),
			records: Vec::new(),
		};

		let outcome = {
			let mut context = ExecutionContext::new(self, &handle, &lease.live);
			lease.live.transport.run(&request, &mut context)
		};

		match outcome {
			Ok(()) => {
				handle.complete();
			}
			Err(TransportFault::Aborted) => match handle.checkpoint() {
				Checkpoint::Cancelled => self.cancelled(&handle, Some(&lease.live)),
				Checkpoint::TimedOut => {
					let message = format!("Command exceeded its run timeout of {:?}.", timeout.unwrap_or_default());
					self.deliver(&handle, ResultEvent::Error(ErrorRecord::new(ErrorSeverity::Failed, codes::COMMAND_TIMEOUT, message, ErrorKind::Timeout)));
					handle.finish(CommandState::Failed);
					self.abandon(&lease.live.transport, false, None);
					warn!(target = "p4.command", %id, name, ?timeout, "command timed out");
				}
				Checkpoint::Continue => {
					handle.fail(ErrorRecord::new(ErrorSeverity::Failed, 0, "Command aborted.", ErrorKind::Command));
				}
			},
			Err(TransportFault::Lost(message)) => {
				let record = ErrorRecord::new(ErrorSeverity::Failed, codes::CONNECTION_LOST, message, ErrorKind::Connect(ConnectFailure::ConnectionLost));
				self.deliver(&handle, ResultEvent::Error(record.clone()));
				handle.finish(CommandState::Failed);
				self.abandon(&lease.live.transport, false, Some(record));
				warn!(target = "p4.command", %id, name, "connection lost during command");
			}
		}
		drop(lease);

		self.report(&handle)
	}

	/// Terminates a command whose cancellation was observed.
	///
	/// The connection it ran on, if any, is abandoned and the session needs a reconnect.
	fn cancelled(&self, handle: &CommandHandle, live: Option<&LiveConnection>) {
		let id = handle.id();
		let record = ErrorRecord::new(ErrorSeverity::Failed, codes::COMMAND_CANCELLED, "Command cancelled.", ErrorKind::Cancelled);
		self.deliver(handle, ResultEvent::Error(record));
		handle.finish(CommandState::Cancelled);
		if let Some(live) = live {
			let reason = ErrorRecord::from_error(&Error::connect(ConnectFailure::ReconnectRequired, format!("command {id} was cancelled")));
			self.abandon(&live.transport, true, Some(reason));
		}
		info!(target = "p4.command", %id, name = handle.name(), started = live.is_some(), "command cancelled");
	}

	/// Turns a finished command into the caller-facing result.
	fn report(&self, handle: &CommandHandle) -> Result<bool> {
		let id = handle.id();
		let results = handle.results().unwrap_or_default();
		let state = handle.state();
		debug!(target = "p4.command", %id, ?state, errors = results.errors().len(), "command finished");

		if state == CommandState::Cancelled {
			return Err(Error::Cancelled {
				id,
				errors: results.errors().to_vec(),
			});
		}

		let threshold = self.settings.read().throw_threshold;
		let errors = results.errors();
		if threshold.is_some_and(|threshold| !errors.is_empty() && results.max_severity() >= threshold) {
			return Err(categorize(handle, errors.to_vec()));
		}
		Ok(state == CommandState::Completed)
	}
}

fn categorize(handle: &CommandHandle, errors: Vec<ErrorRecord>) -> Error {
	let id = handle.id();
	if errors.iter().any(|err| err.kind == ErrorKind::Timeout) {
		return Error::Timeout {
			id,
			timeout: handle.timeout().unwrap_or_default(),
			errors,
		};
	}
	if let Some(summary) = handle.parallel_summary() {
		return Error::Aggregate {
			id,
			workers: summary.workers,
			failed: summary.failed,
			errors,
		};
	}
	let auth = errors.iter().find_map(|err| match err.kind {
		ErrorKind::Auth(kind) => Some((kind, err.message.clone())),
		_ => None,
	});
	if let Some((kind, message)) = auth {
		return Error::Auth { kind, message, errors };
	}
	let connect = errors.iter().find_map(|err| match err.kind {
		ErrorKind::Connect(kind) => Some((kind, err.message.clone())),
		_ => None,
	});
	if let Some((kind, message)) = connect {
		return Error::Connect {
			kind,
			message,
			fingerprint: None,
			errors,
		};
	}
	Error::Command { id, errors }
}

/// [`CommandIo`] for a command running on the session's connection.
pub(crate) struct ExecutionContext<'a> {
	session: &'a SessionInner,
	handle: &'a CommandHandle,
	live: &'a LiveConnection,
	data_lines: Option<std::vec::IntoIter<String>>,
}

impl<'a> ExecutionContext<'a> {
	pub(crate) fn new(session: &'a SessionInner, handle: &'a CommandHandle, live: &'a LiveConnection) -> Self {
		Self {
			session,
			handle,
			live,
			data_lines: None,
		}
	}

	fn flow(&self) -> Flow {
		match self.handle.checkpoint() {
			Checkpoint::Continue => Flow::Continue,
			Checkpoint::Cancelled | Checkpoint::TimedOut => Flow::Abort,
		}
	}

	/// Next line of the data set; empty once it runs out.
	fn next_data_line(&mut self) -> String {
		let handle = self.handle;
		self.data_lines
			.get_or_insert_with(|| {
				let data = handle.data_set().unwrap_or_default();
				data.lines().map(str::to_string).collect::<Vec<_>>().into_iter()
			})
			.next()
			.unwrap_or_default()
	}
}

impl CommandIo for ExecutionContext<'_> {
	fn emit(&mut self, reply: ServerReply) -> Flow {
		let event = ResultEvent::normalize(reply, self.handle.tagged());
		self.session.deliver(self.handle, event);
		self.flow()
	}

	fn keepalive(&mut self) -> Flow {
		self.flow()
	}

	fn prompt(&mut self, message: &str, echo: bool) -> Option<String> {
		if self.flow().is_abort() {
			return None;
		}

		let on_owner = self.handle.owner().is_none_or(|owner| owner == thread::current().id());
		let answer = match self.session.prompt_handler() {
			Some(handler) if on_owner => {
				let request = PromptRequest {
					command: self.handle.id(),
					message,
					echo,
					cancel: self.handle.cancel_token(),
				};
				match catch_unwind(AssertUnwindSafe(|| handler(&request))) {
					Ok(answer) => answer,
					Err(panic) => {
						warn!(target = "p4.command", id = %self.handle.id(), panic = %panic_message(panic.as_ref()), "prompt handler panicked");
						None
					}
				}
			}
			_ => Some(self.next_data_line()),
		};

		// The handler may have been waiting while the command was cancelled.
		if self.flow().is_abort() {
			return None;
		}
		answer
	}

	fn data_set(&self) -> Option<String> {
		self.handle.data_set()
	}

	fn parallel_transfer(&mut self, plan: TransferPlan) -> TransferOutcome {
		let options = ParallelOptions::from_args(self.handle.args()).unwrap_or_default();
		ParallelTransferCoordinator::new(self.session, self.handle, self.live).run(&plan, &options)
	}
}
