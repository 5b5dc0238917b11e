//! Transport abstraction.
//!
//! A [`Connector`] opens connections; a [`Transport`] is one open connection.
//! The session layer never speaks a wire protocol itself: it hands a
//! [`CommandRequest`] to the transport together with a [`CommandIo`] sink,
//! and the transport streams replies into the sink while the command runs.
//!
//! Every call into [`CommandIo`] doubles as a cancellation checkpoint: when
//! it answers [`Flow::Abort`] the transport must stop the command and return
//! [`TransportFault::Aborted`].

pub mod fake;

use std::sync::Arc;

use p4_protocol::{ServerProtocol, ServerReply, TaggedRecord, TransferPlan};
use thiserror::Error;

use crate::config::ConfigSnapshot;
use crate::credentials::{Credential, LoginOptions, LogoutOptions};
use crate::error::Result;
use crate::registry::CommandId;

pub use fake::{ExecutedCommand, FakeCall, FakeConnector, FakeHandler, FakeServer, FakeServerBuilder};

/// Opens connections to a server.
pub trait Connector: Send + Sync {
	/// Opens a connection and performs the handshake, without authenticating.
	fn connect(&self, target: &ConfigSnapshot) -> Result<Connection>;
}

/// An open connection and what the server reported about itself.
#[derive(Clone)]
pub struct Connection {
	pub transport: Arc<dyn Transport>,
	pub server: ServerProtocol,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection").field("server", &self.server).finish_non_exhaustive()
	}
}

/// How a connection proves the user's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
	None,
	Password(String),
	Ticket(Credential),
}

/// One open connection.
///
/// Implementations must allow concurrent [`run`](Transport::run) calls from
/// several threads. Dropping the last handle closes the connection.
pub trait Transport: Send + Sync {
	fn authenticate(&self, user: &str, auth: &Authentication) -> Result<()>;

	/// Exchanges a password for a ticket.
	fn login(&self, user: &str, password: &str, options: &LoginOptions) -> Result<Credential>;

	/// Invalidates the user's tickets on the server.
	fn logout(&self, user: &str, options: &LogoutOptions) -> Result<()>;

	fn run(&self, request: &CommandRequest, io: &mut dyn CommandIo) -> std::result::Result<(), TransportFault>;

	fn is_alive(&self) -> bool;

	/// Closes the connection; commands still running on it fail with [`TransportFault::Lost`].
	fn close(&self);
}

/// A command as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandRequest {
	pub id: CommandId,
	pub name: String,
	pub args: Vec<String>,
	pub tagged: bool,
	pub program_name: String,
	pub program_version: String,
	pub protocol: Vec<(String, String)>,
	/// Transfer records for a parallel worker's sub-command; empty otherwise.
	pub records: Vec<TaggedRecord>,
}

/// Whether a running command may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Abort,
}

impl Flow {
	pub fn is_abort(self) -> bool {
		matches!(self, Flow::Abort)
	}
}

/// Summary of a parallel transfer the session ran on a transport's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
	pub workers: usize,
	pub batches: usize,
	pub failed: usize,
	/// A callback or cancellation stopped the transfer before all batches ran.
	pub aborted: bool,
}

/// Why a transport stopped a command early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
	/// The session asked the command to stop at a checkpoint.
	#[error("command aborted at checkpoint")]
	Aborted,
	#[error("connection lost: {0}")]
	Lost(String),
}

/// Sink and control surface a transport uses while a command runs.
pub trait CommandIo {
	/// Delivers one reply.
	fn emit(&mut self, reply: ServerReply) -> Flow;

	/// Reports that the command is still alive without producing output.
	fn keepalive(&mut self) -> Flow;

	/// Asks the user for input. `None` means the command must stop.
	fn prompt(&mut self, message: &str, echo: bool) -> Option<String>;

	/// Input supplied ahead of time for this command.
	fn data_set(&self) -> Option<String>;

	/// Runs a server-requested parallel transfer and blocks until it finishes.
	fn parallel_transfer(&mut self, plan: TransferPlan) -> TransferOutcome;
}
