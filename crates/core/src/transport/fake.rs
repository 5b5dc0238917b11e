//! In-memory server for exercising the session layer without a real server.
//!
//! A [`FakeServer`] owns users, workspaces, depot files and a table of command
//! handlers. [`FakeConnector`] opens connections to one or more fake servers by
//! address, and every connection shares its server's state, so tests can
//! inspect what ran where through the server handle.
//!
//! # Example
//!
//! ```ignore
//! let server = FakeServer::builder("perforce:1666")
//!     .user("admin", Some("pass"))
//!     .workspace("admin_ws")
//!     .depot_files(["//depot/main/a.txt"])
//!     .build();
//! let session = Session::builder(server.connector()).address("perforce:1666").user("admin").password("pass").build();
//!
//! session.run_command("dirs", CommandId(7), false, &["//depot/*"])?;
//! assert_eq!(server.executed().len(), 1);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use p4_protocol::{ClientError, ErrorSeverity, InfoMessage, ServerProtocol, ServerReply, TaggedRecord, TransferPlan, codes};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tracing::trace;

use super::{Authentication, CommandIo, CommandRequest, Connection, Connector, TransferOutcome, Transport, TransportFault};
use crate::config::ConfigSnapshot;
use crate::credentials::{Credential, LoginOptions, LogoutOptions};
use crate::error::{AuthFailure, ConnectFailure, Error, Result};
use crate::registry::CommandId;

/// Command handler installed on a fake server.
pub type FakeHandler = Arc<dyn Fn(&mut FakeCall<'_>) -> std::result::Result<(), TransportFault> + Send + Sync>;

const TICKET_LIFETIME_SECS: u64 = 12 * 60 * 60;
const PAUSE_SLICE: Duration = Duration::from_millis(5);

/// One command as the fake server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
	pub connection: usize,
	pub id: CommandId,
	pub name: String,
	pub args: Vec<String>,
	pub user: String,
	pub workspace: String,
	pub charset: String,
	pub program_name: String,
	pub program_version: String,
}

#[derive(Debug, Clone, Default)]
struct FakeUser {
	password: Option<String>,
	denied: bool,
}

struct ServerState {
	address: String,
	protocol: ServerProtocol,
	users: Mutex<HashMap<String, FakeUser>>,
	tickets: Mutex<HashMap<String, String>>,
	workspaces: Mutex<HashSet<String>>,
	depot: Mutex<Vec<String>>,
	failing: Mutex<HashSet<String>>,
	transfer_delay: Mutex<Duration>,
	connect_delay: Mutex<Duration>,
	handlers: RwLock<HashMap<String, FakeHandler>>,
	reachable: AtomicBool,
	epoch: AtomicU64,
	opened: AtomicUsize,
	live: AtomicUsize,
	ticket_seq: AtomicU64,
	executed: Mutex<Vec<ExecutedCommand>>,
}

/// Builder for [`FakeServer`].
pub struct FakeServerBuilder {
	address: String,
	protocol: ServerProtocol,
	users: HashMap<String, FakeUser>,
	workspaces: HashSet<String>,
	depot: Vec<String>,
}

impl FakeServerBuilder {
	pub fn version(mut self, version: &str) -> Self {
		self.protocol.version = version.to_string();
		self
	}

	pub fn api_level(mut self, level: u32) -> Self {
		self.protocol.api_level = level;
		self
	}

	pub fn unicode(mut self, unicode: bool) -> Self {
		self.protocol.unicode = unicode;
		self
	}

	/// Unknown users are refused instead of running anonymously.
	pub fn login_required(mut self, required: bool) -> Self {
		self.protocol.login_required = required;
		self
	}

	pub fn fingerprint(mut self, fingerprint: &str) -> Self {
		self.protocol.fingerprint = Some(fingerprint.to_string());
		self
	}

	pub fn user(mut self, name: &str, password: Option<&str>) -> Self {
		self.users.insert(
			name.to_string(),
			FakeUser {
				password: password.map(str::to_string),
				denied: false,
			},
		);
		self
	}

	/// Registers a user the server refuses access to.
	pub fn deny(mut self, name: &str) -> Self {
		self.users.entry(name.to_string()).or_default().denied = true;
		self
	}

	pub fn workspace(mut self, name: &str) -> Self {
		self.workspaces.insert(name.to_string());
		self
	}

	pub fn depot_files<I, S>(mut self, files: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.depot.extend(files.into_iter().map(Into::into));
		self
	}

	pub fn build(self) -> FakeServer {
		let state = ServerState {
			address: self.address,
			protocol: self.protocol,
			users: Mutex::new(self.users),
			tickets: Mutex::new(HashMap::new()),
			workspaces: Mutex::new(self.workspaces),
			depot: Mutex::new(self.depot),
			failing: Mutex::new(HashSet::new()),
			transfer_delay: Mutex::new(Duration::ZERO),
			connect_delay: Mutex::new(Duration::ZERO),
			handlers: RwLock::new(builtin_handlers()),
			reachable: AtomicBool::new(true),
			epoch: AtomicU64::new(0),
			opened: AtomicUsize::new(0),
			live: AtomicUsize::new(0),
			ticket_seq: AtomicU64::new(1),
			executed: Mutex::new(Vec::new()),
		};
		FakeServer { state: Arc::new(state) }
	}
}

/// Handle on an in-memory server. Clones share the same server.
#[derive(Clone)]
pub struct FakeServer {
	state: Arc<ServerState>,
}

impl std::fmt::Debug for FakeServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FakeServer")
			.field("address", &self.state.address)
			.field("live_connections", &self.live_connections())
			.finish_non_exhaustive()
	}
}

impl FakeServer {
	pub fn builder(address: &str) -> FakeServerBuilder {
		FakeServerBuilder {
			address: address.to_string(),
			protocol: ServerProtocol {
				version: "P4D/FAKE/2024.1/0".to_string(),
				api_level: 57,
				ext_submit: true,
				..Default::default()
			},
			users: HashMap::new(),
			workspaces: HashSet::new(),
			depot: Vec::new(),
		}
	}

	pub fn address(&self) -> &str {
		&self.state.address
	}

	pub fn protocol(&self) -> &ServerProtocol {
		&self.state.protocol
	}

	/// Connector that reaches only this server.
	pub fn connector(&self) -> Arc<dyn Connector> {
		Arc::new(FakeConnector::new([self.clone()]))
	}

	/// Makes the server refuse (or accept again) new connections.
	///
	/// While unreachable, existing connections report themselves dead.
	pub fn set_reachable(&self, reachable: bool) {
		self.state.reachable.store(reachable, Ordering::SeqCst);
	}

	/// Severs every open connection; new connections are unaffected.
	pub fn drop_connections(&self) {
		self.state.epoch.fetch_add(1, Ordering::SeqCst);
	}

	pub fn connections_opened(&self) -> usize {
		self.state.opened.load(Ordering::SeqCst)
	}

	pub fn live_connections(&self) -> usize {
		self.state.live.load(Ordering::SeqCst)
	}

	pub fn executed(&self) -> Vec<ExecutedCommand> {
		self.state.executed.lock().clone()
	}

	/// Installs or replaces a command handler.
	pub fn on_command<F>(&self, name: &str, handler: F)
	where
		F: Fn(&mut FakeCall<'_>) -> std::result::Result<(), TransportFault> + Send + Sync + 'static,
	{
		self.state.handlers.write().insert(name.to_string(), Arc::new(handler));
	}

	/// Installs a handler that replays a canned list of replies.
	///
	/// `replies` is a JSON array of replies in their serialized form.
	pub fn script(&self, name: &str, replies: JsonValue) -> std::result::Result<(), serde_json::Error> {
		let replies: Vec<ServerReply> = serde_json::from_value(replies)?;
		self.on_command(name, move |call| {
			for reply in &replies {
				call.emit(reply.clone())?;
			}
			Ok(())
		});
		Ok(())
	}

	pub fn set_password(&self, user: &str, password: Option<&str>) {
		self.state.users.lock().entry(user.to_string()).or_default().password = password.map(str::to_string);
	}

	pub fn add_workspace(&self, name: &str) {
		self.state.workspaces.lock().insert(name.to_string());
	}

	pub fn set_depot_files<I, S>(&self, files: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		*self.state.depot.lock() = files.into_iter().map(Into::into).collect();
	}

	/// Makes transfers of `path` fail.
	pub fn fail_transfer_of(&self, path: &str) {
		self.state.failing.lock().insert(path.to_string());
	}

	/// Time each file takes to sync or transfer.
	pub fn set_transfer_delay(&self, delay: Duration) {
		*self.state.transfer_delay.lock() = delay;
	}

	/// Time the handshake takes before a connection is handed out.
	pub fn set_connect_delay(&self, delay: Duration) {
		*self.state.connect_delay.lock() = delay;
	}

	/// Number of tickets currently valid for `user`.
	pub fn tickets_for(&self, user: &str) -> usize {
		self.state.tickets.lock().values().filter(|owner| *owner == user).count()
	}
}

/// Connector over a set of fake servers, routed by address.
#[derive(Clone, Debug)]
pub struct FakeConnector {
	servers: Vec<FakeServer>,
}

impl FakeConnector {
	pub fn new(servers: impl IntoIterator<Item = FakeServer>) -> Self {
		Self {
			servers: servers.into_iter().collect(),
		}
	}
}

impl Connector for FakeConnector {
	fn connect(&self, target: &ConfigSnapshot) -> Result<Connection> {
		let address = target.address();
		let server = self
			.servers
			.iter()
			.find(|server| server.address() == address && server.state.reachable.load(Ordering::SeqCst))
			.ok_or_else(|| {
				Error::connect(
					ConnectFailure::Unreachable,
					format!("Connect to server failed; check $P4PORT.\nTCP connect to {address} failed."),
				)
			})?;

		let state = server.state.clone();
		let delay = *state.connect_delay.lock();
		if !delay.is_zero() {
			thread::sleep(delay);
		}
		let connection = state.opened.fetch_add(1, Ordering::SeqCst) + 1;
		state.live.fetch_add(1, Ordering::SeqCst);
		trace!(target = "p4.fake", address, connection, "connection opened");

		let transport = FakeTransport {
			epoch: state.epoch.load(Ordering::SeqCst),
			state: state.clone(),
			connection,
			closed: AtomicBool::new(false),
			target: target.clone(),
		};
		Ok(Connection {
			transport: Arc::new(transport),
			server: state.protocol.clone(),
		})
	}
}

struct FakeTransport {
	state: Arc<ServerState>,
	connection: usize,
	epoch: u64,
	closed: AtomicBool,
	target: ConfigSnapshot,
}

impl Drop for FakeTransport {
	fn drop(&mut self) {
		self.state.live.fetch_sub(1, Ordering::SeqCst);
	}
}

impl FakeTransport {
	fn lost(&self) -> TransportFault {
		TransportFault::Lost(format!("connection {} to {} closed", self.connection, self.state.address))
	}
}

impl Transport for FakeTransport {
	fn authenticate(&self, user: &str, auth: &Authentication) -> Result<()> {
		if user.is_empty() {
			return Ok(());
		}
		let users = self.state.users.lock();
		let Some(account) = users.get(user) else {
			if self.state.protocol.login_required {
				return Err(Error::auth(AuthFailure::PasswordRequired, "Perforce password (P4PASSWD) invalid or unset."));
			}
			return Ok(());
		};
		if account.denied {
			return Err(Error::auth(AuthFailure::AccessDenied, "You don't have permission for this operation."));
		}
		let Some(expected) = &account.password else {
			return Ok(());
		};
		match auth {
			Authentication::Password(password) if password == expected => Ok(()),
			Authentication::Password(_) => Err(Error::auth(AuthFailure::BadPassword, "Password invalid.")),
			Authentication::Ticket(credential) => match self.state.tickets.lock().get(&credential.ticket) {
				Some(owner) if owner == user => Ok(()),
				_ => Err(Error::auth(AuthFailure::TicketExpired, "Your session has expired, please login again.")),
			},
			Authentication::None => Err(Error::auth(AuthFailure::PasswordRequired, "Perforce password (P4PASSWD) invalid or unset.")),
		}
	}

	fn login(&self, user: &str, password: &str, options: &LoginOptions) -> Result<Credential> {
		let users = self.state.users.lock();
		let account = users
			.get(user)
			.ok_or_else(|| Error::auth(AuthFailure::AccessDenied, format!("User {user} doesn't exist.")))?;
		if account.denied {
			return Err(Error::auth(AuthFailure::AccessDenied, "You don't have permission for this operation."));
		}
		if account.password.as_deref().is_some_and(|expected| expected != password) {
			return Err(Error::auth(AuthFailure::BadPassword, "Password invalid."));
		}

		let owner = options.user.clone().unwrap_or_else(|| user.to_string());
		let seq = self.state.ticket_seq.fetch_add(1, Ordering::SeqCst);
		let ticket = format!("{:016X}{:016X}", self.connection as u64, seq);
		self.state.tickets.lock().insert(ticket.clone(), owner.clone());

		let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
		Ok(Credential::new(ticket, owner, &self.state.address).with_expiry(now + TICKET_LIFETIME_SECS))
	}

	fn logout(&self, user: &str, _options: &LogoutOptions) -> Result<()> {
		self.state.tickets.lock().retain(|_, owner| owner != user);
		Ok(())
	}

	fn run(&self, request: &CommandRequest, io: &mut dyn CommandIo) -> std::result::Result<(), TransportFault> {
		if !self.is_alive() {
			return Err(self.lost());
		}
		self.state.executed.lock().push(ExecutedCommand {
			connection: self.connection,
			id: request.id,
			name: request.name.clone(),
			args: request.args.clone(),
			user: self.target.user().to_string(),
			workspace: self.target.workspace().to_string(),
			charset: self.target.charset().to_string(),
			program_name: request.program_name.clone(),
			program_version: request.program_version.clone(),
		});

		let handler = self.state.handlers.read().get(&request.name).cloned();
		let mut call = FakeCall {
			request,
			io,
			transport: self,
		};
		match handler {
			Some(handler) => handler(&mut call)?,
			None => call.error(codes::UNKNOWN_COMMAND, "Unknown command.  Try 'p4 help' for info.")?,
		}
		if !self.is_alive() {
			return Err(self.lost());
		}
		Ok(())
	}

	fn is_alive(&self) -> bool {
		!self.closed.load(Ordering::SeqCst) && self.state.reachable.load(Ordering::SeqCst) && self.state.epoch.load(Ordering::SeqCst) == self.epoch
	}

	fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			trace!(target = "p4.fake", connection = self.connection, "connection closed");
		}
	}
}

/// A command being served by a fake server.
///
/// Every output or keepalive call is a checkpoint: it fails with
/// [`TransportFault::Aborted`] once the session asks the command to stop.
pub struct FakeCall<'a> {
	request: &'a CommandRequest,
	io: &'a mut dyn CommandIo,
	transport: &'a FakeTransport,
}

impl FakeCall<'_> {
	pub fn request(&self) -> &CommandRequest {
		self.request
	}

	/// Arguments that are not flags.
	pub fn operands(&self) -> Vec<&str> {
		let mut operands = Vec::new();
		let mut skip_value = false;
		for arg in &self.request.args {
			if skip_value {
				skip_value = false;
				continue;
			}
			if arg == "--parallel" {
				skip_value = true;
			} else if !arg.starts_with('-') {
				operands.push(arg.as_str());
			}
		}
		operands
	}

	pub fn user(&self) -> &str {
		self.transport.target.user()
	}

	pub fn workspace(&self) -> &str {
		self.transport.target.workspace()
	}

	pub fn connection(&self) -> usize {
		self.transport.connection
	}

	pub fn depot_files(&self) -> Vec<String> {
		self.transport.state.depot.lock().clone()
	}

	pub fn emit(&mut self, reply: ServerReply) -> std::result::Result<(), TransportFault> {
		if !self.transport.is_alive() {
			return Err(self.transport.lost());
		}
		if self.io.emit(reply).is_abort() {
			return Err(TransportFault::Aborted);
		}
		Ok(())
	}

	pub fn info(&mut self, text: impl Into<String>) -> std::result::Result<(), TransportFault> {
		self.emit(ServerReply::Info(InfoMessage::new(0, 0, text)))
	}

	pub fn warning(&mut self, code: u32, message: impl Into<String>) -> std::result::Result<(), TransportFault> {
		self.emit(ServerReply::Error(ClientError::new(ErrorSeverity::Warning, code, message)))
	}

	pub fn error(&mut self, code: u32, message: impl Into<String>) -> std::result::Result<(), TransportFault> {
		self.emit(ServerReply::Error(ClientError::failed(code, message)))
	}

	pub fn tagged(&mut self, record: TaggedRecord) -> std::result::Result<(), TransportFault> {
		self.emit(ServerReply::tagged(record))
	}

	pub fn keepalive(&mut self) -> std::result::Result<(), TransportFault> {
		if !self.transport.is_alive() {
			return Err(self.transport.lost());
		}
		if self.io.keepalive().is_abort() {
			return Err(TransportFault::Aborted);
		}
		Ok(())
	}

	/// Sleeps for `duration`, checkpointing every few milliseconds.
	pub fn pause(&mut self, duration: Duration) -> std::result::Result<(), TransportFault> {
		let deadline = Instant::now() + duration;
		loop {
			self.keepalive()?;
			let now = Instant::now();
			if now >= deadline {
				return Ok(());
			}
			thread::sleep(PAUSE_SLICE.min(deadline - now));
		}
	}

	pub fn prompt(&mut self, message: &str, echo: bool) -> std::result::Result<String, TransportFault> {
		self.io.prompt(message, echo).ok_or(TransportFault::Aborted)
	}

	pub fn parallel_transfer(&mut self, plan: TransferPlan) -> TransferOutcome {
		self.io.parallel_transfer(plan)
	}

	fn transfer_delay(&self) -> Duration {
		*self.transport.state.transfer_delay.lock()
	}

	fn is_failing(&self, path: &str) -> bool {
		self.transport.state.failing.lock().contains(path)
	}

	fn files_matching(&self) -> Vec<String> {
		let patterns: Vec<String> = self.operands().iter().map(|op| op.trim_end_matches("...").trim_end_matches('*').to_string()).collect();
		self.depot_files()
			.into_iter()
			.filter(|file| patterns.is_empty() || patterns.iter().any(|prefix| file.starts_with(prefix.as_str())))
			.collect()
	}

	fn requires_workspace(&mut self) -> std::result::Result<bool, TransportFault> {
		let workspace = self.workspace().to_string();
		if self.transport.state.workspaces.lock().contains(&workspace) {
			return Ok(true);
		}
		self.error(codes::CLIENT_UNKNOWN, format!("Client '{workspace}' unknown - use 'client' command to create it."))?;
		Ok(false)
	}
}

fn handler<F>(f: F) -> FakeHandler
where
	F: Fn(&mut FakeCall<'_>) -> std::result::Result<(), TransportFault> + Send + Sync + 'static,
{
	Arc::new(f)
}

fn is_parallel(request: &CommandRequest) -> bool {
	request.args.iter().any(|arg| arg == "--parallel" || arg.starts_with("--parallel="))
}

fn builtin_handlers() -> HashMap<String, FakeHandler> {
	let mut handlers: HashMap<String, FakeHandler> = HashMap::new();

	handlers.insert("noop".into(), handler(|_| Ok(())));

	handlers.insert(
		"info".into(),
		handler(|call| {
			let state = &call.transport.state;
			let record = TaggedRecord::new()
				.with("userName", call.user())
				.with("clientName", call.workspace())
				.with("serverAddress", state.address.as_str())
				.with("serverVersion", state.protocol.version.as_str())
				.with("unicode", if state.protocol.unicode { "enabled" } else { "disabled" });
			call.tagged(record)
		}),
	);

	handlers.insert(
		"dirs".into(),
		handler(|call| {
			let dirs: BTreeSet<String> = call
				.files_matching()
				.iter()
				.filter_map(|file| {
					let rest = file.strip_prefix("//")?;
					let mut parts = rest.splitn(3, '/');
					let (depot, dir) = (parts.next()?, parts.next()?);
					parts.next().map(|_| format!("//{depot}/{dir}"))
				})
				.collect();
			if dirs.is_empty() {
				let pattern = call.operands().join(" ");
				return call.warning(0, format!("{pattern} - no such file(s)."));
			}
			let tagged = call.request().tagged;
			for dir in dirs {
				if tagged {
					call.tagged(TaggedRecord::new().with("dir", dir))?;
				} else {
					call.info(dir)?;
				}
			}
			Ok(())
		}),
	);

	handlers.insert(
		"have".into(),
		handler(|call| {
			if !call.requires_workspace()? {
				return Ok(());
			}
			for file in call.files_matching() {
				call.tagged(TaggedRecord::new().with("depotFile", file).with("haveRev", "1"))?;
			}
			Ok(())
		}),
	);

	handlers.insert(
		"print".into(),
		handler(|call| {
			let depot = call.depot_files();
			let operands: Vec<String> = call.operands().iter().map(|op| op.to_string()).collect();
			for file in operands {
				if depot.contains(&file) {
					call.emit(ServerReply::binary(format!("content of {file}\n").into_bytes()))?;
				} else {
					call.warning(0, format!("{file} - no such file(s)."))?;
				}
			}
			Ok(())
		}),
	);

	handlers.insert(
		"sync".into(),
		handler(|call| {
			if !call.requires_workspace()? {
				return Ok(());
			}
			let files = call.files_matching();
			if is_parallel(call.request()) {
				let plan = TransferPlan {
					sub_command: "transmit".to_string(),
					args: Vec::new(),
					records: files.iter().map(|file| TaggedRecord::new().with("depotFile", file.as_str()).with("rev", "1")).collect(),
				};
				let outcome = call.parallel_transfer(plan);
				return call.info(format!("{} file(s) transferred by {} worker(s)", files.len(), outcome.workers));
			}
			let delay = call.transfer_delay();
			for file in files {
				call.pause(delay)?;
				if call.is_failing(&file) {
					call.error(0, format!("{file} - transfer failed"))?;
				} else {
					call.info(format!("{file}#1 - added"))?;
				}
			}
			Ok(())
		}),
	);

	handlers.insert(
		"transmit".into(),
		handler(|call| {
			let delay = call.transfer_delay();
			let records = call.request().records.clone();
			for record in records {
				call.pause(delay)?;
				let file = record.get("depotFile").unwrap_or_default().to_string();
				if call.is_failing(&file) {
					call.error(0, format!("{file} - transfer failed"))?;
				} else {
					call.info(format!("{file}#1 - transferred"))?;
				}
			}
			Ok(())
		}),
	);

	handlers.insert(
		"passwd".into(),
		handler(|call| {
			let old = call.prompt("Enter old password: ", false)?;
			let new = call.prompt("Enter new password: ", false)?;
			let again = call.prompt("Re-enter new password: ", false)?;
			call.keepalive()?;

			let user = call.user().to_string();
			let current = call.transport.state.users.lock().get(&user).and_then(|account| account.password.clone());
			if current.as_deref().is_some_and(|current| current != old) {
				return call.error(codes::PASSWORD_INVALID, "Password invalid.");
			}
			if new != again {
				return call.error(0, "Passwords don't match.");
			}
			call.transport.state.users.lock().entry(user).or_default().password = Some(new);
			call.info("Password updated.")
		}),
	);

	handlers.insert(
		"wait".into(),
		handler(|call| {
			let millis = call.operands().first().and_then(|arg| arg.parse().ok()).unwrap_or(1000);
			call.pause(Duration::from_millis(millis))?;
			call.info(format!("waited {millis} ms"))
		}),
	);

	handlers.insert(
		"fail".into(),
		handler(|call| {
			let message = call.operands().join(" ");
			call.error(0, message)
		}),
	);

	handlers.insert(
		"warn".into(),
		handler(|call| {
			let message = call.operands().join(" ");
			call.warning(0, message)?;
			call.info("done")
		}),
	);

	handlers
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConnectionConfig;
	use crate::transport::Flow;

	#[derive(Default)]
	struct Recorder {
		replies: Vec<ServerReply>,
		answers: Vec<String>,
		abort_after: Option<usize>,
		keepalives: usize,
	}

	impl CommandIo for Recorder {
		fn emit(&mut self, reply: ServerReply) -> Flow {
			self.replies.push(reply);
			Flow::Continue
		}

		fn keepalive(&mut self) -> Flow {
			self.keepalives += 1;
			match self.abort_after {
				Some(limit) if self.keepalives > limit => Flow::Abort,
				_ => Flow::Continue,
			}
		}

		fn prompt(&mut self, _message: &str, _echo: bool) -> Option<String> {
			if self.answers.is_empty() { None } else { Some(self.answers.remove(0)) }
		}

		fn data_set(&self) -> Option<String> {
			None
		}

		fn parallel_transfer(&mut self, _plan: TransferPlan) -> TransferOutcome {
			TransferOutcome::default()
		}
	}

	fn target(address: &str, user: &str, workspace: &str) -> ConfigSnapshot {
		let config = ConnectionConfig::default();
		config.set_address(address);
		config.set_user(user);
		config.set_workspace(workspace);
		config.snapshot()
	}

	fn request(name: &str, args: &[&str]) -> CommandRequest {
		CommandRequest {
			id: CommandId(1),
			name: name.to_string(),
			args: args.iter().map(|arg| arg.to_string()).collect(),
			tagged: false,
			..Default::default()
		}
	}

	#[test]
	fn unknown_address_is_unreachable() {
		let server = FakeServer::builder("perforce:1666").build();
		let err = server.connector().connect(&target("nowhere:666", "admin", "")).unwrap_err();
		assert!(matches!(err, Error::Connect { kind: ConnectFailure::Unreachable, .. }));
		assert_eq!(server.connections_opened(), 0);
	}

	#[test]
	fn password_checks_follow_user_table() {
		let server = FakeServer::builder("perforce:1666").user("admin", Some("pass")).deny("intruder").build();
		let connection = server.connector().connect(&target("perforce:1666", "admin", "")).unwrap();
		let transport = connection.transport;

		assert!(transport.authenticate("admin", &Authentication::Password("pass".into())).is_ok());
		let bad = transport.authenticate("admin", &Authentication::Password("nope".into())).unwrap_err();
		assert!(matches!(bad, Error::Auth { kind: AuthFailure::BadPassword, .. }));
		let denied = transport.authenticate("intruder", &Authentication::None).unwrap_err();
		assert!(matches!(denied, Error::Auth { kind: AuthFailure::AccessDenied, .. }));
	}

	#[test]
	fn issued_ticket_authenticates_until_logout() {
		let server = FakeServer::builder("perforce:1666").user("admin", Some("pass")).build();
		let transport = server.connector().connect(&target("perforce:1666", "admin", "")).unwrap().transport;

		let credential = transport.login("admin", "pass", &LoginOptions::default()).unwrap();
		assert_eq!(credential.scope, "perforce:1666");
		assert!(transport.authenticate("admin", &Authentication::Ticket(credential.clone())).is_ok());

		transport.logout("admin", &LogoutOptions::default()).unwrap();
		assert_eq!(server.tickets_for("admin"), 0);
		assert!(transport.authenticate("admin", &Authentication::Ticket(credential)).is_err());
	}

	#[test]
	fn unknown_workspace_reports_client_unknown() {
		let server = FakeServer::builder("perforce:1666").user("admin", None).depot_files(["//depot/a.txt"]).build();
		let transport = server.connector().connect(&target("perforce:1666", "admin", "missing_ws")).unwrap().transport;

		let mut io = Recorder::default();
		transport.run(&request("have", &[]), &mut io).unwrap();
		match &io.replies[..] {
			[ServerReply::Error(err)] => assert_eq!(err.code, codes::CLIENT_UNKNOWN),
			other => panic!("expected one error reply, got {other:?}"),
		}
	}

	#[test]
	fn dirs_lists_top_level_directories() {
		let server = FakeServer::builder("perforce:1666")
			.depot_files(["//depot/main/a.txt", "//depot/main/b.txt", "//depot/rel/c.txt"])
			.build();
		let transport = server.connector().connect(&target("perforce:1666", "", "")).unwrap().transport;

		let mut io = Recorder::default();
		transport.run(&request("dirs", &["//depot/*"]), &mut io).unwrap();
		let dirs: Vec<String> = io
			.replies
			.iter()
			.filter_map(|reply| match reply {
				ServerReply::Info(info) => Some(info.text.clone()),
				_ => None,
			})
			.collect();
		assert_eq!(dirs, vec!["//depot/main", "//depot/rel"]);
	}

	#[test]
	fn pause_stops_at_aborted_keepalive() {
		let server = FakeServer::builder("perforce:1666").build();
		let transport = server.connector().connect(&target("perforce:1666", "", "")).unwrap().transport;

		let mut io = Recorder {
			abort_after: Some(2),
			..Default::default()
		};
		let fault = transport.run(&request("wait", &["10000"]), &mut io).unwrap_err();
		assert_eq!(fault, TransportFault::Aborted);
	}

	#[test]
	fn passwd_aborts_without_answers() {
		let server = FakeServer::builder("perforce:1666").user("admin", Some("old")).build();
		let transport = server.connector().connect(&target("perforce:1666", "admin", "")).unwrap().transport;

		let mut io = Recorder::default();
		assert_eq!(transport.run(&request("passwd", &[]), &mut io), Err(TransportFault::Aborted));

		let mut io = Recorder {
			answers: vec!["old".into(), "new".into(), "new".into()],
			..Default::default()
		};
		transport.run(&request("passwd", &[]), &mut io).unwrap();
		assert!(transport.authenticate("admin", &Authentication::Password("new".into())).is_ok());
	}

	#[test]
	fn dropped_connections_are_dead() {
		let server = FakeServer::builder("perforce:1666").build();
		let transport = server.connector().connect(&target("perforce:1666", "", "")).unwrap().transport;
		assert!(transport.is_alive());
		assert_eq!(server.live_connections(), 1);

		server.drop_connections();
		assert!(!transport.is_alive());
		let mut io = Recorder::default();
		assert!(matches!(transport.run(&request("noop", &[]), &mut io), Err(TransportFault::Lost(_))));

		drop(transport);
		assert_eq!(server.live_connections(), 0);
	}

	#[test]
	fn scripted_replies_are_replayed() {
		let server = FakeServer::builder("perforce:1666").build();
		server
			.script(
				"describe",
				serde_json::json!([
					{"kind": "info", "code": 0, "text": "Change 42 by admin"},
					{"kind": "binary", "data": "AAEC"}
				]),
			)
			.unwrap();
		let transport = server.connector().connect(&target("perforce:1666", "", "")).unwrap().transport;

		let mut io = Recorder::default();
		transport.run(&request("describe", &["42"]), &mut io).unwrap();
		assert_eq!(io.replies.len(), 2);
		assert_eq!(io.replies[1], ServerReply::binary(vec![0u8, 1, 2]));
	}
}
