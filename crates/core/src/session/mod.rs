//! Client session.
//!
//! A [`Session`] owns one logical connection to a server and runs commands on
//! it from any number of threads. The connection is opened lazily by the first
//! command, re-opened when the configuration changes, dropped after a quiet
//! period and re-opened transparently by the next command.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::builder(connector)
//!     .address("perforce:1666")
//!     .user("admin")
//!     .password("pass")
//!     .build();
//!
//! session.run_command("dirs", CommandId(7), false, &["//depot/*"])?;
//! for info in session.info_results(CommandId(7)).unwrap_or_default() {
//!     println!("{}", info.text);
//! }
//! session.release_command(CommandId(7));
//! ```

mod execute;
mod idle;
mod slot;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use p4_protocol::{ErrorSeverity, InfoMessage, ReplyChannel, ServerProtocol, TaggedRecord};
use p4_runtime::{EnvDefaults, default_ticket_path};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broadcast::{ResultBroadcaster, SubscriptionHandle};
use crate::config::{ConfigField, ConnectionConfig, TrustPolicy};
use crate::credentials::{Credential, CredentialStore, LoginOptions, LogoutOptions, MemoryCredentialStore, TicketFileStore};
use crate::error::{CallbackError, Result};
use crate::parallel::{ParallelTransferCallback, TransferBatch, TransferDecision};
use crate::registry::{CancelToken, CommandId, CommandRegistry, CommandState};
use crate::results::{ErrorRecord, ResultBundle, ResultEvent};
use crate::transport::Connector;

pub(crate) use idle::IdleShared;
pub(crate) use slot::{ConnectionSlot, LiveConnection};

/// Quiet period after which an idle connection is closed.
pub const DEFAULT_IDLE_DISCONNECT_WAIT: Duration = Duration::from_secs(5);

/// First id handed out by [`Session::next_command_id`].
const AUTO_ID_BASE: u32 = 1 << 30;

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	/// Last connect attempt failed, or a cancelled command left the session needing `reconnect`.
	Failed,
}

/// A prompt raised by a running command.
#[derive(Debug)]
pub struct PromptRequest<'a> {
	pub command: CommandId,
	pub message: &'a str,
	/// Whether the answer may be echoed back to the user.
	pub echo: bool,
	/// Cancellation flag of the prompting command.
	pub cancel: CancelToken,
}

/// Answers prompts; `None` stops the command.
pub type PromptHandler = Arc<dyn Fn(&PromptRequest<'_>) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Settings {
	throw_threshold: Option<ErrorSeverity>,
	command_timeout: Option<Duration>,
}

pub(crate) struct SessionInner {
	pub(crate) connector: Arc<dyn Connector>,
	pub(crate) config: ConnectionConfig,
	credentials: RwLock<Arc<dyn CredentialStore>>,
	pub(crate) registry: CommandRegistry,
	pub(crate) broadcaster: ResultBroadcaster,
	slot: RwLock<ConnectionSlot>,
	connect_gate: Mutex<()>,
	pub(crate) idle: Arc<IdleShared>,
	settings: RwLock<Settings>,
	prompt_handler: RwLock<Option<PromptHandler>>,
	pub(crate) parallel_callback: RwLock<Option<ParallelTransferCallback>>,
	pub(crate) parallel_workers: AtomicUsize,
	next_id: AtomicU32,
}

impl SessionInner {
	pub(crate) fn credentials(&self) -> Arc<dyn CredentialStore> {
		self.credentials.read().clone()
	}

	pub(crate) fn prompt_handler(&self) -> Option<PromptHandler> {
		self.prompt_handler.read().clone()
	}

	/// Records `event` on the command and fans it out to subscribers.
	pub(crate) fn deliver(&self, handle: &crate::registry::CommandHandle, event: ResultEvent) {
		if handle.record(&event) {
			self.broadcaster.emit(handle.id(), &event);
		}
	}
}

impl Drop for SessionInner {
	fn drop(&mut self) {
		self.idle.shutdown();
		if let Some(live) = self.slot.get_mut().live.take() {
			live.transport.close();
		}
	}
}

/// Builder for [`Session`].
pub struct SessionBuilder {
	connector: Arc<dyn Connector>,
	config: ConnectionConfig,
	credentials: Option<Arc<dyn CredentialStore>>,
	idle_wait: Duration,
	throw_threshold: Option<ErrorSeverity>,
	command_timeout: Option<Duration>,
}

impl SessionBuilder {
	fn new(connector: Arc<dyn Connector>) -> Self {
		Self {
			connector,
			config: ConnectionConfig::default(),
			credentials: None,
			idle_wait: DEFAULT_IDLE_DISCONNECT_WAIT,
			throw_threshold: Some(ErrorSeverity::Failed),
			command_timeout: None,
		}
	}

	/// Builder seeded from `P4*` environment variables, with tickets in the
	/// `P4TICKETS` file or the platform default ticket file.
	pub fn from_env(connector: Arc<dyn Connector>) -> Self {
		let env = EnvDefaults::from_env();
		let mut builder = Self::new(connector).config(ConnectionConfig::from_env_defaults(&env));
		if let Some(path) = env.tickets.or_else(default_ticket_path) {
			builder = builder.ticket_file(path);
		}
		builder
	}

	/// Uses an existing configuration handle; changes through either side are shared.
	pub fn config(mut self, config: ConnectionConfig) -> Self {
		self.config = config;
		self
	}

	pub fn address(self, address: &str) -> Self {
		self.config.set_address(address);
		self
	}

	pub fn user(self, user: &str) -> Self {
		self.config.set_user(user);
		self
	}

	pub fn password(self, password: &str) -> Self {
		self.config.set_password(password);
		self
	}

	pub fn workspace(self, workspace: &str) -> Self {
		self.config.set_workspace(workspace);
		self
	}

	pub fn charset(self, charset: &str) -> Self {
		self.config.set_charset(charset);
		self
	}

	pub fn program(self, name: &str, version: &str) -> Self {
		self.config.set(ConfigField::ProgramName, Some(name));
		self.config.set(ConfigField::ProgramVersion, Some(version));
		self
	}

	pub fn trust(self, policy: TrustPolicy) -> Self {
		self.config.set_trust(policy);
		self
	}

	pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.credentials = Some(store);
		self
	}

	pub fn ticket_file(self, path: impl Into<PathBuf>) -> Self {
		self.credentials(Arc::new(TicketFileStore::new(path)))
	}

	/// `Duration::ZERO` keeps idle connections open.
	pub fn idle_disconnect_wait(mut self, wait: Duration) -> Self {
		self.idle_wait = wait;
		self
	}

	/// Lowest error severity that makes `run_command` return `Err`; `None` never does.
	pub fn throw_threshold(mut self, threshold: Option<ErrorSeverity>) -> Self {
		self.throw_threshold = threshold;
		self
	}

	pub fn command_timeout(mut self, timeout: Duration) -> Self {
		self.command_timeout = Some(timeout);
		self
	}

	pub fn build(self) -> Session {
		let idle = IdleShared::new(self.idle_wait);
		let inner = Arc::new(SessionInner {
			connector: self.connector,
			config: self.config,
			credentials: RwLock::new(self.credentials.unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()))),
			registry: CommandRegistry::new(),
			broadcaster: ResultBroadcaster::new(),
			slot: RwLock::new(ConnectionSlot::default()),
			connect_gate: Mutex::new(()),
			idle: idle.clone(),
			settings: RwLock::new(Settings {
				throw_threshold: self.throw_threshold,
				command_timeout: self.command_timeout,
			}),
			prompt_handler: RwLock::new(None),
			parallel_callback: RwLock::new(None),
			parallel_workers: AtomicUsize::new(0),
			next_id: AtomicU32::new(AUTO_ID_BASE),
		});
		if let Err(err) = idle::spawn_monitor(idle, Arc::downgrade(&inner)) {
			warn!(target = "p4.idle", error = %err, "idle monitor not started; connections stay open until dropped");
		}
		debug!(target = "p4.session", address = %inner.config.get(ConfigField::Address), "session created");
		Session { inner }
	}
}

/// Thread-safe handle on a client session. Clones share the session.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("address", &self.address())
			.field("state", &self.state())
			.field("active_commands", &self.active_commands())
			.finish_non_exhaustive()
	}
}

impl Session {
	pub fn builder(connector: Arc<dyn Connector>) -> SessionBuilder {
		SessionBuilder::new(connector)
	}

	pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
		Self::builder(connector).config(config).build()
	}

	/// Session configured from the config file above `cwd` and the environment.
	pub fn from_path(connector: Arc<dyn Connector>, cwd: impl Into<PathBuf>) -> Result<Self> {
		let config = ConnectionConfig::from_path(cwd.into())?;
		Ok(Self::new(connector, config))
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.inner.config
	}

	// Connection

	/// Opens the connection now instead of on the first command.
	///
	/// Also clears the reconnect requirement left by a cancelled command.
	pub fn connect(&self) -> Result<()> {
		self.inner.connect()
	}

	/// Closes the connection. The next command reconnects.
	pub fn disconnect(&self) {
		self.inner.disconnect();
	}

	/// Drops the current connection and opens a fresh one.
	pub fn reconnect(&self) -> Result<()> {
		self.inner.reconnect()
	}

	pub fn is_connected(&self) -> bool {
		self.inner.is_connected()
	}

	pub fn state(&self) -> SessionState {
		self.inner.state()
	}

	/// Error from the most recent failed connect attempt.
	pub fn connection_error(&self) -> Option<ErrorRecord> {
		self.inner.connection_error()
	}

	/// Handshake metadata of the open connection.
	pub fn server_protocol(&self) -> Option<ServerProtocol> {
		self.inner.live().map(|live| live.server.clone())
	}

	pub fn is_unicode(&self) -> bool {
		self.server_protocol().is_some_and(|server| server.unicode)
	}

	pub fn api_level(&self) -> Option<u32> {
		self.server_protocol().map(|server| server.api_level)
	}

	pub fn requires_login(&self) -> bool {
		self.server_protocol().is_some_and(|server| server.login_required)
	}

	pub fn supports_ext_submit(&self) -> bool {
		self.server_protocol().is_some_and(|server| server.ext_submit)
	}

	/// Character set in effect on the open connection, after negotiation.
	pub fn effective_charset(&self) -> Option<String> {
		self.inner.live().map(|live| live.target.charset().to_string())
	}

	// Settings

	pub fn address(&self) -> String {
		self.inner.config.get(ConfigField::Address)
	}

	pub fn set_address(&self, address: &str) {
		self.inner.config.set_address(address);
	}

	pub fn user(&self) -> String {
		self.inner.config.get(ConfigField::User)
	}

	pub fn set_user(&self, user: &str) {
		self.inner.config.set_user(user);
	}

	pub fn set_password(&self, password: &str) {
		self.inner.config.set_password(password);
	}

	pub fn workspace(&self) -> String {
		self.inner.config.get(ConfigField::Workspace)
	}

	pub fn set_workspace(&self, workspace: &str) {
		self.inner.config.set_workspace(workspace);
	}

	pub fn charset(&self) -> String {
		self.inner.config.get(ConfigField::Charset)
	}

	pub fn set_charset(&self, charset: &str) {
		self.inner.config.set_charset(charset);
	}

	pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
		self.inner.config.set_cwd(Some(cwd.into()));
	}

	pub fn program_name(&self) -> String {
		self.inner.config.get(ConfigField::ProgramName)
	}

	pub fn set_program_name(&self, name: &str) {
		self.inner.config.set(ConfigField::ProgramName, Some(name));
	}

	pub fn program_version(&self) -> String {
		self.inner.config.get(ConfigField::ProgramVersion)
	}

	pub fn set_program_version(&self, version: &str) {
		self.inner.config.set(ConfigField::ProgramVersion, Some(version));
	}

	/// Sets a protocol tweak sent with every command.
	pub fn set_protocol(&self, key: &str, value: &str) {
		self.inner.config.set_protocol(key, value);
	}

	/// Trusts a server fingerprint for subsequent connections.
	pub fn trust(&self, fingerprint: &str) {
		self.inner.config.set_trust(TrustPolicy::Fingerprint(fingerprint.to_string()));
	}

	pub fn set_trust_policy(&self, policy: TrustPolicy) {
		self.inner.config.set_trust(policy);
	}

	pub fn idle_disconnect_wait(&self) -> Duration {
		self.inner.idle.wait()
	}

	pub fn set_idle_disconnect_wait(&self, wait: Duration) {
		self.inner.idle.set_wait(wait);
	}

	pub fn throw_threshold(&self) -> Option<ErrorSeverity> {
		self.inner.settings.read().throw_threshold
	}

	pub fn set_throw_threshold(&self, threshold: Option<ErrorSeverity>) {
		self.inner.settings.write().throw_threshold = threshold;
	}

	pub fn command_timeout(&self) -> Option<Duration> {
		self.inner.settings.read().command_timeout
	}

	/// Applies to commands started after the call.
	pub fn set_command_timeout(&self, timeout: Option<Duration>) {
		self.inner.settings.write().command_timeout = timeout;
	}

	// Credentials

	pub fn ticket_file(&self) -> Option<PathBuf> {
		self.inner.credentials().location()
	}

	/// Points ticket storage at `path`, switching to a ticket file store when needed.
	pub fn set_ticket_file(&self, path: impl Into<PathBuf>) {
		let path = path.into();
		let store = self.inner.credentials();
		if store.location().is_some() {
			store.set_location(path);
		} else {
			*self.inner.credentials.write() = Arc::new(TicketFileStore::new(path));
		}
	}

	pub fn set_credential_store(&self, store: Arc<dyn CredentialStore>) {
		*self.inner.credentials.write() = store;
	}

	/// Exchanges `password` for a ticket and stores it.
	pub fn login(&self, password: &str, options: &LoginOptions) -> Result<Credential> {
		self.inner.login(password, options)
	}

	/// Invalidates the user's tickets on the server and forgets the stored one.
	pub fn logout(&self, options: &LogoutOptions) -> Result<()> {
		self.inner.logout(options)
	}

	// Commands

	/// An id not currently used by a running command.
	pub fn next_command_id(&self) -> CommandId {
		loop {
			let id = CommandId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
			if self.inner.registry.get(id).is_none() {
				return id;
			}
		}
	}

	/// Runs `name` with `args` under `id`, blocking until it finishes.
	///
	/// Returns `Ok(true)` when the command completed without failures,
	/// `Ok(false)` when it failed below the throw threshold, and `Err` for
	/// cancellation or failures at or above the threshold. Output stays
	/// readable through the `*_results` accessors until released.
	pub fn run_command(&self, name: &str, id: CommandId, tagged: bool, args: &[&str]) -> Result<bool> {
		let args = args.iter().map(|arg| arg.to_string()).collect();
		self.inner.execute(id, name, args, tagged)
	}

	/// Requests cancellation; the command stops at its next checkpoint.
	///
	/// Returns `false` when no command with `id` is running.
	pub fn cancel_command(&self, id: CommandId) -> bool {
		let cancelled = self.inner.registry.cancel(id);
		if cancelled {
			info!(target = "p4.session", %id, "cancel requested");
		}
		cancelled
	}

	pub fn command_state(&self, id: CommandId) -> Option<CommandState> {
		self.inner.registry.get(id).map(|handle| handle.state())
	}

	pub fn active_commands(&self) -> Vec<CommandId> {
		self.inner.registry.active_ids()
	}

	/// All results of a finished command.
	pub fn results(&self, id: CommandId) -> Option<Arc<ResultBundle>> {
		self.inner.registry.results_for(id)
	}

	pub fn error_results(&self, id: CommandId) -> Option<Vec<ErrorRecord>> {
		self.results(id).map(|results| results.errors().to_vec())
	}

	pub fn info_results(&self, id: CommandId) -> Option<Vec<InfoMessage>> {
		self.results(id).map(|results| results.info().to_vec())
	}

	pub fn tagged_output(&self, id: CommandId) -> Option<Vec<TaggedRecord>> {
		self.results(id).map(|results| results.tagged().to_vec())
	}

	pub fn text_results(&self, id: CommandId) -> Option<String> {
		self.results(id).map(|results| results.text().to_string())
	}

	pub fn binary_results(&self, id: CommandId) -> Option<Vec<u8>> {
		self.results(id).map(|results| results.binary().to_vec())
	}

	/// Frees a finished command's results; running commands are left alone.
	pub fn release_command(&self, id: CommandId) -> bool {
		self.inner.registry.release(id)
	}

	pub fn take_results(&self, id: CommandId) -> Option<Arc<ResultBundle>> {
		self.inner.registry.take_results(id)
	}

	/// Input answered to prompts of the command with `id`, one line per prompt.
	pub fn set_data_set(&self, id: CommandId, data: Option<String>) {
		self.inner.registry.set_data_set(id, data);
	}

	pub fn data_set(&self, id: CommandId) -> Option<String> {
		self.inner.registry.data_set(id)
	}

	/// Hands prompt handling for the command with `id` to `thread`.
	///
	/// Applies to the running command, or to the next command started with
	/// `id`. Without an owner a command belongs to the thread that started it.
	/// Prompts raised on any other thread are answered from the data set.
	pub fn set_thread_owner(&self, id: CommandId, thread: ThreadId) {
		self.inner.registry.set_owner(id, thread);
	}

	// Callbacks

	pub fn subscribe<F>(&self, channel: ReplyChannel, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &ResultEvent) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.inner.broadcaster.subscribe(channel, Arc::new(handler))
	}

	pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
		self.inner.broadcaster.unsubscribe(handle)
	}

	pub fn on_error<F>(&self, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &ErrorRecord) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.subscribe(ReplyChannel::Error, move |id, event| match event {
			ResultEvent::Error(err) => handler(id, err),
			_ => Ok(()),
		})
	}

	pub fn on_info<F>(&self, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &InfoMessage) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.subscribe(ReplyChannel::Info, move |id, event| match event {
			ResultEvent::Info(info) => handler(id, info),
			_ => Ok(()),
		})
	}

	pub fn on_tagged<F>(&self, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &TaggedRecord) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.subscribe(ReplyChannel::Tagged, move |id, event| match event {
			ResultEvent::Tagged(record) => handler(id, record),
			_ => Ok(()),
		})
	}

	pub fn on_text<F>(&self, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &str) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.subscribe(ReplyChannel::Text, move |id, event| match event {
			ResultEvent::Text(text) => handler(id, text),
			_ => Ok(()),
		})
	}

	pub fn on_binary<F>(&self, handler: F) -> SubscriptionHandle
	where
		F: Fn(CommandId, &[u8]) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
	{
		self.subscribe(ReplyChannel::Binary, move |id, event| match event {
			ResultEvent::Binary(data) => handler(id, data),
			_ => Ok(()),
		})
	}

	pub fn set_prompt_handler<F>(&self, handler: F)
	where
		F: Fn(&PromptRequest<'_>) -> Option<String> + Send + Sync + 'static,
	{
		*self.inner.prompt_handler.write() = Some(Arc::new(handler));
	}

	pub fn clear_prompt_handler(&self) {
		*self.inner.prompt_handler.write() = None;
	}

	/// Takes over parallel transfers: each batch goes to `callback` instead of a worker connection.
	pub fn set_parallel_transfer_callback<F>(&self, callback: F)
	where
		F: Fn(&TransferBatch<'_>) -> TransferDecision + Send + Sync + 'static,
	{
		*self.inner.parallel_callback.write() = Some(Arc::new(callback));
	}

	pub fn clear_parallel_transfer_callback(&self) {
		*self.inner.parallel_callback.write() = None;
	}

	/// Number of parallel transfer workers currently running.
	pub fn parallel_operation_count(&self) -> usize {
		self.inner.parallel_workers.load(Ordering::SeqCst)
	}
}
