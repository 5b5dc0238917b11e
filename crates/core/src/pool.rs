//! Keyed set of sessions sharing one target.
//!
//! Each key (by default the calling thread) gets its own [`Session`], created
//! on first use from the pool's template configuration. Program identity,
//! character set and command timeout are pool-wide: changing them updates
//! every pooled session.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ConfigField, ConfigValues, ConnectionConfig};
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::session::{DEFAULT_IDLE_DISCONNECT_WAIT, Session};
use crate::transport::Connector;

#[derive(Debug, Clone, Default)]
struct SharedSettings {
	program_name: Option<String>,
	program_version: Option<String>,
	charset: Option<String>,
	command_timeout: Option<Duration>,
}

impl SharedSettings {
	fn apply(&self, session: &Session) {
		if let Some(name) = &self.program_name {
			session.set_program_name(name);
		}
		if let Some(version) = &self.program_version {
			session.set_program_version(version);
		}
		if let Some(charset) = &self.charset {
			session.set_charset(charset);
		}
		session.set_command_timeout(self.command_timeout);
	}
}

pub struct SessionPool<K = ThreadId> {
	connector: Arc<dyn Connector>,
	template: ConfigValues,
	credentials: Arc<dyn CredentialStore>,
	idle_wait: Duration,
	settings: Mutex<SharedSettings>,
	sessions: Mutex<HashMap<K, Session>>,
}

impl<K> std::fmt::Debug for SessionPool<K> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionPool")
			.field("address", &self.template.address)
			.field("sessions", &self.sessions.lock().len())
			.finish_non_exhaustive()
	}
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> SessionPool<K> {
	/// Pool whose sessions start from `template` and share one in-memory ticket store.
	pub fn new(connector: Arc<dyn Connector>, template: ConfigValues) -> Self {
		Self {
			connector,
			template,
			credentials: Arc::new(MemoryCredentialStore::new()),
			idle_wait: DEFAULT_IDLE_DISCONNECT_WAIT,
			settings: Mutex::new(SharedSettings::default()),
			sessions: Mutex::new(HashMap::new()),
		}
	}

	pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.credentials = store;
		self
	}

	pub fn with_idle_disconnect_wait(mut self, wait: Duration) -> Self {
		self.idle_wait = wait;
		self
	}

	/// The session for `key`, created with the pool-wide settings if missing.
	pub fn session(&self, key: K) -> Session {
		let mut sessions = self.sessions.lock();
		if let Some(session) = sessions.get(&key) {
			return session.clone();
		}

		let session = Session::builder(self.connector.clone())
			.config(ConnectionConfig::new(self.template.clone()))
			.credentials(self.credentials.clone())
			.idle_disconnect_wait(self.idle_wait)
			.build();
		self.settings.lock().apply(&session);
		debug!(target = "p4.pool", ?key, address = %self.template.address, "pooled session created");
		sessions.insert(key, session.clone());
		session
	}

	pub fn get(&self, key: &K) -> Option<Session> {
		self.sessions.lock().get(key).cloned()
	}

	/// Removes the session for `key`. Its connection closes once the last clone is dropped.
	pub fn remove(&self, key: &K) -> Option<Session> {
		self.sessions.lock().remove(key)
	}

	pub fn len(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.lock().is_empty()
	}

	pub fn set_program_name(&self, name: &str) {
		self.settings.lock().program_name = Some(name.to_string());
		self.for_each(|session| session.set_program_name(name));
	}

	pub fn set_program_version(&self, version: &str) {
		self.settings.lock().program_version = Some(version.to_string());
		self.for_each(|session| session.set_program_version(version));
	}

	pub fn set_charset(&self, charset: &str) {
		self.settings.lock().charset = Some(charset.to_string());
		self.for_each(|session| session.set_charset(charset));
	}

	pub fn set_command_timeout(&self, timeout: Option<Duration>) {
		self.settings.lock().command_timeout = timeout;
		self.for_each(|session| session.set_command_timeout(timeout));
	}

	/// Value of `field` a newly created session would start with.
	pub fn template_value(&self, field: ConfigField) -> String {
		let settings = self.settings.lock();
		let shared = match field {
			ConfigField::ProgramName => settings.program_name.clone(),
			ConfigField::ProgramVersion => settings.program_version.clone(),
			ConfigField::Charset => settings.charset.clone(),
			_ => None,
		};
		shared.unwrap_or_else(|| self.template.get(field).to_string())
	}

	pub fn disconnect_all(&self) {
		let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
		for session in &sessions {
			session.disconnect();
		}
		info!(target = "p4.pool", sessions = sessions.len(), "pooled sessions disconnected");
	}

	fn for_each(&self, apply: impl Fn(&Session)) {
		let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
		for session in &sessions {
			apply(session);
		}
	}
}

impl SessionPool<ThreadId> {
	/// The calling thread's session.
	pub fn for_current_thread(&self) -> Session {
		self.session(thread::current().id())
	}
}
