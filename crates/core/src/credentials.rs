//! Credential storage.
//!
//! A [`CredentialStore`] resolves the ticket to present for a (server, user)
//! pair and persists tickets issued by a login. Two implementations ship:
//! [`TicketFileStore`] backed by a ticket file on disk, and
//! [`MemoryCredentialStore`] for tests and embedders that keep tickets
//! elsewhere.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use p4_runtime::{TicketEntry, TicketFile, default_ticket_path};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Ticket issued by a server for one user.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
	#[serde(skip)]
	pub ticket: String,
	pub user: String,
	/// Server address the ticket is valid for.
	pub scope: String,
	/// Expiry as seconds since the Unix epoch, when the server reported one.
	pub expires_at: Option<u64>,
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credential")
			.field("ticket", &"<redacted>")
			.field("user", &self.user)
			.field("scope", &self.scope)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

impl Credential {
	pub fn new(ticket: impl Into<String>, user: impl Into<String>, scope: impl Into<String>) -> Self {
		Self {
			ticket: ticket.into(),
			user: user.into(),
			scope: scope.into(),
			expires_at: None,
		}
	}

	pub fn with_expiry(mut self, expires_at: u64) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn is_expired(&self) -> bool {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
		self.expires_at.is_some_and(|expiry| expiry <= now)
	}
}

/// Options for a login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginOptions {
	/// Ask for a ticket valid on every host rather than only this client host.
	pub all_hosts: bool,
	/// Log in as another user (requires super access on the server).
	pub user: Option<String>,
}

/// Options for a logout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutOptions {
	/// Invalidate the user's tickets on every host.
	pub all_hosts: bool,
}

/// Where tickets are read from and written to.
pub trait CredentialStore: Send + Sync + fmt::Debug {
	/// Returns the stored credential for `address` and `user`.
	fn resolve(&self, address: &str, user: &str) -> Result<Option<Credential>>;

	fn persist(&self, credential: &Credential) -> Result<()>;

	/// Removes the credential for `address` and `user`; returns whether one existed.
	fn remove(&self, address: &str, user: &str) -> Result<bool>;

	/// Backing file, for stores that have one.
	fn location(&self) -> Option<PathBuf> {
		None
	}

	/// Moves the store to another file. Stores without a file ignore this.
	fn set_location(&self, _path: PathBuf) {}
}

/// Credential store backed by a ticket file.
#[derive(Debug)]
pub struct TicketFileStore {
	file: RwLock<TicketFile>,
	write: Mutex<()>,
}

impl TicketFileStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			file: RwLock::new(TicketFile::new(path)),
			write: Mutex::new(()),
		}
	}

	/// Store at the platform default location, if a home directory is known.
	pub fn at_default_location() -> Option<Self> {
		default_ticket_path().map(Self::new)
	}
}

impl CredentialStore for TicketFileStore {
	fn resolve(&self, address: &str, user: &str) -> Result<Option<Credential>> {
		let file = self.file.read().clone();
		let entry = file.get(address, user)?;
		Ok(entry.map(|entry| Credential::new(entry.ticket, entry.user, entry.address)))
	}

	fn persist(&self, credential: &Credential) -> Result<()> {
		let _guard = self.write.lock();
		let file = self.file.read().clone();
		file.upsert(TicketEntry::new(&credential.scope, &credential.user, &credential.ticket))?;
		debug!(target = "p4.credentials", path = %file.path().display(), user = %credential.user, scope = %credential.scope, "ticket stored");
		Ok(())
	}

	fn remove(&self, address: &str, user: &str) -> Result<bool> {
		let _guard = self.write.lock();
		let file = self.file.read().clone();
		Ok(file.remove(address, user)?)
	}

	fn location(&self) -> Option<PathBuf> {
		Some(self.file.read().path().to_path_buf())
	}

	fn set_location(&self, path: PathBuf) {
		let _guard = self.write.lock();
		debug!(target = "p4.credentials", path = %path.display(), "ticket file relocated");
		*self.file.write() = TicketFile::new(path);
	}
}

/// Credential store that keeps tickets in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
	entries: Mutex<HashMap<(String, String), Credential>>,
}

impl MemoryCredentialStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

impl CredentialStore for MemoryCredentialStore {
	fn resolve(&self, address: &str, user: &str) -> Result<Option<Credential>> {
		Ok(self.entries.lock().get(&(address.to_string(), user.to_string())).cloned())
	}

	fn persist(&self, credential: &Credential) -> Result<()> {
		self.entries
			.lock()
			.insert((credential.scope.clone(), credential.user.clone()), credential.clone());
		Ok(())
	}

	fn remove(&self, address: &str, user: &str) -> Result<bool> {
		Ok(self.entries.lock().remove(&(address.to_string(), user.to_string())).is_some())
	}
}
