//! Ticket file persistence.
//!
//! The file holds one line per (server, user) pair:
//!
//! ```text
//! perforce:1666=admin:9F0C3E5A2D1B4C7E8F9A0B1C2D3E4F50
//! ssl:buildfarm:1667=builder:0A1B2C3D4E5F60718293A4B5C6D7E8F9
//! ```
//!
//! The server address runs up to the first `=`, the ticket follows the last
//! `:`. Lines that do not fit this shape are skipped with a warning and
//! dropped on the next write. Writes go through a sibling temp file and a rename so readers never
//! observe a half-written file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One persisted ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketEntry {
	pub address: String,
	pub user: String,
	pub ticket: String,
}

impl TicketEntry {
	pub fn new(address: impl Into<String>, user: impl Into<String>, ticket: impl Into<String>) -> Self {
		Self {
			address: address.into(),
			user: user.into(),
			ticket: ticket.into(),
		}
	}

	fn matches(&self, address: &str, user: &str) -> bool {
		self.address == address && self.user == user
	}

	fn to_line(&self) -> String {
		format!("{}={}:{}", self.address, self.user, self.ticket)
	}
}

/// Handle on a ticket file at a fixed path.
#[derive(Debug, Clone)]
pub struct TicketFile {
	path: PathBuf,
}

impl TicketFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Reads every entry. A missing file reads as empty.
	pub fn load(&self) -> Result<Vec<TicketEntry>> {
		let content = match fs::read_to_string(&self.path) {
			Ok(content) => content,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(Error::io(&self.path, err)),
		};
		Ok(parse_entries(&self.path, &content))
	}

	/// Returns the ticket stored for `address` and `user`.
	pub fn get(&self, address: &str, user: &str) -> Result<Option<TicketEntry>> {
		Ok(self.load()?.into_iter().find(|entry| entry.matches(address, user)))
	}

	/// Inserts or replaces the entry for the entry's (address, user) pair.
	pub fn upsert(&self, entry: TicketEntry) -> Result<()> {
		let mut entries = self.load()?;
		match entries.iter_mut().find(|existing| existing.matches(&entry.address, &entry.user)) {
			Some(existing) => existing.ticket = entry.ticket,
			None => entries.push(entry),
		}
		self.store(&entries)
	}

	/// Removes the entry for `address` and `user`; returns whether one existed.
	pub fn remove(&self, address: &str, user: &str) -> Result<bool> {
		let mut entries = self.load()?;
		let before = entries.len();
		entries.retain(|entry| !entry.matches(address, user));
		if entries.len() == before {
			return Ok(false);
		}
		self.store(&entries)?;
		Ok(true)
	}

	fn store(&self, entries: &[TicketEntry]) -> Result<()> {
		if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
		}

		let mut content = String::new();
		for entry in entries {
			content.push_str(&entry.to_line());
			content.push('\n');
		}

		let tmp = self.path.with_extension("tmp");
		fs::write(&tmp, content).map_err(|err| Error::io(&tmp, err))?;
		fs::rename(&tmp, &self.path).map_err(|err| Error::io(&self.path, err))?;
		debug!(target = "p4.tickets", path = %self.path.display(), entries = entries.len(), "ticket file written");
		Ok(())
	}
}

fn parse_entries(path: &Path, content: &str) -> Vec<TicketEntry> {
	content
		.lines()
		.enumerate()
		.filter(|(_, raw)| !raw.trim().is_empty())
		.filter_map(|(index, raw)| match parse_line(raw.trim()) {
			Ok(entry) => Some(entry),
			Err(reason) => {
				warn!(target = "p4.tickets", path = %path.display(), line = index + 1, reason, "skipping malformed ticket line");
				None
			}
		})
		.collect()
}

fn parse_line(line: &str) -> std::result::Result<TicketEntry, &'static str> {
	let (address, rest) = line.split_once('=').ok_or("missing '='")?;
	let (user, ticket) = rest.rsplit_once(':').ok_or("missing ':' before ticket")?;
	if address.is_empty() || user.is_empty() || ticket.is_empty() {
		return Err("empty address, user or ticket");
	}
	Ok(TicketEntry::new(address, user, ticket))
}
