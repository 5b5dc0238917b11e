//! Environment defaults, read once when a configuration is built.

use std::path::PathBuf;

/// Connection defaults taken from `P4*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDefaults {
	pub port: Option<String>,
	pub user: Option<String>,
	pub password: Option<String>,
	pub client: Option<String>,
	pub charset: Option<String>,
	pub config_name: Option<String>,
	pub tickets: Option<PathBuf>,
}

impl EnvDefaults {
	/// Snapshot of the process environment.
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds defaults from an arbitrary lookup; empty values count as unset.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
		Self {
			port: get("P4PORT"),
			user: get("P4USER"),
			password: get("P4PASSWD"),
			client: get("P4CLIENT"),
			charset: get("P4CHARSET"),
			config_name: get("P4CONFIG"),
			tickets: get("P4TICKETS").map(PathBuf::from),
		}
	}
}

/// Default ticket file location for the current user.
///
/// `%USERPROFILE%\p4tickets.txt` on Windows, `~/.p4tickets` elsewhere.
pub fn default_ticket_path() -> Option<PathBuf> {
	let home = dirs::home_dir()?;
	if cfg!(windows) {
		Some(home.join("p4tickets.txt"))
	} else {
		Some(home.join(".p4tickets"))
	}
}
