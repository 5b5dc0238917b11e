//! Config file discovery and parsing.
//!
//! A config file is a plain `KEY=value` file (named by `P4CONFIG`, commonly
//! `.p4config`) placed somewhere above a working directory. The nearest one
//! wins. Blank lines and `#` comments are skipped, as are lines without `=`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Walks from `start` up through its ancestors and returns the first `name` file found.
pub fn find_config_file(start: &Path, name: &str) -> Option<PathBuf> {
	if name.is_empty() {
		return None;
	}
	let found = start.ancestors().map(|dir| dir.join(name)).find(|candidate| candidate.is_file());
	debug!(
		target = "p4.config",
		start = %start.display(),
		name,
		found = ?found.as_ref().map(|p| p.display().to_string()),
		"config file lookup"
	);
	found
}

/// Parsed contents of a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
	path: Option<PathBuf>,
	values: HashMap<String, String>,
}

impl ConfigFile {
	pub fn load(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
		let mut file = Self::parse(&content);
		file.path = Some(path.to_path_buf());
		Ok(file)
	}

	pub fn parse(content: &str) -> Self {
		let values = content
			.lines()
			.map(str::trim)
			.filter(|line| !line.is_empty() && !line.starts_with('#'))
			.filter_map(|line| line.split_once('='))
			.map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
			.filter(|(key, _)| !key.is_empty())
			.collect();
		Self { path: None, values }
	}

	/// Path the file was loaded from, if it came from disk.
	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.values.get(key).map(String::as_str).filter(|value| !value.is_empty())
	}

	pub fn port(&self) -> Option<&str> {
		self.get("P4PORT")
	}

	pub fn user(&self) -> Option<&str> {
		self.get("P4USER")
	}

	pub fn password(&self) -> Option<&str> {
		self.get("P4PASSWD")
	}

	pub fn client(&self) -> Option<&str> {
		self.get("P4CLIENT")
	}

	pub fn charset(&self) -> Option<&str> {
		self.get("P4CHARSET")
	}

	pub fn tickets(&self) -> Option<&str> {
		self.get("P4TICKETS")
	}
}
