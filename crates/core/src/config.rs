//! Connection parameters and change tracking.
//!
//! [`ConnectionConfig`] is a shared, thread-safe handle on the settings a
//! session connects with. Every effective change bumps a generation counter.
//! A session records which generation its open connection was built from and
//! treats any later generation as dirty, reconnecting before the next command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use p4_runtime::{ConfigFile, EnvDefaults, find_config_file};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;

/// Config file name used when `P4CONFIG` is not set.
pub const DEFAULT_CONFIG_NAME: &str = ".p4config";

/// How a server's identity fingerprint is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "fingerprint")]
pub enum TrustPolicy {
	/// Reject servers that present a fingerprint.
	#[default]
	None,
	/// Accept only this fingerprint (compared case-insensitively).
	Fingerprint(String),
	/// Accept whatever the server presents.
	AcceptAny,
}

impl TrustPolicy {
	pub fn accepts(&self, fingerprint: &str) -> bool {
		match self {
			TrustPolicy::None => false,
			TrustPolicy::Fingerprint(trusted) => trusted.eq_ignore_ascii_case(fingerprint),
			TrustPolicy::AcceptAny => true,
		}
	}
}

/// Connection fields that can be set by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
	Address,
	User,
	Password,
	Workspace,
	Charset,
	ProgramName,
	ProgramVersion,
}

/// Plain connection settings. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValues {
	pub address: String,
	pub user: String,
	#[serde(skip)]
	pub password: String,
	pub workspace: String,
	pub charset: String,
	pub cwd: Option<PathBuf>,
	/// Explicit config file; when unset, `config_name` is searched for above `cwd`.
	pub config_file: Option<PathBuf>,
	pub config_name: Option<String>,
	pub program_name: String,
	pub program_version: String,
	pub trust: TrustPolicy,
	/// Protocol tweaks sent with every command, in insertion order.
	pub protocol: Vec<(String, String)>,
}

impl ConfigValues {
	fn field_mut(&mut self, field: ConfigField) -> &mut String {
		match field {
			ConfigField::Address => &mut self.address,
			ConfigField::User => &mut self.user,
			ConfigField::Password => &mut self.password,
			ConfigField::Workspace => &mut self.workspace,
			ConfigField::Charset => &mut self.charset,
			ConfigField::ProgramName => &mut self.program_name,
			ConfigField::ProgramVersion => &mut self.program_version,
		}
	}

	pub fn get(&self, field: ConfigField) -> &str {
		match field {
			ConfigField::Address => &self.address,
			ConfigField::User => &self.user,
			ConfigField::Password => &self.password,
			ConfigField::Workspace => &self.workspace,
			ConfigField::Charset => &self.charset,
			ConfigField::ProgramName => &self.program_name,
			ConfigField::ProgramVersion => &self.program_version,
		}
	}

	/// Fills fields that are still empty from a config file.
	pub fn fill_from(&mut self, file: &ConfigFile) {
		let pairs = [
			(ConfigField::Address, file.port()),
			(ConfigField::User, file.user()),
			(ConfigField::Password, file.password()),
			(ConfigField::Workspace, file.client()),
			(ConfigField::Charset, file.charset()),
		];
		for (field, value) in pairs {
			let slot = self.field_mut(field);
			if let (true, Some(value)) = (slot.is_empty(), value) {
				*slot = value.to_string();
			}
		}
	}

	fn fill_from_env(&mut self, env: &EnvDefaults) {
		let pairs = [
			(ConfigField::Address, &env.port),
			(ConfigField::User, &env.user),
			(ConfigField::Password, &env.password),
			(ConfigField::Workspace, &env.client),
			(ConfigField::Charset, &env.charset),
		];
		for (field, value) in pairs {
			let slot = self.field_mut(field);
			if let (true, Some(value)) = (slot.is_empty(), value) {
				*slot = value.clone();
			}
		}
		if self.config_name.is_none() {
			self.config_name = env.config_name.clone();
		}
	}

	/// Locates the config file that applies to these values, if any.
	fn config_file_path(&self) -> Option<PathBuf> {
		if let Some(path) = &self.config_file {
			return Some(path.clone());
		}
		let cwd = self.cwd.as_deref()?;
		find_config_file(cwd, self.config_name.as_deref().unwrap_or(DEFAULT_CONFIG_NAME))
	}
}

/// Immutable copy of the configuration at one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
	generation: u64,
	values: ConfigValues,
}

impl ConfigSnapshot {
	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn values(&self) -> &ConfigValues {
		&self.values
	}

	pub fn address(&self) -> &str {
		&self.values.address
	}

	pub fn user(&self) -> &str {
		&self.values.user
	}

	pub fn password(&self) -> &str {
		&self.values.password
	}

	pub fn workspace(&self) -> &str {
		&self.values.workspace
	}

	pub fn charset(&self) -> &str {
		&self.values.charset
	}

	/// Returns the snapshot with empty fields filled from the applicable config file.
	///
	/// An unreadable config file is logged and ignored.
	pub fn resolved(&self) -> Self {
		let Some(path) = self.values.config_file_path() else {
			return self.clone();
		};
		match ConfigFile::load(&path) {
			Ok(file) => {
				let mut values = self.values.clone();
				values.fill_from(&file);
				debug!(target = "p4.config", path = %path.display(), "connection settings merged from config file");
				Self {
					generation: self.generation,
					values,
				}
			}
			Err(err) => {
				warn!(target = "p4.config", path = %path.display(), error = %err, "config file ignored");
				self.clone()
			}
		}
	}

	pub(crate) fn with_charset(mut self, charset: impl Into<String>) -> Self {
		self.values.charset = charset.into();
		self
	}
}

#[derive(Debug)]
struct ConfigState {
	values: ConfigValues,
	generation: u64,
	applied: Option<u64>,
}

/// Shared, mutable connection settings.
///
/// Cloning the handle shares the underlying settings; use
/// [`ConnectionConfig::new`] with [`ConnectionConfig::values`] for an
/// independent copy.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	state: Arc<RwLock<ConfigState>>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self::new(ConfigValues::default())
	}
}

impl ConnectionConfig {
	pub fn new(values: ConfigValues) -> Self {
		Self {
			state: Arc::new(RwLock::new(ConfigState {
				values,
				generation: 1,
				applied: None,
			})),
		}
	}

	/// Settings from `P4PORT`, `P4USER`, `P4PASSWD`, `P4CLIENT`, `P4CHARSET` and `P4CONFIG`.
	pub fn from_env() -> Self {
		Self::from_env_defaults(&EnvDefaults::from_env())
	}

	pub fn from_env_defaults(env: &EnvDefaults) -> Self {
		let mut values = ConfigValues::default();
		values.fill_from_env(env);
		Self::new(values)
	}

	/// Settings for a working directory: its config file first, then the environment.
	///
	/// Fails only when a config file is found but cannot be read.
	pub fn from_path(cwd: impl AsRef<Path>) -> Result<Self> {
		Self::from_path_with(cwd.as_ref(), &EnvDefaults::from_env())
	}

	pub fn from_path_with(cwd: &Path, env: &EnvDefaults) -> Result<Self> {
		let mut values = ConfigValues {
			cwd: Some(cwd.to_path_buf()),
			config_name: env.config_name.clone(),
			..Default::default()
		};
		if let Some(path) = values.config_file_path() {
			let file = ConfigFile::load(&path)?;
			values.fill_from(&file);
			values.config_file = Some(path);
		}
		values.fill_from_env(env);
		Ok(Self::new(values))
	}

	pub fn values(&self) -> ConfigValues {
		self.state.read().values.clone()
	}

	pub fn generation(&self) -> u64 {
		self.state.read().generation
	}

	pub fn get(&self, field: ConfigField) -> String {
		self.state.read().values.get(field).to_string()
	}

	/// Sets a field by name; `None` clears it.
	pub fn set(&self, field: ConfigField, value: Option<&str>) -> bool {
		let value = value.unwrap_or_default().to_string();
		self.update(|values| *values.field_mut(field) = value)
	}

	/// Applies `change` and bumps the generation when it changed anything.
	///
	/// Returns whether the settings changed.
	pub fn update(&self, change: impl FnOnce(&mut ConfigValues)) -> bool {
		let mut state = self.state.write();
		let before = state.values.clone();
		change(&mut state.values);
		if state.values == before {
			return false;
		}
		state.generation += 1;
		debug!(target = "p4.config", generation = state.generation, "connection settings changed");
		true
	}

	pub fn set_address(&self, address: &str) -> bool {
		self.set(ConfigField::Address, Some(address))
	}

	pub fn set_user(&self, user: &str) -> bool {
		self.set(ConfigField::User, Some(user))
	}

	pub fn set_password(&self, password: &str) -> bool {
		self.set(ConfigField::Password, Some(password))
	}

	pub fn set_workspace(&self, workspace: &str) -> bool {
		self.set(ConfigField::Workspace, Some(workspace))
	}

	pub fn set_charset(&self, charset: &str) -> bool {
		self.set(ConfigField::Charset, Some(charset))
	}

	pub fn set_cwd(&self, cwd: Option<PathBuf>) -> bool {
		self.update(|values| values.cwd = cwd)
	}

	pub fn set_config_file(&self, path: Option<PathBuf>) -> bool {
		self.update(|values| values.config_file = path)
	}

	pub fn set_trust(&self, trust: TrustPolicy) -> bool {
		self.update(|values| values.trust = trust)
	}

	/// Sets a protocol tweak, replacing an earlier value for the same key.
	pub fn set_protocol(&self, key: &str, value: &str) -> bool {
		self.update(|values| match values.protocol.iter_mut().find(|(existing, _)| existing == key) {
			Some(entry) => entry.1 = value.to_string(),
			None => values.protocol.push((key.to_string(), value.to_string())),
		})
	}

	/// Copy of the current settings tagged with their generation.
	pub fn snapshot(&self) -> ConfigSnapshot {
		let state = self.state.read();
		ConfigSnapshot {
			generation: state.generation,
			values: state.values.clone(),
		}
	}

	/// Returns `true` when settings changed since the last applied snapshot.
	pub fn is_dirty(&self) -> bool {
		let state = self.state.read();
		state.applied != Some(state.generation)
	}

	/// Marks `snapshot` as applied to a live connection.
	///
	/// Has no effect when the settings moved on after the snapshot was taken,
	/// so the newer change stays dirty.
	pub fn clear_dirty(&self, snapshot: &ConfigSnapshot) -> bool {
		let mut state = self.state.write();
		if state.generation != snapshot.generation {
			return false;
		}
		state.applied = Some(snapshot.generation);
		true
	}

	/// Forgets the applied generation so the next command reconnects.
	pub(crate) fn invalidate(&self) {
		self.state.write().applied = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::fs;
	use tempfile::TempDir;

	#[test]
	fn changes_bump_generation_and_mark_dirty() {
		let config = ConnectionConfig::default();
		config.set_address("perforce:1666");
		let snapshot = config.snapshot();
		assert!(config.clear_dirty(&snapshot));
		assert!(!config.is_dirty());

		config.set_user("admin");
		assert!(config.is_dirty());
		assert!(config.generation() > snapshot.generation());
	}

	#[test]
	fn setting_same_value_is_not_a_change() {
		let config = ConnectionConfig::default();
		config.set_user("admin");
		let snapshot = config.snapshot();
		config.clear_dirty(&snapshot);

		assert!(!config.set_user("admin"));
		assert!(!config.is_dirty());
	}

	#[test]
	fn stale_snapshot_does_not_clear_newer_change() {
		let config = ConnectionConfig::default();
		let stale = config.snapshot();
		config.set_workspace("ws");
		assert!(!config.clear_dirty(&stale));
		assert!(config.is_dirty());
	}

	#[test]
	fn protocol_tweaks_replace_by_key() {
		let config = ConnectionConfig::default();
		config.set_protocol("tag", "");
		config.set_protocol("specstring", "");
		config.set_protocol("tag", "1");
		assert_eq!(config.values().protocol, vec![("tag".to_string(), "1".to_string()), ("specstring".to_string(), String::new())]);
	}

	#[test]
	fn trust_policy_matches_fingerprint_case_insensitively() {
		let policy = TrustPolicy::Fingerprint("AB:CD:EF".into());
		assert!(policy.accepts("ab:cd:ef"));
		assert!(!policy.accepts("00:11:22"));
		assert!(!TrustPolicy::None.accepts("ab:cd:ef"));
		assert!(TrustPolicy::AcceptAny.accepts("anything"));
	}

	#[test]
	fn from_path_prefers_config_file_over_environment() {
		let tmp = TempDir::new().unwrap();
		let ws = tmp.path().join("ws");
		fs::create_dir_all(ws.join("src")).unwrap();
		fs::write(ws.join(".p4config"), "P4PORT=file:1666\nP4CLIENT=file_ws\n").unwrap();

		let vars: HashMap<&str, &str> = HashMap::from([("P4PORT", "env:1666"), ("P4USER", "env_user")]);
		let env = EnvDefaults::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
		let config = ConnectionConfig::from_path_with(&ws.join("src"), &env).unwrap();
		let values = config.values();

		assert_eq!(values.address, "file:1666");
		assert_eq!(values.workspace, "file_ws");
		assert_eq!(values.user, "env_user");
		assert_eq!(values.config_file, Some(ws.join(".p4config")));
	}

	#[test]
	fn snapshot_resolution_fills_only_empty_fields() {
		let tmp = TempDir::new().unwrap();
		fs::write(tmp.path().join(".p4config"), "P4PORT=file:1666\nP4USER=file_user\n").unwrap();

		let config = ConnectionConfig::default();
		config.set_user("explicit");
		config.set_cwd(Some(tmp.path().to_path_buf()));
		let resolved = config.snapshot().resolved();

		assert_eq!(resolved.address(), "file:1666");
		assert_eq!(resolved.user(), "explicit");
	}
}
