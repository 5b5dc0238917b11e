//! Handshake metadata reported when a connection is opened.

use serde::{Deserialize, Serialize};

/// Capabilities and identity a server reports during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProtocol {
	/// Server version string, e.g. `P4D/LINUX26X86_64/2023.1/2468153`.
	#[serde(default)]
	pub version: String,
	/// Protocol level the server speaks.
	pub api_level: u32,
	/// Server stores metadata in unicode mode and requires a client charset.
	#[serde(default)]
	pub unicode: bool,
	/// Server expects ticket-based login rather than per-command passwords.
	#[serde(default)]
	pub login_required: bool,
	/// Server supports the extended submit flow.
	#[serde(default)]
	pub ext_submit: bool,
	/// Identity fingerprint presented by an SSL endpoint.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub fingerprint: Option<String>,
}

impl ServerProtocol {
	/// Lowest protocol level the session layer can talk to.
	pub const MIN_API_LEVEL: u32 = 33;

	/// Returns `true` when the server speaks a protocol level this client supports.
	pub fn is_supported(&self) -> bool {
		self.api_level >= Self::MIN_API_LEVEL
	}
}
