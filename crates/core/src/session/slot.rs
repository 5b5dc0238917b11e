//! Connection slot: the session's single live connection and its lifecycle.
//!
//! Readers (commands checking the connection) take the slot read lock only
//! briefly. Opening a connection is serialized by the connect gate, so at
//! most one thread connects at a time while commands already running on the
//! previous connection finish undisturbed.

use std::sync::Arc;

use p4_protocol::ServerProtocol;
use tracing::{debug, info, warn};

use super::idle::ActiveGuard;
use super::{SessionInner, SessionState};
use crate::config::ConfigSnapshot;
use crate::credentials::{Credential, LoginOptions, LogoutOptions};
use crate::error::{ConnectFailure, Error, Result};
use crate::results::ErrorRecord;
use crate::transport::{Authentication, Connection, Transport};

/// Character set a unicode server is spoken to in when none is configured.
const AUTO_CHARSET: &str = "utf8";
const NO_CHARSET: &str = "none";
const LEASE_ATTEMPTS: usize = 3;

/// An authenticated connection and the settings it was opened with.
#[derive(Clone)]
pub(crate) struct LiveConnection {
	pub(crate) transport: Arc<dyn Transport>,
	pub(crate) server: ServerProtocol,
	/// Resolved settings, with the negotiated character set.
	pub(crate) target: Arc<ConfigSnapshot>,
	pub(crate) auth: Authentication,
}

pub(crate) struct ConnectionSlot {
	state: SessionState,
	pub(crate) live: Option<LiveConnection>,
	last_error: Option<ErrorRecord>,
	reconnect_required: bool,
}

impl Default for ConnectionSlot {
	fn default() -> Self {
		Self {
			state: SessionState::Disconnected,
			live: None,
			last_error: None,
			reconnect_required: false,
		}
	}
}

/// A connection borrowed by one running command.
///
/// Holding a lease keeps the idle monitor from closing the connection.
pub(crate) struct Lease {
	pub(crate) live: LiveConnection,
	_active: ActiveGuard,
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
	std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn reconnect_required_error() -> Error {
	Error::connect(
		ConnectFailure::ReconnectRequired,
		"A cancelled command abandoned the connection; call reconnect before running more commands.",
	)
}

impl SessionInner {
	pub(crate) fn state(&self) -> SessionState {
		let slot = self.slot.read();
		if slot.reconnect_required { SessionState::Failed } else { slot.state }
	}

	pub(crate) fn is_connected(&self) -> bool {
		let slot = self.slot.read();
		slot.state == SessionState::Connected && slot.live.as_ref().is_some_and(|live| live.transport.is_alive())
	}

	pub(crate) fn connection_error(&self) -> Option<ErrorRecord> {
		self.slot.read().last_error.clone()
	}

	pub(crate) fn live(&self) -> Option<LiveConnection> {
		self.slot.read().live.clone()
	}

	fn usable(&self, slot: &ConnectionSlot) -> bool {
		slot.state == SessionState::Connected && !self.config.is_dirty() && slot.live.as_ref().is_some_and(|live| live.transport.is_alive())
	}

	/// Borrows the live connection, opening or re-opening it as needed.
	pub(crate) fn lease(&self) -> Result<Lease> {
		for attempt in 1..=LEASE_ATTEMPTS {
			{
				let slot = self.slot.read();
				if slot.reconnect_required {
					return Err(reconnect_required_error());
				}
				// Settings that keep changing under us must not starve the command.
				let accept_dirty = attempt == LEASE_ATTEMPTS;
				let ready = self.usable(&slot) || (accept_dirty && slot.state == SessionState::Connected);
				if let (true, Some(live)) = (ready, &slot.live) {
					return Ok(Lease {
						live: live.clone(),
						_active: self.idle.enter(),
					});
				}
			}
			self.establish(false)?;
		}
		Err(Error::connect(ConnectFailure::ConnectionLost, "connection closed before it could be used"))
	}

	pub(crate) fn connect(&self) -> Result<()> {
		{
			let slot = self.slot.read();
			if !slot.reconnect_required && self.usable(&slot) {
				return Ok(());
			}
		}
		self.establish(true)
	}

	pub(crate) fn reconnect(&self) -> Result<()> {
		self.establish(true)
	}

	pub(crate) fn disconnect(&self) {
		let _gate = self.connect_gate.lock();
		let previous = {
			let mut slot = self.slot.write();
			slot.state = SessionState::Disconnected;
			slot.live.take()
		};
		if let Some(live) = previous {
			live.transport.close();
			info!(target = "p4.session", address = %live.target.address(), "disconnected");
		}
	}

	/// Opens a connection from the current settings and installs it in the slot.
	///
	/// `explicit` connects even when the slot is usable and clears the
	/// reconnect requirement; implicit connects from a command honour both.
	fn establish(&self, explicit: bool) -> Result<()> {
		let _gate = self.connect_gate.lock();
		let previous = {
			let mut slot = self.slot.write();
			if !explicit {
				if slot.reconnect_required {
					return Err(reconnect_required_error());
				}
				if self.usable(&slot) {
					return Ok(());
				}
			}
			slot.state = if slot.live.is_some() { SessionState::Reconnecting } else { SessionState::Connecting };
			slot.live.take()
		};
		if let Some(previous) = previous {
			if explicit {
				previous.transport.close();
			}
			debug!(target = "p4.session", address = %previous.target.address(), "previous connection released");
		}

		let snapshot = self.config.snapshot();
		match self.open(&snapshot) {
			Ok(live) => {
				info!(
					target = "p4.session",
					address = %live.target.address(),
					user = %live.target.user(),
					charset = %live.target.charset(),
					api_level = live.server.api_level,
					"connected"
				);
				let mut slot = self.slot.write();
				slot.state = SessionState::Connected;
				slot.live = Some(live);
				slot.last_error = None;
				slot.reconnect_required = false;
				self.config.clear_dirty(&snapshot);
				self.idle.touch();
				Ok(())
			}
			Err(err) => {
				warn!(target = "p4.session", address = %snapshot.address(), error = %err, "connect failed");
				let mut slot = self.slot.write();
				slot.state = SessionState::Failed;
				slot.last_error = Some(ErrorRecord::from_error(&err));
				Err(err)
			}
		}
	}

	/// Connects, checks the handshake and authenticates.
	fn open(&self, snapshot: &ConfigSnapshot) -> Result<LiveConnection> {
		let (connection, target) = self.handshake(snapshot)?;
		let auth = self.authentication_for(&target);
		connection.transport.authenticate(target.user(), &auth)?;
		Ok(LiveConnection {
			transport: connection.transport,
			server: connection.server,
			target: Arc::new(target),
			auth,
		})
	}

	/// Connects and validates protocol level, trust and character set, without authenticating.
	fn handshake(&self, snapshot: &ConfigSnapshot) -> Result<(Connection, ConfigSnapshot)> {
		let target = snapshot.resolved();
		let connection = self.connector.connect(&target)?;
		let server = &connection.server;

		if !server.is_supported() {
			return Err(Error::connect(
				ConnectFailure::ProtocolMismatch,
				format!(
					"Server protocol level {} is older than the lowest supported level {}.",
					server.api_level,
					ServerProtocol::MIN_API_LEVEL
				),
			));
		}

		if let Some(fingerprint) = &server.fingerprint {
			if !target.values().trust.accepts(fingerprint) {
				return Err(Error::connect(
					ConnectFailure::TrustRequired,
					format!("The authenticity of '{}' can't be established; fingerprint is {fingerprint}.", target.address()),
				)
				.with_fingerprint(Some(fingerprint.clone())));
			}
		}

		let target = negotiate_charset(target, server)?;
		Ok((connection, target))
	}

	fn authentication_for(&self, target: &ConfigSnapshot) -> Authentication {
		if !target.password().is_empty() {
			return Authentication::Password(target.password().to_string());
		}
		if target.user().is_empty() {
			return Authentication::None;
		}
		match self.credentials().resolve(target.address(), target.user()) {
			Ok(Some(credential)) if !credential.is_expired() => Authentication::Ticket(credential),
			Ok(_) => Authentication::None,
			Err(err) => {
				warn!(target = "p4.credentials", error = %err, "stored ticket unreadable; connecting without one");
				Authentication::None
			}
		}
	}

	/// Detaches `transport` from the slot if it is still the live connection.
	///
	/// Commands still running on it keep their own handle and finish normally.
	pub(crate) fn abandon(&self, transport: &Arc<dyn Transport>, reconnect_required: bool, error: Option<ErrorRecord>) {
		let mut slot = self.slot.write();
		let is_live = slot.live.as_ref().is_some_and(|live| same_transport(&live.transport, transport));
		if !is_live {
			return;
		}
		slot.live = None;
		slot.state = SessionState::Failed;
		slot.reconnect_required |= reconnect_required;
		if error.is_some() {
			slot.last_error = error;
		}
		debug!(target = "p4.session", reconnect_required, "connection abandoned");
	}

	/// Closes the connection if it is still idle. Returns whether it closed one.
	pub(crate) fn idle_disconnect(&self) -> bool {
		let _gate = self.connect_gate.lock();
		let mut slot = self.slot.write();
		if !self.idle.expired_and_quiet() {
			return false;
		}
		self.idle.disarm();
		let Some(live) = slot.live.take() else {
			return false;
		};
		slot.state = SessionState::Disconnected;
		drop(slot);
		live.transport.close();
		info!(target = "p4.idle", address = %live.target.address(), wait = ?self.idle.wait(), "idle connection closed");
		true
	}

	/// The live connection, when it still matches the current settings.
	fn current_connection(&self) -> Option<LiveConnection> {
		let slot = self.slot.read();
		if self.usable(&slot) { slot.live.clone() } else { None }
	}

	pub(crate) fn login(&self, password: &str, options: &LoginOptions) -> Result<Credential> {
		let (transport, target) = match self.current_connection() {
			Some(live) => (live.transport, (*live.target).clone()),
			None => {
				let (connection, target) = self.handshake(&self.config.snapshot()).inspect_err(|err| self.note_failure(err))?;
				(connection.transport, target)
			}
		};

		let credential = transport.login(target.user(), password, options).inspect_err(|err| self.note_failure(err))?;
		self.credentials().persist(&credential)?;
		info!(target = "p4.session", user = %credential.user, scope = %credential.scope, all_hosts = options.all_hosts, "login succeeded");

		// A connection that failed to authenticate earlier can now use the ticket.
		let mut slot = self.slot.write();
		if slot.state == SessionState::Failed && !slot.reconnect_required {
			slot.last_error = None;
		}
		Ok(credential)
	}

	pub(crate) fn logout(&self, options: &LogoutOptions) -> Result<()> {
		let (transport, target) = match self.current_connection() {
			Some(live) => (live.transport, (*live.target).clone()),
			None => {
				let (connection, target) = self.handshake(&self.config.snapshot()).inspect_err(|err| self.note_failure(err))?;
				(connection.transport, target)
			}
		};

		transport.logout(target.user(), options)?;
		let removed = self.credentials().remove(target.address(), target.user())?;
		info!(target = "p4.session", user = %target.user(), removed, all_hosts = options.all_hosts, "logged out");

		// The open connection was authenticated with the ticket just invalidated.
		let mut slot = self.slot.write();
		let ticket_auth = slot.live.as_ref().is_some_and(|live| matches!(live.auth, Authentication::Ticket(_)));
		if ticket_auth {
			slot.live = None;
			slot.state = SessionState::Disconnected;
			self.config.invalidate();
		}
		Ok(())
	}

	fn note_failure(&self, err: &Error) {
		self.slot.write().last_error = Some(ErrorRecord::from_error(err));
	}
}

fn negotiate_charset(target: ConfigSnapshot, server: &ServerProtocol) -> Result<ConfigSnapshot> {
	let charset = target.charset().to_string();
	match (server.unicode, charset.as_str()) {
		(true, "") => Ok(target.with_charset(AUTO_CHARSET)),
		(true, NO_CHARSET) => Err(Error::connect(
			ConnectFailure::ProtocolMismatch,
			"Unicode server permits only unicode enabled clients.",
		)),
		(false, "") | (false, NO_CHARSET) | (true, _) => Ok(target),
		(false, _) => Err(Error::connect(
			ConnectFailure::ProtocolMismatch,
			format!("Unicode clients require a unicode enabled server; charset '{charset}' cannot be used."),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConnectionConfig;

	fn snapshot(charset: &str) -> ConfigSnapshot {
		let config = ConnectionConfig::default();
		config.set_charset(charset);
		config.snapshot()
	}

	fn server(unicode: bool) -> ServerProtocol {
		ServerProtocol {
			api_level: 57,
			unicode,
			..Default::default()
		}
	}

	#[test]
	fn unicode_server_defaults_to_utf8() {
		let target = negotiate_charset(snapshot(""), &server(true)).unwrap();
		assert_eq!(target.charset(), "utf8");
	}

	#[test]
	fn explicit_charset_is_kept_on_unicode_server() {
		let target = negotiate_charset(snapshot("utf16le"), &server(true)).unwrap();
		assert_eq!(target.charset(), "utf16le");
	}

	#[test]
	fn charset_on_non_unicode_server_is_a_mismatch() {
		let err = negotiate_charset(snapshot("utf8"), &server(false)).unwrap_err();
		assert!(matches!(err, Error::Connect { kind: ConnectFailure::ProtocolMismatch, .. }));
		assert!(negotiate_charset(snapshot("none"), &server(false)).is_ok());
	}

	#[test]
	fn charset_none_on_unicode_server_is_a_mismatch() {
		assert!(negotiate_charset(snapshot("none"), &server(true)).is_err());
	}
}
