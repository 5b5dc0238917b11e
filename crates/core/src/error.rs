//! Error types for session operations.
//!
//! Every failure a caller can observe maps onto one [`Error`] variant. Failures
//! that happen while a command runs are also recorded on the command's error
//! channel as [`ErrorRecord`]s, and the variant returned to the caller carries
//! that same list.

use std::fmt;
use std::time::Duration;

use p4_protocol::codes;
use serde::Serialize;
use thiserror::Error;

use crate::registry::CommandId;
use crate::results::{ErrorKind, ErrorRecord};

/// Why a connection could not be opened or kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectFailure {
	/// Nothing answered at the configured address.
	Unreachable,
	/// Server protocol level or character set is incompatible.
	ProtocolMismatch,
	/// Server fingerprint is not trusted.
	TrustRequired,
	/// A cancelled command abandoned the connection; call `reconnect` first.
	ReconnectRequired,
	/// Connection dropped while a command was running.
	ConnectionLost,
}

impl ConnectFailure {
	/// Message code recorded for this failure.
	pub fn code(self) -> u32 {
		match self {
			ConnectFailure::Unreachable => codes::CONNECT_FAILED,
			ConnectFailure::ProtocolMismatch => codes::PROTOCOL_MISMATCH,
			ConnectFailure::TrustRequired => codes::TRUST_REQUIRED,
			ConnectFailure::ReconnectRequired => codes::RECONNECT_REQUIRED,
			ConnectFailure::ConnectionLost => codes::CONNECTION_LOST,
		}
	}
}

impl fmt::Display for ConnectFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ConnectFailure::Unreachable => "unreachable",
			ConnectFailure::ProtocolMismatch => "protocol mismatch",
			ConnectFailure::TrustRequired => "trust required",
			ConnectFailure::ReconnectRequired => "reconnect required",
			ConnectFailure::ConnectionLost => "connection lost",
		})
	}
}

/// Why the server refused the session's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthFailure {
	BadPassword,
	AccessDenied,
	PasswordRequired,
	TicketExpired,
}

impl AuthFailure {
	pub fn code(self) -> u32 {
		match self {
			AuthFailure::BadPassword => codes::PASSWORD_INVALID,
			AuthFailure::AccessDenied => codes::ACCESS_DENIED,
			AuthFailure::PasswordRequired => codes::PASSWORD_REQUIRED,
			AuthFailure::TicketExpired => codes::TICKET_EXPIRED,
		}
	}
}

impl fmt::Display for AuthFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			AuthFailure::BadPassword => "bad password",
			AuthFailure::AccessDenied => "access denied",
			AuthFailure::PasswordRequired => "password required",
			AuthFailure::TicketExpired => "ticket expired",
		})
	}
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Connection could not be established, was lost, or must be re-established explicitly.
	#[error("connect failed ({kind}): {message}")]
	Connect {
		kind: ConnectFailure,
		message: String,
		/// Fingerprint the server presented, for [`ConnectFailure::TrustRequired`].
		fingerprint: Option<String>,
		errors: Vec<ErrorRecord>,
	},

	#[error("authentication failed ({kind}): {message}")]
	Auth {
		kind: AuthFailure,
		message: String,
		errors: Vec<ErrorRecord>,
	},

	/// Command ran and reported errors at or above the throw threshold.
	#[error("command {id} failed: {}", summarize(errors))]
	Command { id: CommandId, errors: Vec<ErrorRecord> },

	#[error("command {id} was cancelled")]
	Cancelled { id: CommandId, errors: Vec<ErrorRecord> },

	/// One or more workers of a parallel operation failed.
	#[error("command {id}: {failed} of {workers} parallel workers failed")]
	Aggregate {
		id: CommandId,
		workers: usize,
		failed: usize,
		errors: Vec<ErrorRecord>,
	},

	#[error("command {id} exceeded its run timeout of {timeout:?}")]
	Timeout {
		id: CommandId,
		timeout: Duration,
		errors: Vec<ErrorRecord>,
	},

	/// A command with this id is still running.
	#[error("command id {0} is already in use by a running command")]
	DuplicateActiveId(CommandId),

	#[error("no command registered with id {0}")]
	UnknownCommand(CommandId),

	#[error(transparent)]
	Runtime(#[from] p4_runtime::Error),
}

impl Error {
	/// Builds a connect failure without an attached error list.
	pub fn connect(kind: ConnectFailure, message: impl Into<String>) -> Self {
		Error::Connect {
			kind,
			message: message.into(),
			fingerprint: None,
			errors: Vec::new(),
		}
	}

	pub fn auth(kind: AuthFailure, message: impl Into<String>) -> Self {
		Error::Auth {
			kind,
			message: message.into(),
			errors: Vec::new(),
		}
	}

	/// Error records carried by this error; empty for errors raised outside a command.
	pub fn errors(&self) -> &[ErrorRecord] {
		match self {
			Error::Connect { errors, .. }
			| Error::Auth { errors, .. }
			| Error::Command { errors, .. }
			| Error::Cancelled { errors, .. }
			| Error::Aggregate { errors, .. }
			| Error::Timeout { errors, .. } => errors,
			Error::DuplicateActiveId(_) | Error::UnknownCommand(_) | Error::Runtime(_) => &[],
		}
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled { .. })
	}

	/// Category of this error as it appears on an error record.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Connect { kind, .. } => ErrorKind::Connect(*kind),
			Error::Auth { kind, .. } => ErrorKind::Auth(*kind),
			Error::Cancelled { .. } => ErrorKind::Cancelled,
			Error::Aggregate { .. } => ErrorKind::Aggregate,
			Error::Timeout { .. } => ErrorKind::Timeout,
			Error::Command { .. } | Error::DuplicateActiveId(_) | Error::UnknownCommand(_) | Error::Runtime(_) => ErrorKind::Command,
		}
	}

	/// Replaces the attached error list on variants that carry one.
	pub(crate) fn with_errors(mut self, records: Vec<ErrorRecord>) -> Self {
		match &mut self {
			Error::Connect { errors, .. }
			| Error::Auth { errors, .. }
			| Error::Command { errors, .. }
			| Error::Cancelled { errors, .. }
			| Error::Aggregate { errors, .. }
			| Error::Timeout { errors, .. } => *errors = records,
			Error::DuplicateActiveId(_) | Error::UnknownCommand(_) | Error::Runtime(_) => {}
		}
		self
	}

	pub(crate) fn with_fingerprint(mut self, value: Option<String>) -> Self {
		if let Error::Connect { fingerprint, .. } = &mut self {
			*fingerprint = value;
		}
		self
	}
}

fn summarize(errors: &[ErrorRecord]) -> String {
	match errors {
		[] => "no error detail".to_string(),
		[only] => only.message.clone(),
		[first, rest @ ..] => format!("{} (+{} more)", first.message, rest.len()),
	}
}

/// Error a subscriber or user callback returns to report its own failure.
///
/// Callback failures are logged and contained; they never reach the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CallbackError(String);

impl CallbackError {
	pub fn new(message: impl Into<String>) -> Self {
		Self(message.into())
	}
}

impl From<&str> for CallbackError {
	fn from(message: &str) -> Self {
		Self::new(message)
	}
}

impl From<String> for CallbackError {
	fn from(message: String) -> Self {
		Self(message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use p4_protocol::ErrorSeverity;

	#[test]
	fn display_summarizes_first_error() {
		let records = vec![
			ErrorRecord::new(ErrorSeverity::Failed, 1, "no such file(s).", ErrorKind::Command),
			ErrorRecord::new(ErrorSeverity::Failed, 2, "file(s) not on client.", ErrorKind::Command),
		];
		let err = Error::Command {
			id: CommandId(7),
			errors: records,
		};
		assert_eq!(err.to_string(), "command 7 failed: no such file(s). (+1 more)");
		assert_eq!(err.errors().len(), 2);
	}

	#[test]
	fn kind_follows_variant() {
		let err = Error::auth(AuthFailure::BadPassword, "Password invalid.");
		assert_eq!(err.kind(), ErrorKind::Auth(AuthFailure::BadPassword));
		assert!(err.errors().is_empty());
		assert!(!err.is_cancelled());
	}

	#[test]
	fn with_errors_attaches_records_to_connect_failures() {
		let record = ErrorRecord::new(ErrorSeverity::Failed, codes::CONNECT_FAILED, "TCP connect failed", ErrorKind::Connect(ConnectFailure::Unreachable));
		let err = Error::connect(ConnectFailure::Unreachable, "TCP connect failed").with_errors(vec![record.clone()]);
		assert_eq!(err.errors(), &[record]);
	}

	#[test]
	fn failure_codes_match_well_known_server_codes() {
		assert_eq!(AuthFailure::BadPassword.code(), 807_672_853);
		assert_eq!(ConnectFailure::Unreachable.code(), 824_577_061);
	}
}
