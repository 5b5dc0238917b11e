//! Well-known message codes.
//!
//! Server codes are the values servers report for the conditions the session
//! layer has to recognize. Client codes are raised by the session layer itself
//! and live in a range servers do not use.

/// Server rejected the password supplied for the user.
pub const PASSWORD_INVALID: u32 = 807_672_853;
/// Command requires a workspace the server does not know.
pub const CLIENT_UNKNOWN: u32 = 855_775_267;
/// TCP connect to the server address failed.
pub const CONNECT_FAILED: u32 = 824_577_061;

const CLIENT_BASE: u32 = 0x7F00_0000;

/// Server requires a password or ticket and none was supplied.
pub const PASSWORD_REQUIRED: u32 = CLIENT_BASE + 1;
/// Server refused access for the user.
pub const ACCESS_DENIED: u32 = CLIENT_BASE + 2;
/// Ticket was rejected as expired or unknown.
pub const TICKET_EXPIRED: u32 = CLIENT_BASE + 3;
/// Server fingerprint is not trusted yet.
pub const TRUST_REQUIRED: u32 = CLIENT_BASE + 4;
/// Client and server disagree on protocol or character set.
pub const PROTOCOL_MISMATCH: u32 = CLIENT_BASE + 5;
/// Session must be reconnected before it accepts commands.
pub const RECONNECT_REQUIRED: u32 = CLIENT_BASE + 6;
/// Command was cancelled by the caller.
pub const COMMAND_CANCELLED: u32 = CLIENT_BASE + 7;
/// Command exceeded the configured run timeout.
pub const COMMAND_TIMEOUT: u32 = CLIENT_BASE + 8;
/// Server does not implement the requested command.
pub const UNKNOWN_COMMAND: u32 = CLIENT_BASE + 9;
/// One or more workers of a parallel operation failed.
pub const PARALLEL_FAILED: u32 = CLIENT_BASE + 10;
/// Connection dropped while a command was running.
pub const CONNECTION_LOST: u32 = CLIENT_BASE + 11;

/// Returns `true` when `code` was raised by the session layer rather than a server.
pub fn is_client_code(code: u32) -> bool {
	code > CLIENT_BASE && code <= CONNECTION_LOST
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_codes_do_not_collide_with_server_codes() {
		for code in [PASSWORD_INVALID, CLIENT_UNKNOWN, CONNECT_FAILED] {
			assert!(!is_client_code(code));
		}
		for code in [PASSWORD_REQUIRED, TRUST_REQUIRED, PARALLEL_FAILED, CONNECTION_LOST] {
			assert!(is_client_code(code));
		}
	}
}
