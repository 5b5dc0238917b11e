//! Per-command result channels.
//!
//! A command's output is split over five channels: errors, info messages,
//! tagged records, text and binary. [`ResultEvent`] is one item on one channel,
//! [`ResultBundle`] is everything a finished command produced.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use p4_protocol::{ClientError, ErrorSeverity, InfoMessage, ReplyChannel, ServerReply, TaggedRecord, codes};
use serde::Serialize;

use crate::error::{AuthFailure, ConnectFailure, Error};

/// Field name used when raw output is folded into a tagged record.
pub const DATA_FIELD: &str = "data";

/// Category of an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "category", content = "reason")]
pub enum ErrorKind {
	/// Reported by the server for the command itself.
	Command,
	Connect(ConnectFailure),
	Auth(AuthFailure),
	Cancelled,
	Timeout,
	/// Summary record for a parallel operation with failed workers.
	Aggregate,
}

/// One entry on a command's error channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
	pub severity: ErrorSeverity,
	pub code: u32,
	pub message: String,
	pub kind: ErrorKind,
	/// Index of the parallel worker that raised it.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub worker: Option<usize>,
}

impl ErrorRecord {
	pub fn new(severity: ErrorSeverity, code: u32, message: impl Into<String>, kind: ErrorKind) -> Self {
		Self {
			severity,
			code,
			message: message.into(),
			kind,
			worker: None,
		}
	}

	/// Record describing a session-level error, at `Failed` severity.
	pub fn from_error(err: &Error) -> Self {
		let (code, message) = match err {
			Error::Connect { kind, message, .. } => (kind.code(), message.clone()),
			Error::Auth { kind, message, .. } => (kind.code(), message.clone()),
			Error::Cancelled { .. } => (codes::COMMAND_CANCELLED, err.to_string()),
			Error::Timeout { .. } => (codes::COMMAND_TIMEOUT, err.to_string()),
			Error::Aggregate { .. } => (codes::PARALLEL_FAILED, err.to_string()),
			Error::Command { .. } | Error::DuplicateActiveId(_) | Error::UnknownCommand(_) | Error::Runtime(_) => (0, err.to_string()),
		};
		Self::new(ErrorSeverity::Failed, code, message, err.kind())
	}

	pub fn with_worker(mut self, worker: usize) -> Self {
		self.worker = Some(worker);
		self
	}

	pub fn is_failure(&self) -> bool {
		self.severity.is_failure()
	}
}

impl From<ClientError> for ErrorRecord {
	fn from(err: ClientError) -> Self {
		Self::new(err.severity, err.code, err.message, ErrorKind::Command)
	}
}

/// One item delivered on a result channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "lowercase")]
pub enum ResultEvent {
	Error(ErrorRecord),
	Info(InfoMessage),
	Tagged(TaggedRecord),
	Text(String),
	Binary(Vec<u8>),
}

impl ResultEvent {
	pub fn channel(&self) -> ReplyChannel {
		match self {
			ResultEvent::Error(_) => ReplyChannel::Error,
			ResultEvent::Info(_) => ReplyChannel::Info,
			ResultEvent::Tagged(_) => ReplyChannel::Tagged,
			ResultEvent::Text(_) => ReplyChannel::Text,
			ResultEvent::Binary(_) => ReplyChannel::Binary,
		}
	}

	/// Converts a server reply into the shape the command asked for.
	///
	/// Tagged commands get raw text and binary folded into a record with a
	/// single `data` field (binary is base64 encoded). Untagged commands get
	/// tagged records rendered as `field value` text lines.
	pub(crate) fn normalize(reply: ServerReply, tagged: bool) -> Self {
		match reply {
			ServerReply::Error(err) => ResultEvent::Error(err.into()),
			ServerReply::Info(info) => ResultEvent::Info(info),
			ServerReply::Tagged { record } if tagged => ResultEvent::Tagged(record),
			ServerReply::Tagged { record } => ResultEvent::Text(render_record(&record)),
			ServerReply::Text { text } if tagged => ResultEvent::Tagged(TaggedRecord::new().with(DATA_FIELD, text)),
			ServerReply::Text { text } => ResultEvent::Text(text),
			ServerReply::Binary { data } if tagged => ResultEvent::Tagged(TaggedRecord::new().with(DATA_FIELD, STANDARD.encode(&data))),
			ServerReply::Binary { data } => ResultEvent::Binary(data),
		}
	}
}

fn render_record(record: &TaggedRecord) -> String {
	let mut text = String::new();
	for (field, value) in record.iter() {
		text.push_str(field);
		text.push(' ');
		text.push_str(value);
		text.push('\n');
	}
	text
}

/// Everything a command produced, channel by channel, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBundle {
	errors: Vec<ErrorRecord>,
	info: Vec<InfoMessage>,
	tagged: Vec<TaggedRecord>,
	text: String,
	binary: Vec<u8>,
}

impl ResultBundle {
	pub fn errors(&self) -> &[ErrorRecord] {
		&self.errors
	}

	pub fn info(&self) -> &[InfoMessage] {
		&self.info
	}

	pub fn tagged(&self) -> &[TaggedRecord] {
		&self.tagged
	}

	/// Text output, concatenated.
	pub fn text(&self) -> &str {
		&self.text
	}

	/// Binary output, concatenated.
	pub fn binary(&self) -> &[u8] {
		&self.binary
	}

	/// Highest severity on the error channel, `Empty` when there are no errors.
	pub fn max_severity(&self) -> ErrorSeverity {
		self.errors.iter().map(|err| err.severity).max().unwrap_or_default()
	}

	/// Returns `true` when no error reached `Failed`.
	pub fn success(&self) -> bool {
		!self.max_severity().is_failure()
	}

	pub(crate) fn push(&mut self, event: &ResultEvent) {
		match event {
			ResultEvent::Error(err) => self.errors.push(err.clone()),
			ResultEvent::Info(info) => self.info.push(info.clone()),
			ResultEvent::Tagged(record) => self.tagged.push(record.clone()),
			ResultEvent::Text(text) => self.text.push_str(text),
			ResultEvent::Binary(data) => self.binary.extend_from_slice(data),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn untagged_command_renders_records_as_text() {
		let record = TaggedRecord::new().with("depotFile", "//depot/a").with("rev", "3");
		let event = ResultEvent::normalize(ServerReply::tagged(record), false);
		assert_eq!(event, ResultEvent::Text("depotFile //depot/a\nrev 3\n".to_string()));
	}

	#[test]
	fn tagged_command_folds_binary_into_data_field() {
		let event = ResultEvent::normalize(ServerReply::binary(vec![0u8, 1, 2, 255]), true);
		match event {
			ResultEvent::Tagged(record) => assert_eq!(record.get(DATA_FIELD), Some("AAEC/w==")),
			other => panic!("expected tagged event, got {other:?}"),
		}
	}

	#[test]
	fn bundle_tracks_highest_severity() {
		let mut bundle = ResultBundle::default();
		assert!(bundle.success());
		assert_eq!(bundle.max_severity(), ErrorSeverity::Empty);

		bundle.push(&ResultEvent::Error(ErrorRecord::from(ClientError::new(ErrorSeverity::Warning, 1, "up to date"))));
		assert!(bundle.success());

		bundle.push(&ResultEvent::Error(ErrorRecord::from(ClientError::failed(2, "no such file"))));
		assert!(!bundle.success());
		assert_eq!(bundle.max_severity(), ErrorSeverity::Failed);
	}

	#[test]
	fn text_and_binary_concatenate() {
		let mut bundle = ResultBundle::default();
		bundle.push(&ResultEvent::Text("line one\n".into()));
		bundle.push(&ResultEvent::Text("line two\n".into()));
		bundle.push(&ResultEvent::Binary(vec![1, 2]));
		bundle.push(&ResultEvent::Binary(vec![3]));
		assert_eq!(bundle.text(), "line one\nline two\n");
		assert_eq!(bundle.binary(), &[1, 2, 3]);
	}

	#[test]
	fn session_errors_become_failed_records() {
		let err = Error::connect(ConnectFailure::Unreachable, "TCP connect to nowhere:666 failed.");
		let record = ErrorRecord::from_error(&err);
		assert_eq!(record.code, codes::CONNECT_FAILED);
		assert_eq!(record.severity, ErrorSeverity::Failed);
		assert_eq!(record.kind, ErrorKind::Connect(ConnectFailure::Unreachable));
	}
}
