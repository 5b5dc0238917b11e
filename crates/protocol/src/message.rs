//! Error, info, and tagged output shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity attached to server and client errors.
///
/// Ordering follows escalation: `Empty < Info < Warning < Failed < Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
	#[default]
	Empty,
	Info,
	Warning,
	Failed,
	Fatal,
}

impl ErrorSeverity {
	/// Returns `true` for severities that make a command unsuccessful.
	pub fn is_failure(self) -> bool {
		self >= ErrorSeverity::Failed
	}
}

impl fmt::Display for ErrorSeverity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			ErrorSeverity::Empty => "empty",
			ErrorSeverity::Info => "info",
			ErrorSeverity::Warning => "warning",
			ErrorSeverity::Failed => "failed",
			ErrorSeverity::Fatal => "fatal",
		};
		f.write_str(label)
	}
}

/// Error message emitted by a server while running a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
	pub severity: ErrorSeverity,
	pub code: u32,
	pub message: String,
}

impl ClientError {
	pub fn new(severity: ErrorSeverity, code: u32, message: impl Into<String>) -> Self {
		Self {
			severity,
			code,
			message: message.into(),
		}
	}

	/// Shorthand for a `Failed` severity error.
	pub fn failed(code: u32, message: impl Into<String>) -> Self {
		Self::new(ErrorSeverity::Failed, code, message)
	}
}

/// Informational message emitted by a server.
///
/// `level` is the indentation level servers use to nest related messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
	pub code: u32,
	#[serde(default)]
	pub level: u8,
	pub text: String,
}

impl InfoMessage {
	pub fn new(code: u32, level: u8, text: impl Into<String>) -> Self {
		Self {
			code,
			level,
			text: text.into(),
		}
	}
}

/// One tagged output record: field/value pairs in server order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaggedRecord {
	fields: Vec<(String, String)>,
}

impl TaggedRecord {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a field, replacing the value when the field already exists.
	pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
		let field = field.into();
		let value = value.into();
		match self.fields.iter_mut().find(|(existing, _)| *existing == field) {
			Some(slot) => slot.1 = value,
			None => self.fields.push((field, value)),
		}
	}

	/// Builder-style [`insert`](Self::insert).
	pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
		self.insert(field, value);
		self
	}

	pub fn get(&self, field: &str) -> Option<&str> {
		self.fields.iter().find(|(name, _)| name == field).map(|(_, value)| value.as_str())
	}

	pub fn len(&self) -> usize {
		self.fields.len()
	}

	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	/// Iterates fields in the order the server produced them.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.fields.iter().map(|(name, value)| (name.as_str(), value.as_str()))
	}
}

impl<K, V> FromIterator<(K, V)> for TaggedRecord
where
	K: Into<String>,
	V: Into<String>,
{
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut record = TaggedRecord::new();
		for (field, value) in iter {
			record.insert(field, value);
		}
		record
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn severity_orders_by_escalation() {
		assert!(ErrorSeverity::Fatal > ErrorSeverity::Failed);
		assert!(ErrorSeverity::Warning < ErrorSeverity::Failed);
		assert!(ErrorSeverity::Failed.is_failure());
		assert!(!ErrorSeverity::Warning.is_failure());
	}

	#[test]
	fn tagged_record_keeps_server_order() {
		let record = TaggedRecord::new().with("depotFile", "//depot/a").with("rev", "3").with("action", "edit");
		let fields: Vec<&str> = record.iter().map(|(name, _)| name).collect();
		assert_eq!(fields, vec!["depotFile", "rev", "action"]);
	}

	#[test]
	fn tagged_record_insert_replaces_existing_field() {
		let mut record = TaggedRecord::new().with("rev", "1");
		record.insert("rev", "2");
		assert_eq!(record.len(), 1);
		assert_eq!(record.get("rev"), Some("2"));
	}

	#[test]
	fn tagged_record_serializes_as_pair_list() {
		let record = TaggedRecord::new().with("user", "admin");
		let json = serde_json::to_value(&record).unwrap();
		assert_eq!(json, serde_json::json!([["user", "admin"]]));
	}

	#[test]
	fn client_error_deserializes_lowercase_severity() {
		let json = r#"{"severity": "failed", "code": 807672853, "message": "Password invalid."}"#;
		let err: ClientError = serde_json::from_str(json).unwrap();
		assert_eq!(err.severity, ErrorSeverity::Failed);
		assert_eq!(err.code, crate::codes::PASSWORD_INVALID);
	}
}
