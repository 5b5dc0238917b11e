//! Streamed command output and parallel transfer plans.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::message::{ClientError, InfoMessage, TaggedRecord};

/// One unit of output a server streams back while a command runs.
///
/// Serialized form is internally tagged on `kind`:
/// ```json
/// { "kind": "info", "code": 0, "level": 0, "text": "//depot/a - refreshing" }
/// { "kind": "binary", "data": "AAEC" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerReply {
	Error(ClientError),
	Info(InfoMessage),
	Tagged {
		record: TaggedRecord,
	},
	Text {
		text: String,
	},
	Binary {
		#[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
		data: Vec<u8>,
	},
}

impl ServerReply {
	/// Returns the output channel this reply is delivered on.
	pub fn channel(&self) -> ReplyChannel {
		match self {
			ServerReply::Error(_) => ReplyChannel::Error,
			ServerReply::Info(_) => ReplyChannel::Info,
			ServerReply::Tagged { .. } => ReplyChannel::Tagged,
			ServerReply::Text { .. } => ReplyChannel::Text,
			ServerReply::Binary { .. } => ReplyChannel::Binary,
		}
	}

	pub fn text(text: impl Into<String>) -> Self {
		ServerReply::Text { text: text.into() }
	}

	pub fn tagged(record: TaggedRecord) -> Self {
		ServerReply::Tagged { record }
	}

	pub fn binary(data: impl Into<Vec<u8>>) -> Self {
		ServerReply::Binary { data: data.into() }
	}
}

/// The five result channels a command's output is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyChannel {
	Error,
	Info,
	Tagged,
	Text,
	Binary,
}

impl ReplyChannel {
	pub const ALL: [ReplyChannel; 5] = [
		ReplyChannel::Error,
		ReplyChannel::Info,
		ReplyChannel::Tagged,
		ReplyChannel::Text,
		ReplyChannel::Binary,
	];
}

/// Work a server hands back to the client to be transferred in parallel.
///
/// `sub_command` is run once per batch on a separate connection with `args`;
/// the batch's records travel with it. Each record describes one file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
	pub sub_command: String,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub records: Vec<TaggedRecord>,
}

fn encode_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&STANDARD.encode(data))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
	let encoded = String::deserialize(deserializer)?;
	STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::ErrorSeverity;

	#[test]
	fn reply_kind_tag_selects_variant() {
		let json = r#"{"kind": "error", "severity": "warning", "code": 1, "message": "no such file(s)."}"#;
		let reply: ServerReply = serde_json::from_str(json).unwrap();
		match reply {
			ServerReply::Error(err) => {
				assert_eq!(err.severity, ErrorSeverity::Warning);
				assert_eq!(err.message, "no such file(s).");
			}
			other => panic!("expected error reply, got {other:?}"),
		}
	}

	#[test]
	fn binary_payload_travels_as_base64() {
		let reply = ServerReply::binary(vec![0u8, 1, 2, 255]);
		let json = serde_json::to_value(&reply).unwrap();
		assert_eq!(json["kind"], "binary");
		assert_eq!(json["data"], "AAEC/w==");

		let back: ServerReply = serde_json::from_value(json).unwrap();
		assert_eq!(back, reply);
	}

	#[test]
	fn malformed_base64_is_rejected() {
		let json = r#"{"kind": "binary", "data": "not base64!"}"#;
		assert!(serde_json::from_str::<ServerReply>(json).is_err());
	}

	#[test]
	fn channel_matches_variant() {
		assert_eq!(ServerReply::text("x").channel(), ReplyChannel::Text);
		assert_eq!(ServerReply::tagged(TaggedRecord::new()).channel(), ReplyChannel::Tagged);
		assert_eq!(ServerReply::Info(InfoMessage::new(0, 0, "hi")).channel(), ReplyChannel::Info);
	}

	#[test]
	fn transfer_plan_defaults_missing_lists() {
		let plan: TransferPlan = serde_json::from_str(r#"{"subCommand": "transmit"}"#).unwrap();
		assert_eq!(plan.sub_command, "transmit");
		assert!(plan.args.is_empty());
		assert!(plan.records.is_empty());
	}
}
