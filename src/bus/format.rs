//! Per-message-type format contracts.
//!
//! A contract decides whether a payload is well-formed before any handler
//! touches it. A [`FormatError`] is terminal for that message: consumers
//! dead-letter it instead of retrying.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::chain::ChainEventEnvelope;

/// A payload that failed its format contract.
///
/// Carries the full payload so dead-letter inspection never needs the
/// original delivery.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {message_type} message: {reason}")]
pub struct FormatError {
    pub message_type: String,
    pub reason: String,
    pub payload: Value,
}

/// Format contract for one message type.
pub trait MsgFormat {
    /// Typed form of a payload that passed the contract.
    type Message: DeserializeOwned;

    /// `event_name` this contract applies to.
    const MESSAGE_TYPE: &'static str;

    /// Decode and check `payload`, explaining the first problem found.
    fn validate(payload: &Value) -> Result<Self::Message, String>;

    fn is_valid_msg_format(payload: &Value) -> bool {
        Self::validate(payload).is_ok()
    }

    fn invalid_format_error(payload: &Value) -> FormatError {
        let reason = match Self::validate(payload) {
            Ok(_) => "payload rejected by format contract".to_string(),
            Err(reason) => reason,
        };
        FormatError {
            message_type: Self::MESSAGE_TYPE.to_string(),
            reason,
            payload: payload.clone(),
        }
    }

    /// Narrow `payload` to the typed message, or fail with a [`FormatError`].
    fn check_msg_format(payload: &Value) -> Result<Self::Message, FormatError> {
        Self::validate(payload).map_err(|reason| FormatError {
            message_type: Self::MESSAGE_TYPE.to_string(),
            reason,
            payload: payload.clone(),
        })
    }
}

/// `0x` followed by at least one hex digit.
pub fn is_hex(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// `0x` followed by exactly `bytes * 2` hex digits.
pub fn is_hex_of_len(value: &str, bytes: usize) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| digits.len() == bytes * 2 && digits.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// `ChainEventCreated`: an indexed log wrapped in a [`ChainEventEnvelope`].
pub struct ChainEventCreatedFormat;

impl MsgFormat for ChainEventCreatedFormat {
    type Message = ChainEventEnvelope;

    const MESSAGE_TYPE: &'static str = "ChainEventCreated";

    fn validate(payload: &Value) -> Result<Self::Message, String> {
        let envelope: ChainEventEnvelope =
            serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;

        let raw = &envelope.raw_log;
        if !is_hex(&raw.transaction_hash) {
            return Err(format!("rawLog.transactionHash is not a hex string: {}", raw.transaction_hash));
        }
        if !is_hex(&raw.block_hash) {
            return Err(format!("rawLog.blockHash is not a hex string: {}", raw.block_hash));
        }
        if !is_hex_of_len(&raw.address, 20) {
            return Err(format!("rawLog.address is not a 20-byte hex address: {}", raw.address));
        }
        if envelope.event_source.eth_chain_id <= 0 {
            return Err(format!(
                "eventSource.ethChainId must be positive, got {}",
                envelope.event_source.eth_chain_id
            ));
        }
        if !envelope.parsed_args.is_object() {
            return Err("parsedArgs must be an object".to_string());
        }

        Ok(envelope)
    }
}

/// Platform domain events: any JSON object.
pub struct DomainEventFormat;

impl MsgFormat for DomainEventFormat {
    type Message = Map<String, Value>;

    const MESSAGE_TYPE: &'static str = "DomainEvent";

    fn validate(payload: &Value) -> Result<Self::Message, String> {
        match payload {
            Value::Object(map) => Ok(map.clone()),
            other => Err(format!("expected a JSON object, got {}", json_kind(other))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
