//! JSON message protocol spoken over the IPC socket.
//!
//! Every message is an envelope `{ "type": <0..6>, "id": <string>,
//! "data": <object> }`. Types 0-2 are client-to-server, 3-6 are
//! server-to-client. The `id` of a client message is echoed into the
//! corresponding ACK or ERROR; unsolicited server messages carry a fresh
//! monotonic id.

use crate::error::{Result, RtSttError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type discriminants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // client -> server
    Command = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    // server -> client
    Transcription = 3,
    Status = 4,
    Error = 5,
    Acknowledgment = 6,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Command),
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::Transcription),
            4 => Some(Self::Status),
            5 => Some(Self::Error),
            6 => Some(Self::Acknowledgment),
            _ => None,
        }
    }
}

/// The wire envelope. `type` stays a bare integer in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(msg_type: MessageType, id: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type as u8,
            id: id.into(),
            data,
        }
    }

    /// The parsed message type, if the discriminant is known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RtSttError::IpcProtocol {
            message: format!("failed to serialize message: {}", e),
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RtSttError::IpcProtocol {
            message: format!("failed to parse message: {}", e),
        })
    }
}

/// Payload of a COMMAND message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// One decoded segment of a transcription, as broadcast to clients.
///
/// Fields the model did not report are serialized as explicit nulls; the
/// server never fabricates segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i32,
    pub seek: i32,
    pub start_s: f32,
    pub end_s: f32,
    pub text: String,
    pub tokens: Vec<i32>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: Option<f32>,
    pub no_speech_prob: Option<f32>,
}

/// Payload of a TRANSCRIPTION message: one recognized utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// `clamp(exp(mean(token logprob)), 0, 1)`; 0 when there are no tokens.
    pub confidence: f32,
    pub is_final: bool,
    pub language: String,
    pub language_probability: Option<f32>,
    pub processing_time_ms: u64,
    pub audio_duration_ms: u64,
    /// Identifier (path) of the model that produced this result.
    pub model: String,
    /// Microseconds since the Unix epoch at result construction.
    pub timestamp_us: u64,
    pub segments: Vec<Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 0..=6u8 {
            let msg_type = MessageType::from_u8(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert_eq!(MessageType::from_u8(7), None);
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new(
            MessageType::Command,
            "a1",
            json!({ "action": "pause", "params": {} }),
        );
        let bytes = envelope.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["type"], 0);
        assert_eq!(value["id"], "a1");
        assert_eq!(value["data"]["action"], "pause");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(MessageType::Subscribe, "s-1", Value::Null);
        let parsed = Envelope::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.message_type(), Some(MessageType::Subscribe));
    }

    #[test]
    fn test_envelope_missing_optional_fields() {
        let parsed = Envelope::from_slice(br#"{"type":1}"#).unwrap();
        assert_eq!(parsed.message_type(), Some(MessageType::Subscribe));
        assert_eq!(parsed.id, "");
        assert_eq!(parsed.data, Value::Null);
    }

    #[test]
    fn test_envelope_rejects_malformed_json() {
        assert!(Envelope::from_slice(b"not json at all").is_err());
        assert!(Envelope::from_slice(br#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn test_command_data_default_params() {
        let data: CommandData = serde_json::from_value(json!({ "action": "get_status" })).unwrap();
        assert_eq!(data.action, "get_status");
        assert_eq!(data.params, Value::Null);
    }

    #[test]
    fn test_transcription_result_serializes_nulls() {
        let result = TranscriptionResult {
            text: "hello".to_string(),
            confidence: 0.9,
            is_final: true,
            language: "en".to_string(),
            language_probability: None,
            processing_time_ms: 120,
            audio_duration_ms: 2000,
            model: "/models/ggml-small.en.bin".to_string(),
            timestamp_us: 1_700_000_000_000_000,
            segments: vec![Segment {
                id: 0,
                seek: 0,
                start_s: 0.0,
                end_s: 2.0,
                text: "hello".to_string(),
                tokens: vec![50364, 2425],
                temperature: 0.0,
                avg_logprob: -0.3,
                compression_ratio: None,
                no_speech_prob: None,
            }],
        };

        let value = serde_json::to_value(&result).unwrap();
        assert!(value["language_probability"].is_null());
        assert!(value["segments"][0]["compression_ratio"].is_null());
        assert_eq!(value["segments"][0]["tokens"], json!([50364, 2425]));
        assert_eq!(value["model"], "/models/ggml-small.en.bin");

        let back: TranscriptionResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
