//! Messages of the engine control protocol.

use serde::{Deserialize, Serialize};

use super::{PortConfig, PortId, PortStats, StreamConfig, StreamId, StreamStats};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMessage {
    pub request_id: String,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Hello { version: String },
    ServerHello { version: String, port_count: usize },

    GetPortConfig,
    PortConfigs { ports: Vec<PortConfig> },
    SetStreamTracking { port: PortId, enabled: bool },

    AddStreams { port: PortId, ids: Vec<StreamId> },
    DeleteStreams { port: PortId, ids: Vec<StreamId> },
    ModifyStreams { port: PortId, streams: Vec<StreamConfig> },

    StartCapture { ports: Vec<PortId> },
    StopCapture { ports: Vec<PortId> },
    StartTransmit { ports: Vec<PortId> },
    StopTransmit { ports: Vec<PortId> },

    ClearStats { ports: Vec<PortId> },
    ClearStreamStats { ports: Vec<PortId> },
    GetStats { ports: Vec<PortId> },
    Stats { stats: Vec<PortStats> },
    GetStreamStats { ports: Vec<PortId> },
    StreamStats { stats: Vec<StreamStats> },

    GetCaptureBuffer { port: PortId },
    CaptureBuffer {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    Bye,
    Ok,
    Error(ErrorResponse),
}

impl MessagePayload {
    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Hello { .. } => "hello",
            MessagePayload::ServerHello { .. } => "server_hello",
            MessagePayload::GetPortConfig => "get_port_config",
            MessagePayload::PortConfigs { .. } => "port_configs",
            MessagePayload::SetStreamTracking { .. } => "set_stream_tracking",
            MessagePayload::AddStreams { .. } => "add_streams",
            MessagePayload::DeleteStreams { .. } => "delete_streams",
            MessagePayload::ModifyStreams { .. } => "modify_streams",
            MessagePayload::StartCapture { .. } => "start_capture",
            MessagePayload::StopCapture { .. } => "stop_capture",
            MessagePayload::StartTransmit { .. } => "start_transmit",
            MessagePayload::StopTransmit { .. } => "stop_transmit",
            MessagePayload::ClearStats { .. } => "clear_stats",
            MessagePayload::ClearStreamStats { .. } => "clear_stream_stats",
            MessagePayload::GetStats { .. } => "get_stats",
            MessagePayload::Stats { .. } => "stats",
            MessagePayload::GetStreamStats { .. } => "get_stream_stats",
            MessagePayload::StreamStats { .. } => "stream_stats",
            MessagePayload::GetCaptureBuffer { .. } => "get_capture_buffer",
            MessagePayload::CaptureBuffer { .. } => "capture_buffer",
            MessagePayload::Bye => "bye",
            MessagePayload::Ok => "ok",
            MessagePayload::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

/// Raw byte fields travel as one base64 string rather than a JSON number array.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_buffer_is_a_base64_string() {
        let msg = EngineMessage {
            request_id: "req-3".to_string(),
            payload: MessagePayload::CaptureBuffer {
                data: vec![0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00],
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "capture_buffer");
        assert_eq!(json["payload"]["data"], "1MOyoQIA");

        let back: EngineMessage = serde_json::from_value(json).unwrap();
        match back.payload {
            MessagePayload::CaptureBuffer { data } => {
                assert_eq!(data, vec![0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00])
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_capture_buffer_rejects_bad_base64() {
        let raw = r#"{"request_id":"r","payload":{"type":"capture_buffer","data":"!!"}}"#;
        assert!(serde_json::from_str::<EngineMessage>(raw).is_err());
    }
}
