use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;

/// Servo pose in integer degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoState {
    pub pan: i32,
    pub tilt: i32,
    pub roll: i32,
}

impl Default for ServoState {
    fn default() -> Self {
        Self { pan: 90, tilt: 90, roll: 0 }
    }
}

impl ServoState {
    /// Merges the non-null fields of a servo control request into the pose.
    pub fn apply(
        &mut self,
        request: &ServoControl,
    ) {
        if let Some(pan) = request.pan {
            self.pan = pan;
        }
        if let Some(tilt) = request.tilt {
            self.tilt = tilt;
        }
        if let Some(roll) = request.roll {
            self.roll = roll;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ServoControl {
    #[serde(default)]
    pub pan: Option<i32>,
    #[serde(default)]
    pub tilt: Option<i32>,
    #[serde(default)]
    pub roll: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub supports_binary: bool,
}

/// A JSON-encoded frame from the producer. `image` and `depth_data` are
/// already base64.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameUpload {
    #[serde(default)]
    pub frame_id: u32,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub depth_data: Option<String>,
    #[serde(default)]
    pub depth_scale: Option<f32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub camera_info: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessedFrame {
    #[serde(default)]
    pub frame_id: u32,
    #[serde(default = "empty_detections")]
    pub detections: Value,
    #[serde(default)]
    pub processing_time: Option<f64>,
}

fn empty_detections() -> Value {
    Value::Array(Vec::new())
}

/// One inbound text message, decoded once at the session edge.
///
/// Unknown `type` values are preserved with their raw payload so the
/// caller can log and ignore them without failing the session.
#[derive(Debug, Clone)]
pub enum Inbound {
    Ping,
    Hello(Hello),
    ServoControl(ServoControl),
    RequestStatus,
    Frame(FrameUpload),
    Telemetry(Value),
    ProcessedFrame(ProcessedFrame),
    Unknown { kind: String, raw: Value },
}

impl Inbound {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Inbound::Ping => "ping",
            Inbound::Hello(_) => "hello",
            Inbound::ServoControl(_) => "servo_control",
            Inbound::RequestStatus => "request_status",
            Inbound::Frame(_) => "frame",
            Inbound::Telemetry(_) => "telemetry",
            Inbound::ProcessedFrame(_) => "processed_frame",
            Inbound::Unknown { kind, .. } => kind,
        }
    }
}

pub fn decode_text(text: &str) -> Result<Inbound, ProtoError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| ProtoError::Decode(err.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let decoded = match kind.as_str() {
        "ping" => Inbound::Ping,
        "hello" => Inbound::Hello(from_value(value)?),
        "servo_control" => Inbound::ServoControl(from_value(value)?),
        "request_status" => Inbound::RequestStatus,
        "frame" => Inbound::Frame(from_value(value)?),
        "telemetry" => Inbound::Telemetry(value),
        "processed_frame" => Inbound::ProcessedFrame(from_value(value)?),
        _ => Inbound::Unknown { kind, raw: value },
    };

    Ok(decoded)
}

fn from_value<T: serde::de::DeserializeOwned>(
    value: Value
) -> Result<T, ProtoError> {
    serde_json::from_value(value).map_err(|err| ProtoError::Decode(err.to_string()))
}

/// Producer/worker link state announced to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    PiConnected,
    PiDisconnected,
}

/// Body of a `status` message: either a link-change event or the full
/// report answering `request_status`. Both serialize under the same tag.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusBody {
    Link {
        status: LinkStatus,
        timestamp: f64,
    },
    Report {
        pi_connected: bool,
        wsl_connected: bool,
        browser_clients: usize,
        processed_frames: usize,
        servo_state: ServoState,
        timestamp: f64,
    },
}

/// A `frame` fan-out to viewers. Binary-ingested frames set
/// `binary_received` and never carry `camera_info`.
#[derive(Debug, Clone, Serialize)]
pub struct FrameFanout {
    pub frame_id: u32,
    pub timestamp: f64,
    pub image: Option<String>,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_received: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_info: Option<Value>,
}

/// A `frame_to_process` job for the worker.
#[derive(Debug, Clone, Serialize)]
pub struct FrameJob {
    pub frame_id: u32,
    pub timestamp: f64,
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_info: Option<Value>,
}

/// Every outbound text message. The `type` tag matches the wire schema.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Connected {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        server_time: f64,
    },
    Welcome {
        message: String,
        server_time: f64,
        pi_connected: bool,
        wsl_connected: bool,
        binary_frames_supported: bool,
    },
    Pong {
        timestamp: f64,
    },
    Error {
        error: String,
        timestamp: f64,
    },
    Control {
        action: String,
        params: ServoState,
        timestamp: f64,
    },
    ServoUpdated {
        state: ServoState,
        timestamp: f64,
    },
    Status(StatusBody),
    Frame(FrameFanout),
    FrameToProcess(FrameJob),
    DetectionResult {
        frame_id: u32,
        detections: Value,
        timestamp: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        processing_time: Option<f64>,
    },
}

impl Outbound {
    pub fn to_text(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|err| ProtoError::Encode(err.to_string()))
    }
}
