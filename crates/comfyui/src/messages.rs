//! Wire-level events received from a ComfyUI WebSocket.
//!
//! The server interleaves two frame kinds on one socket:
//!
//! - text frames carrying JSON `{"type": "<kind>", "data": {...}}`,
//!   parsed into [`ComfyUIMessage`];
//! - binary frames carrying image bytes behind a fixed
//!   [`BINARY_HEADER_LEN`]-byte header (event type + image format).
//!
//! [`RawEvent`] is the transport-neutral form both arrive in.

use serde::Deserialize;

/// Length of the header preceding every binary payload.
pub const BINARY_HEADER_LEN: usize = 8;

/// One frame as delivered by a [`Transport`](crate::client::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// A JSON control frame, unparsed.
    Text(String),
    /// A binary frame, header included.
    Binary(Vec<u8>),
}

impl RawEvent {
    /// The image bytes of a binary frame with the header stripped.
    ///
    /// `None` for text frames and for binary frames too short to carry
    /// any payload.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            RawEvent::Binary(bytes) if bytes.len() > BINARY_HEADER_LEN => {
                Some(&bytes[BINARY_HEADER_LEN..])
            }
            _ => None,
        }
    }
}

/// Typed control messages, keyed on the frame's `"type"` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, sent on connect and whenever the queue changes.
    #[serde(rename = "status")]
    Status(StatusData),

    /// The server picked up a queued prompt.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Nodes whose cached outputs are reused for this prompt.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node is now executing, or the prompt finished when `node` is `None`.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress of a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished; `output` holds its UI payload.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// A node raised; the prompt will not finish.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Body of a `status` broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Queue counters nested in [`StatusData`].
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    /// Prompts still waiting or running on the server, across all clients.
    pub queue_remaining: i32,
}

/// Payload of messages that only name their prompt, such as
/// `execution_start`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

/// Payload for `execution_cached`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Nodes skipped because their cached outputs were reused. A cached
    /// `SaveImageWebsocket` node sends no binary frame.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing`, the node cursor of a running prompt.
///
/// `node` is `None` once the whole prompt is done.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `progress`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Steps done so far, out of `max`.
    pub value: i32,
    pub max: i32,
    // Older servers omit both ids.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executed`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// The node's UI output (file names for savers, text for previews).
    /// Websocket savers deliver their images as binary frames instead.
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error`. Only the fields used in logs and
/// [`JobError::Execution`](crate::job::JobError::Execution) are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    pub exception_type: String,
}

/// Parse a ComfyUI text frame into a typed message.
///
/// Returns `Err` for malformed JSON and for message types not listed in
/// [`ComfyUIMessage`]; ComfyUI extensions add their own types freely,
/// so callers should treat errors as "not for us".
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
