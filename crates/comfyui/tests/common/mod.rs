#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};

use naturalis_comfyui::api::{ComfyUIApiError, Enqueue};
use naturalis_comfyui::client::{Connector, Transport, TransportError};
use naturalis_comfyui::messages::{RawEvent, BINARY_HEADER_LEN};
use naturalis_comfyui::reconnect::ReconnectConfig;
use naturalis_comfyui::session::SessionConfig;
use naturalis_comfyui::workflow::WorkflowDescriptor;

/// Node id of the input node in [`workflow`].
pub const INPUT_NODE: &str = "1";
/// Node id of the `OUT_face` output node in [`workflow`].
pub const FACE_NODE: &str = "9";
/// Node id of the `OUT_a` output node in [`workflow`].
pub const A_NODE: &str = "10";
/// Node id of the `OUT_b` output node in [`workflow`].
pub const B_NODE: &str = "11";
/// Node id of a preview node that is not an output slot.
pub const PREVIEW_NODE: &str = "5";

/// A workflow with one input and three output slots: `face`, `a`, `b`.
pub fn workflow() -> WorkflowDescriptor {
    WorkflowDescriptor::load(json!({
        INPUT_NODE: {"class_type": "LoadImage", "_meta": {"title": "INPUT_0"}, "inputs": {"image": "x.png"}},
        PREVIEW_NODE: {"class_type": "PreviewImage", "_meta": {"title": "Preview"}, "inputs": {}},
        FACE_NODE: {"class_type": "SaveImageWebsocket", "_meta": {"title": "OUT_face"}, "inputs": {}},
        A_NODE: {"class_type": "SaveImageWebsocket", "_meta": {"title": "OUT_a"}, "inputs": {}},
        B_NODE: {"class_type": "SaveImageWebsocket", "_meta": {"title": "OUT_b"}, "inputs": {}}
    }))
    .unwrap()
}

/// Session config with a short reconnect delay and no completion timeout.
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig {
        reconnect: ReconnectConfig {
            delay: Duration::from_millis(5),
            max_job_retries: 1,
        },
        ..Default::default()
    };
    config.job.completion_timeout = None;
    config
}

pub fn executing(prompt_id: &str, node: Option<&str>) -> RawEvent {
    RawEvent::Text(
        json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}).to_string(),
    )
}

pub fn execution_error(prompt_id: &str, node: &str) -> RawEvent {
    RawEvent::Text(
        json!({
            "type": "execution_error",
            "data": {
                "prompt_id": prompt_id,
                "node_id": node,
                "node_type": "KSampler",
                "exception_message": "CUDA out of memory",
                "exception_type": "RuntimeError"
            }
        })
        .to_string(),
    )
}

/// A binary frame carrying `payload` behind the standard header.
pub fn binary(payload: &[u8]) -> RawEvent {
    let mut bytes = vec![0u8; BINARY_HEADER_LEN];
    bytes[3] = 1;
    bytes[7] = 2;
    bytes.extend_from_slice(payload);
    RawEvent::Binary(bytes)
}

/// A 2x2 PNG filled with `shade`.
pub fn png(shade: u8) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(2, 2, image::Rgba([shade, shade, shade, 255]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

/// Events of a prompt that runs `node` and emits `payloads` from it.
pub fn completed(prompt_id: &str, node: &str, payloads: &[Vec<u8>]) -> Vec<RawEvent> {
    let mut events = vec![executing(prompt_id, Some(node))];
    events.extend(payloads.iter().map(|p| binary(p)));
    events.push(executing(prompt_id, None));
    events
}

/// What one connection will deliver.
#[derive(Debug, Default)]
pub struct Script {
    pub events: Vec<Result<RawEvent, TransportError>>,
    /// Stay open once the events run out instead of ending the stream.
    pub hang: bool,
    pub ping_fails: bool,
}

impl Script {
    pub fn events(events: impl IntoIterator<Item = RawEvent>) -> Self {
        Self {
            events: events.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn failing_ping(mut self) -> Self {
        self.ping_fails = true;
        self
    }
}

/// Hands out one [`FakeTransport`] per script, then refuses.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
            ..Default::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Transport = FakeTransport;

    async fn connect(&self, _client_id: &str) -> Result<FakeTransport, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(script) => Ok(FakeTransport {
                events: script.events.into(),
                hang: script.hang,
                ping_fails: script.ping_fails,
                closes: Arc::clone(&self.closes),
            }),
            None => Err(TransportError::Connection("connection refused".into())),
        }
    }
}

pub struct FakeTransport {
    events: VecDeque<Result<RawEvent, TransportError>>,
    hang: bool,
    ping_fails: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FakeTransport {
    fn events(&mut self) -> BoxStream<'_, Result<RawEvent, TransportError>> {
        let hang = self.hang;
        let events = &mut self.events;
        stream::poll_fn(move |_| match events.pop_front() {
            Some(event) => Poll::Ready(Some(event)),
            None if hang => Poll::Pending,
            None => Poll::Ready(None),
        })
        .boxed()
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.ping_fails {
            Err(TransportError::Protocol("pong never came".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns prompt ids `p1`, `p2`, ... and records every queued graph.
#[derive(Clone, Default)]
pub struct FakeEnqueuer {
    graphs: Arc<Mutex<Vec<Value>>>,
    reject: bool,
}

impl FakeEnqueuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// An enqueuer whose every call fails with HTTP 500.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn graphs(&self) -> Vec<Value> {
        self.graphs.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.graphs.lock().unwrap().len()
    }
}

#[async_trait]
impl Enqueue for FakeEnqueuer {
    async fn enqueue(&self, graph: &Value, _client_id: &str) -> Result<String, ComfyUIApiError> {
        let mut graphs = self.graphs.lock().unwrap();
        graphs.push(graph.clone());
        if self.reject {
            return Err(ComfyUIApiError::ApiError {
                status: 500,
                body: "prompt outputs failed validation".into(),
            });
        }
        Ok(format!("p{}", graphs.len()))
    }
}
