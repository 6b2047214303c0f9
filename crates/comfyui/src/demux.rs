//! Demultiplexing of one prompt's binary outputs from the event stream.
//!
//! ComfyUI does not tag binary frames with the node that produced them.
//! Instead it announces `executing {node}` before running each node, so
//! the demultiplexer keeps a cursor on the most recently announced node
//! of its own prompt and attributes every following binary frame to it.
//! Frames arriving while the cursor is unset, or while it points at a
//! node that is not an output slot (previews, progress images), are
//! dropped. `executing {node: null}` ends the prompt.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};

use crate::client::TransportError;
use crate::messages::{parse_message, ComfyUIMessage, RawEvent};
use crate::workflow::OutputSlots;

/// Label -> payloads in arrival order. Iterates labels lexicographically.
pub type DemuxOutput = BTreeMap<String, Vec<Vec<u8>>>;

/// Whether the prompt is still running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Continue,
    Finished,
}

/// Ways a prompt's event stream can end other than normal completion.
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Event stream ended before prompt {prompt_id} finished")]
    StreamInterrupted { prompt_id: String },

    #[error("Prompt {prompt_id} failed in node {node_id}: {message}")]
    Execution {
        prompt_id: String,
        node_id: String,
        message: String,
    },
}

/// Per-prompt demultiplexing state.
#[derive(Debug)]
pub struct EventDemultiplexer<'a> {
    prompt_id: &'a str,
    output_slots: &'a OutputSlots,
    cursor: Option<String>,
    outputs: DemuxOutput,
}

impl<'a> EventDemultiplexer<'a> {
    pub fn new(prompt_id: &'a str, output_slots: &'a OutputSlots) -> Self {
        Self {
            prompt_id,
            output_slots,
            cursor: None,
            outputs: DemuxOutput::new(),
        }
    }

    /// The node currently announced as executing for this prompt.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Apply one event.
    pub fn feed(&mut self, event: RawEvent) -> Result<Feed, DemuxError> {
        match event {
            RawEvent::Text(text) => self.feed_control(&text),
            RawEvent::Binary(_) => {
                self.feed_binary(&event);
                Ok(Feed::Continue)
            }
        }
    }

    /// Outputs collected so far.
    pub fn into_outputs(self) -> DemuxOutput {
        self.outputs
    }

    /// Consume `events` until the prompt finishes.
    ///
    /// Blocks for as long as the stream stays open without a terminal
    /// event; callers bound the wait with a timeout.
    pub async fn run<S>(mut self, events: S) -> Result<DemuxOutput, DemuxError>
    where
        S: Stream<Item = Result<RawEvent, TransportError>>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if self.feed(event?)? == Feed::Finished {
                return Ok(self.outputs);
            }
        }
        Err(DemuxError::StreamInterrupted {
            prompt_id: self.prompt_id.to_string(),
        })
    }

    fn feed_control(&mut self, text: &str) -> Result<Feed, DemuxError> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(error = %e, "Ignoring unrecognised control frame");
                return Ok(Feed::Continue);
            }
        };

        match message {
            ComfyUIMessage::Executing(data) if data.prompt_id == self.prompt_id => {
                match data.node {
                    None => {
                        tracing::debug!(prompt_id = %self.prompt_id, "Execution completed");
                        return Ok(Feed::Finished);
                    }
                    Some(node) => {
                        tracing::trace!(prompt_id = %self.prompt_id, node = %node, "Executing node");
                        self.cursor = Some(node);
                    }
                }
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == self.prompt_id => {
                tracing::error!(
                    prompt_id = %data.prompt_id,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                return Err(DemuxError::Execution {
                    prompt_id: data.prompt_id,
                    node_id: data.node_id,
                    message: data.exception_message,
                });
            }
            ComfyUIMessage::Progress(data) => {
                tracing::trace!(value = data.value, max = data.max, "Generation progress");
            }
            ComfyUIMessage::Status(data) => {
                tracing::trace!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            other => {
                tracing::trace!(kind = ?other, "Ignoring control message");
            }
        }
        Ok(Feed::Continue)
    }

    fn feed_binary(&mut self, event: &RawEvent) {
        let Some(node) = self.cursor.as_deref() else {
            tracing::trace!("Dropping binary frame received before any executing node");
            return;
        };
        let Some(label) = self.output_slots.get(node) else {
            tracing::trace!(node = %node, "Dropping binary frame from non-output node");
            return;
        };
        match event.payload() {
            Some(payload) => self
                .outputs
                .entry(label.clone())
                .or_default()
                .push(payload.to_vec()),
            None => {
                tracing::warn!(node = %node, label = %label, "Dropping binary frame without payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::stream;

    use super::*;

    const HEADER: [u8; 8] = [0, 0, 0, 1, 0, 0, 0, 2];

    fn executing(prompt_id: &str, node: Option<&str>) -> RawEvent {
        RawEvent::Text(
            serde_json::json!({"type": "executing", "data": {"prompt_id": prompt_id, "node": node}})
                .to_string(),
        )
    }

    fn binary(payload: &[u8]) -> RawEvent {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(payload);
        RawEvent::Binary(bytes)
    }

    fn slots() -> OutputSlots {
        OutputSlots::from([
            ("2".to_string(), "face".to_string()),
            ("3".to_string(), "body".to_string()),
        ])
    }

    fn demux_all(events: Vec<RawEvent>) -> (DemuxOutput, Option<Feed>) {
        let slots = slots();
        let mut demux = EventDemultiplexer::new("p1", &slots);
        let mut last = None;
        for event in events {
            last = Some(demux.feed(event).unwrap());
            if last == Some(Feed::Finished) {
                break;
            }
        }
        (demux.into_outputs(), last)
    }

    #[test]
    fn attributes_binary_to_announced_output_node() {
        let (out, last) = demux_all(vec![
            executing("p1", Some("2")),
            binary(b"X"),
            executing("p1", None),
        ]);
        assert_eq!(last, Some(Feed::Finished));
        assert_eq!(out, DemuxOutput::from([("face".to_string(), vec![b"X".to_vec()])]));
    }

    #[test]
    fn binary_before_first_executing_is_dropped() {
        let (out, _) = demux_all(vec![
            binary(b"early"),
            executing("p1", Some("2")),
            binary(b"late"),
            executing("p1", None),
        ]);
        assert_eq!(out["face"], vec![b"late".to_vec()]);
    }

    #[test]
    fn binary_from_non_output_node_is_dropped() {
        let (out, _) = demux_all(vec![
            executing("p1", Some("5")),
            binary(b"preview"),
            executing("p1", None),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn payload_order_within_label_is_arrival_order() {
        let (out, _) = demux_all(vec![
            executing("p1", Some("2")),
            binary(b"1"),
            binary(b"2"),
            executing("p1", Some("3")),
            binary(b"b"),
            executing("p1", Some("2")),
            binary(b"3"),
            executing("p1", None),
        ]);
        assert_eq!(out["face"], vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(out["body"], vec![b"b".to_vec()]);
    }

    #[test]
    fn labels_iterate_sorted_regardless_of_arrival() {
        let (out, _) = demux_all(vec![
            executing("p1", Some("2")),
            binary(b"f"),
            executing("p1", Some("3")),
            binary(b"b"),
            executing("p1", None),
        ]);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["body", "face"]);
    }

    #[test]
    fn other_prompt_events_never_move_cursor() {
        let slots = slots();
        let mut demux = EventDemultiplexer::new("p1", &slots);
        demux.feed(executing("p1", Some("2"))).unwrap();
        demux.feed(executing("stale", Some("3"))).unwrap();
        assert_eq!(demux.cursor(), Some("2"));
        assert_eq!(demux.feed(executing("stale", None)).unwrap(), Feed::Continue);
        demux.feed(binary(b"mine")).unwrap();
        assert_eq!(demux.into_outputs()["face"], vec![b"mine".to_vec()]);
    }

    #[test]
    fn unknown_and_malformed_text_is_ignored() {
        let (out, last) = demux_all(vec![
            RawEvent::Text(r#"{"type":"crystools.monitor","data":{"cpu":3}}"#.into()),
            RawEvent::Text("garbage".into()),
            executing("p1", Some("2")),
            RawEvent::Text(r#"{"type":"progress","data":{"value":1,"max":4}}"#.into()),
            binary(b"X"),
            executing("p1", None),
        ]);
        assert_eq!(last, Some(Feed::Finished));
        assert_eq!(out["face"].len(), 1);
    }

    #[test]
    fn execution_error_for_prompt_terminates() {
        let slots = slots();
        let mut demux = EventDemultiplexer::new("p1", &slots);
        let err = demux
            .feed(RawEvent::Text(
                r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"4","exception_message":"boom","exception_type":"ValueError"}}"#.into(),
            ))
            .unwrap_err();
        assert_matches!(err, DemuxError::Execution { node_id, .. } if node_id == "4");
    }

    #[test]
    fn replay_is_deterministic() {
        let events = vec![
            executing("p1", Some("3")),
            binary(b"b1"),
            executing("p1", Some("2")),
            binary(b"f1"),
            binary(b"f2"),
            executing("p1", None),
        ];
        assert_eq!(demux_all(events.clone()), demux_all(events));
    }

    #[tokio::test]
    async fn run_stops_at_terminal_event() {
        let slots = slots();
        let events = stream::iter(vec![
            Ok(executing("p1", Some("2"))),
            Ok(binary(b"X")),
            Ok(executing("p1", None)),
            Ok(binary(b"after")),
        ]);
        let out = EventDemultiplexer::new("p1", &slots).run(events).await.unwrap();
        assert_eq!(out["face"], vec![b"X".to_vec()]);
    }

    #[tokio::test]
    async fn run_reports_interrupted_stream() {
        let slots = slots();
        let events = stream::iter(vec![Ok(executing("p1", Some("2"))), Ok(binary(b"X"))]);
        let err = EventDemultiplexer::new("p1", &slots).run(events).await.unwrap_err();
        assert_matches!(err, DemuxError::StreamInterrupted { prompt_id } if prompt_id == "p1");
    }

    #[tokio::test]
    async fn run_reports_transport_error() {
        let slots = slots();
        let events = stream::iter(vec![
            Ok(executing("p1", Some("2"))),
            Err(TransportError::Protocol("reset".into())),
        ]);
        let err = EventDemultiplexer::new("p1", &slots).run(events).await.unwrap_err();
        assert_matches!(err, DemuxError::Transport(TransportError::Protocol(_)));
    }
}
