//! Workflow graph loading and I/O node discovery.
//!
//! A ComfyUI API-format workflow is a JSON object mapping node ids to
//! node records:
//!
//! ```json
//! {"1": {"class_type": "LoadImage", "_meta": {"title": "INPUT_0"}, "inputs": {"image": "x.png"}}}
//! ```
//!
//! The input image slot is found by title (`INPUT_0`) and output slots by
//! class (`SaveImageWebsocket`). [`WorkflowDescriptor`] validates both
//! once at load time and is read-only afterwards, so one descriptor can
//! back any number of concurrent [`Job`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::job::Job;

/// Title prefix of input nodes; the remainder is the decimal input index.
pub const INPUT_PREFIX: &str = "INPUT_";

/// Title prefix stripped from output node titles to form their label.
pub const OUTPUT_PREFIX: &str = "OUT_";

/// Class the index-0 input node must have.
pub const INPUT_NODE_CLASS: &str = "LoadImage";

/// Class that marks a node as a websocket image output.
pub const OUTPUT_NODE_CLASS: &str = "SaveImageWebsocket";

/// Input field rewritten with the caller's image path.
const IMAGE_INPUT_FIELD: &str = "image";

/// Output slot index: node id -> logical output label.
pub type OutputSlots = HashMap<String, String>;

/// The node selected as the image input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputNode {
    pub node_id: String,
    pub class_type: String,
}

/// A validated workflow graph with its input node and output slots.
#[derive(Debug, Clone)]
pub struct WorkflowDescriptor {
    graph: Map<String, Value>,
    input_node: InputNode,
    output_slots: Arc<OutputSlots>,
}

/// The fields of a node record this client looks at.
#[derive(Debug, Deserialize)]
struct NodeRecord {
    class_type: String,
    #[serde(rename = "_meta", default)]
    meta: NodeMeta,
}

#[derive(Debug, Default, Deserialize)]
struct NodeMeta {
    #[serde(default)]
    title: String,
}

/// Reasons a workflow document cannot be used for submission.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Workflow document must be a JSON object of nodes")]
    NotAnObject,

    #[error("Node {node_id} is malformed: {source}")]
    MalformedNode {
        node_id: String,
        source: serde_json::Error,
    },

    #[error("No output node detected (expected class \"SaveImageWebsocket\")")]
    NoOutputNodes,

    #[error("Input node 0 not found: no node titled \"INPUT_0\"")]
    MissingInputNode,

    #[error("Input node 0 is ambiguous: nodes {0:?} are all titled \"INPUT_0\"")]
    DuplicateInputNode(Vec<String>),

    #[error("Input node 0 ({node_id}) is of type \"{found}\", expected \"LoadImage\"")]
    InputNodeType { node_id: String, found: String },
}

impl WorkflowDescriptor {
    /// Scan a workflow document and validate its I/O nodes.
    pub fn load(document: Value) -> Result<Self, WorkflowError> {
        let Value::Object(graph) = document else {
            return Err(WorkflowError::NotAnObject);
        };

        let mut primary_inputs: Vec<InputNode> = Vec::new();
        let mut output_slots = OutputSlots::new();

        for (node_id, node) in &graph {
            let record = NodeRecord::deserialize(node).map_err(|source| {
                WorkflowError::MalformedNode {
                    node_id: node_id.clone(),
                    source,
                }
            })?;
            let title = record.meta.title.as_str();

            match input_index(title) {
                Some(0) => primary_inputs.push(InputNode {
                    node_id: node_id.clone(),
                    class_type: record.class_type.clone(),
                }),
                Some(index) => {
                    tracing::debug!(node_id = %node_id, index, "Ignoring secondary input node");
                }
                None => {}
            }

            if record.class_type == OUTPUT_NODE_CLASS {
                output_slots.insert(node_id.clone(), output_label(title).to_string());
            }
        }

        if output_slots.is_empty() {
            return Err(WorkflowError::NoOutputNodes);
        }

        let input_node = match primary_inputs.len() {
            0 => return Err(WorkflowError::MissingInputNode),
            1 => primary_inputs.remove(0),
            _ => {
                return Err(WorkflowError::DuplicateInputNode(
                    primary_inputs.into_iter().map(|n| n.node_id).collect(),
                ))
            }
        };

        if input_node.class_type != INPUT_NODE_CLASS {
            return Err(WorkflowError::InputNodeType {
                node_id: input_node.node_id,
                found: input_node.class_type,
            });
        }

        tracing::debug!(
            input_node = %input_node.node_id,
            outputs = output_slots.len(),
            "Parsed workflow for I/O",
        );

        Ok(Self {
            graph,
            input_node,
            output_slots: Arc::new(output_slots),
        })
    }

    /// Parse and validate a workflow from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, WorkflowError> {
        Self::load(serde_json::from_str(text)?)
    }

    /// Read, parse and validate a workflow file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn input_node(&self) -> &InputNode {
        &self.input_node
    }

    pub fn output_slots(&self) -> &OutputSlots {
        &self.output_slots
    }

    /// The unmodified graph as loaded.
    pub fn graph(&self) -> &Map<String, Value> {
        &self.graph
    }

    /// Copy of the graph with the input node's image set to `image_path`.
    pub fn bind_input(&self, image_path: &str) -> Value {
        let mut graph = self.graph.clone();
        if let Some(Value::Object(node)) = graph.get_mut(&self.input_node.node_id) {
            let inputs = node
                .entry("inputs")
                .or_insert_with(|| Value::Object(Map::new()));
            if !inputs.is_object() {
                *inputs = Value::Object(Map::new());
            }
            if let Value::Object(inputs) = inputs {
                inputs.insert(
                    IMAGE_INPUT_FIELD.to_string(),
                    Value::String(image_path.to_string()),
                );
            }
        }
        Value::Object(graph)
    }

    /// Build a job that feeds `source` through this workflow and writes
    /// its outputs under `output_prefix`.
    pub fn job(&self, source: impl Into<PathBuf>, output_prefix: impl Into<PathBuf>) -> Job {
        let source = source.into();
        let graph = self.bind_input(&source.to_string_lossy());
        Job {
            graph,
            output_slots: Arc::clone(&self.output_slots),
            source,
            output_prefix: output_prefix.into(),
        }
    }
}

/// Index encoded in an `INPUT_<digits>` title.
fn input_index(title: &str) -> Option<u64> {
    let digits = title.strip_prefix(INPUT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Logical label of an output node: its title without the `OUT_` prefix.
fn output_label(title: &str) -> &str {
    match title.strip_prefix(OUTPUT_PREFIX) {
        Some(rest) if !rest.is_empty() => rest,
        _ => title,
    }
}
