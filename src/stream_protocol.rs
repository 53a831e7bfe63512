//! Event-stream protocol: stream modes, frames, and the per-run encoder.
//!
//! A run's frames always follow the shape
//! `metadata (content)* (final snapshot)* terminal`, where the terminal frame
//! is either `end` or `error` and nothing is emitted after it.

use serde_json::{Value, json};

use crate::models::{Message, Role, WireMessage};

/// Graph node name reported in `updates`, `custom` and tuple frames.
pub const GRAPH_NODE: &str = "chat";

/// Stream modes used when a request does not name any.
pub const DEFAULT_STREAM_MODES: &[StreamMode] = &[StreamMode::Messages, StreamMode::Values];

/// Frame families a client may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    /// Incremental `messages/partial` frames with the accumulated reply.
    Messages,
    /// Per-delta `messages` frames carrying `[chunk, metadata]`.
    MessagesTuple,
    /// Final `values` snapshot of the whole conversation.
    Values,
    /// Final `updates` frame keyed by node.
    Updates,
    /// Final `custom` frame with the full reply.
    Custom,
}

impl StreamMode {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "messages" => Some(StreamMode::Messages),
            "messages-tuple" => Some(StreamMode::MessagesTuple),
            "values" => Some(StreamMode::Values),
            "updates" => Some(StreamMode::Updates),
            "custom" => Some(StreamMode::Custom),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StreamMode::Messages => "messages",
            StreamMode::MessagesTuple => "messages-tuple",
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Custom => "custom",
        }
    }
}

/// Resolve requested mode names, dropping unknown ones and duplicates.
///
/// An empty request selects [`DEFAULT_STREAM_MODES`]. A request naming only
/// unknown modes selects nothing, so the run emits just metadata and terminal frames.
#[must_use]
pub fn resolve_stream_modes(requested: &[String]) -> Vec<StreamMode> {
    if requested.is_empty() {
        return DEFAULT_STREAM_MODES.to_vec();
    }
    let mut modes = Vec::new();
    for raw in requested {
        match StreamMode::parse(raw) {
            Some(mode) if !modes.contains(&mode) => modes.push(mode),
            Some(_) => {}
            None => tracing::debug!(mode = %raw, "ignoring unknown stream mode"),
        }
    }
    modes
}

/// Comma-separated mode names, for logs.
#[must_use]
pub fn mode_names(modes: &[StreamMode]) -> String {
    modes
        .iter()
        .map(|mode| mode.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// One typed event on a run's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Metadata { run_id: String, thread_id: String },
    MessagesPartial { message: WireMessage },
    MessagesTuple { chunk: WireMessage, run_id: String },
    Values { messages: Vec<WireMessage> },
    Updates { messages: Vec<WireMessage> },
    Custom { content: String },
    Error { error: String },
    End,
}

impl Frame {
    /// SSE event name.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Frame::Metadata { .. } => "metadata",
            Frame::MessagesPartial { .. } => "messages/partial",
            Frame::MessagesTuple { .. } => "messages",
            Frame::Values { .. } => "values",
            Frame::Updates { .. } => "updates",
            Frame::Custom { .. } => "custom",
            Frame::Error { .. } => "error",
            Frame::End => "end",
        }
    }

    /// JSON payload carried in the SSE `data:` field.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Frame::Metadata { run_id, thread_id } => {
                json!({ "run_id": run_id, "thread_id": thread_id })
            }
            Frame::MessagesPartial { message } => json!([message]),
            Frame::MessagesTuple { chunk, run_id } => json!([
                chunk,
                { "langgraph_node": GRAPH_NODE, "run_id": run_id }
            ]),
            Frame::Values { messages } => json!({ "messages": messages }),
            Frame::Updates { messages } => {
                let mut by_node = serde_json::Map::new();
                by_node.insert(GRAPH_NODE.to_string(), json!({ "messages": messages }));
                Value::Object(by_node)
            }
            Frame::Custom { content } => json!({
                "type": "custom",
                "data": { "message": content, "node": GRAPH_NODE }
            }),
            Frame::Error { error } => json!({ "error": error }),
            Frame::End => json!({}),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::End | Frame::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderPhase {
    Idle,
    Streaming,
    Closed,
}

/// Turns run progress into frames for the requested modes.
#[derive(Debug)]
pub struct StreamProtocolEncoder {
    run_id: String,
    thread_id: String,
    modes: Vec<StreamMode>,
    ai_message_id: String,
    phase: EncoderPhase,
}

impl StreamProtocolEncoder {
    pub fn new(
        run_id: impl Into<String>,
        thread_id: impl Into<String>,
        modes: Vec<StreamMode>,
        ai_message_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            thread_id: thread_id.into(),
            modes,
            ai_message_id: ai_message_id.into(),
            phase: EncoderPhase::Idle,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.phase == EncoderPhase::Closed
    }

    fn wants(&self, mode: StreamMode) -> bool {
        self.modes.contains(&mode)
    }

    fn ai_chunk(&self, content: &str) -> WireMessage {
        WireMessage {
            id: self.ai_message_id.clone(),
            role: Role::Ai,
            content: content.into(),
        }
    }

    /// The `metadata` frame. Emitted once; later calls return nothing.
    pub fn start(&mut self) -> Vec<Frame> {
        if self.phase != EncoderPhase::Idle {
            return Vec::new();
        }
        self.phase = EncoderPhase::Streaming;
        vec![Frame::Metadata {
            run_id: self.run_id.clone(),
            thread_id: self.thread_id.clone(),
        }]
    }

    /// Content frames for one accepted delta.
    pub fn on_delta(&mut self, delta: &str, full_content: &str) -> Vec<Frame> {
        let mut frames = self.start();
        if self.is_closed() {
            return frames;
        }
        if self.wants(StreamMode::Messages) {
            frames.push(Frame::MessagesPartial {
                message: self.ai_chunk(full_content),
            });
        }
        if self.wants(StreamMode::MessagesTuple) {
            frames.push(Frame::MessagesTuple {
                chunk: self.ai_chunk(delta),
                run_id: self.run_id.clone(),
            });
        }
        frames
    }

    /// Final snapshot frames followed by `end`.
    ///
    /// `conversation` is the thread as it stands after the run, reply included.
    pub fn finish(&mut self, conversation: &[Message], reply: &Message) -> Vec<Frame> {
        let mut frames = self.start();
        if self.is_closed() {
            return frames;
        }
        for mode in &self.modes {
            match mode {
                StreamMode::Values => frames.push(Frame::Values {
                    messages: conversation.iter().map(Message::to_wire).collect(),
                }),
                StreamMode::Updates => frames.push(Frame::Updates {
                    messages: vec![reply.to_wire()],
                }),
                StreamMode::Custom => frames.push(Frame::Custom {
                    content: reply.content.to_text(),
                }),
                StreamMode::Messages | StreamMode::MessagesTuple => {}
            }
        }
        frames.push(Frame::End);
        self.phase = EncoderPhase::Closed;
        frames
    }

    /// A single `error` frame, closing the stream.
    pub fn fail(&mut self, error: &str) -> Vec<Frame> {
        let mut frames = self.start();
        if self.is_closed() {
            return frames;
        }
        frames.push(Frame::Error {
            error: error.to_string(),
        });
        self.phase = EncoderPhase::Closed;
        frames
    }
}
