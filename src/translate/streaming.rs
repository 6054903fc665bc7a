//! State machine for re-framing flat-message streaming chunks into typed-block SSE events.
//!
//! The [`StreamReframer`] consumes upstream frames one at a time, tracks which content
//! blocks are open and buffers tool-call argument fragments, and emits the corresponding
//! typed-block stream events (`message_start`, `content_block_delta`, ...). It does no I/O:
//! the proxy layer feeds it decoded SSE payloads and forwards what it returns.

use std::collections::BTreeMap;

use super::flat::ChatCompletionChunk;
use super::response::generate_message_id;
use super::tools::generate_tool_call_id;
use super::typed::{
    Delta, DeltaUsage, MessageDeltaBody, MessageStartBody, ResponseContentBlock, StopReason,
    StreamEvent, Usage,
};

/// One decoded upstream SSE payload.
#[derive(Debug, Clone)]
pub enum UpstreamFrame {
    Chunk(Box<ChatCompletionChunk>),
    /// The `[DONE]` sentinel.
    Done,
    /// A payload that is neither `[DONE]` nor a valid chunk.
    Malformed { error: String },
}

impl UpstreamFrame {
    pub fn parse(data: &str) -> Self {
        let data = data.trim();
        if data == "[DONE]" {
            return UpstreamFrame::Done;
        }
        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => UpstreamFrame::Chunk(Box::new(chunk)),
            Err(e) => UpstreamFrame::Malformed {
                error: e.to_string(),
            },
        }
    }
}

/// Lifecycle of one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Nothing emitted yet.
    Idle,
    /// `message_start` emitted, no content block opened.
    Started,
    /// At least one content block opened.
    Emitting,
    /// `message_stop` emitted; further input is ignored.
    Closed,
}

#[derive(Debug, Clone)]
struct ToolBlock {
    assigned_index: usize,
    id: String,
    name: String,
    arguments: String,
    started: bool,
    finished: bool,
}

#[derive(Debug)]
struct StreamState {
    phase: StreamPhase,
    message_id: String,
    model: String,
    next_block_index: usize,
    text_block: Option<usize>,
    /// Keyed by the call's position in the upstream message.
    tool_blocks: BTreeMap<usize, ToolBlock>,
    has_tool_calls: bool,
    input_tokens: u64,
    output_tokens: u64,
    finish_reason: Option<String>,
}

/// Per-request converter from upstream chunks to typed-block stream events.
///
/// Usage:
///   let mut reframer = StreamReframer::new("gpt-4o-mini");
///   for payload in sse_payloads {
///       for event in reframer.process(UpstreamFrame::parse(&payload)) {
///           // send each event as SSE
///       }
///   }
///   let final_events = reframer.finish();
#[derive(Debug)]
pub struct StreamReframer {
    state: StreamState,
}

impl StreamReframer {
    /// `fallback_model` is reported when the upstream chunks carry no model.
    pub fn new(fallback_model: &str) -> Self {
        Self {
            state: StreamState {
                phase: StreamPhase::Idle,
                message_id: String::new(),
                model: fallback_model.to_string(),
                next_block_index: 0,
                text_block: None,
                tool_blocks: BTreeMap::new(),
                has_tool_calls: false,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: None,
            },
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.phase
    }

    pub fn is_closed(&self) -> bool {
        self.state.phase == StreamPhase::Closed
    }

    pub fn process(&mut self, frame: UpstreamFrame) -> Vec<StreamEvent> {
        match frame {
            UpstreamFrame::Chunk(chunk) => self.process_chunk(&chunk),
            UpstreamFrame::Done => self.finish(),
            UpstreamFrame::Malformed { error } => {
                tracing::debug!(%error, "skipping malformed stream chunk");
                Vec::new()
            }
        }
    }

    /// Process a single upstream chunk, returning zero or more events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.is_closed() {
            return Vec::new();
        }

        let mut events = Vec::new();

        if self.state.phase == StreamPhase::Idle {
            if let Some(id) = chunk.id.as_deref().filter(|id| !id.is_empty()) {
                self.state.message_id = id.to_string();
            }
            if let Some(model) = chunk.model.as_deref().filter(|m| !m.is_empty()) {
                self.state.model = model.to_string();
            }
            events.push(self.start_message());
        }

        if let Some(ref usage) = chunk.usage {
            self.state.input_tokens = usage.prompt_tokens;
            self.state.output_tokens = usage.completion_tokens;
        }

        for choice in &chunk.choices {
            if let Some(ref reason) = choice.finish_reason {
                self.state.finish_reason = Some(reason.clone());
            }

            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                let index = match self.state.text_block {
                    Some(index) => index,
                    None => {
                        let index = self.open_block();
                        self.state.text_block = Some(index);
                        events.push(StreamEvent::ContentBlockStart {
                            index,
                            content_block: ResponseContentBlock::Text {
                                text: String::new(),
                            },
                        });
                        index
                    }
                };
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta {
                        text: text.to_string(),
                    },
                });
            }

            for call in choice.delta.tool_calls.iter().flatten() {
                self.state.has_tool_calls = true;

                if !self.state.tool_blocks.contains_key(&call.index) {
                    let assigned_index = self.open_block();
                    let id = call
                        .id
                        .clone()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(generate_tool_call_id);
                    self.state.tool_blocks.insert(
                        call.index,
                        ToolBlock {
                            assigned_index,
                            id,
                            name: String::new(),
                            arguments: String::new(),
                            started: false,
                            finished: false,
                        },
                    );
                }
                let Some(block) = self.state.tool_blocks.get_mut(&call.index) else {
                    continue;
                };

                if let Some(ref function) = call.function {
                    if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                        block.name = name.to_string();
                    }
                    if let Some(args) = function.arguments.as_deref() {
                        block.arguments.push_str(args);
                    }
                }

                if !block.started {
                    block.started = true;
                    events.push(StreamEvent::ContentBlockStart {
                        index: block.assigned_index,
                        content_block: ResponseContentBlock::ToolUse {
                            id: block.id.clone(),
                            name: block.name.clone(),
                            input: serde_json::Value::Object(serde_json::Map::new()),
                        },
                    });
                }
            }
        }

        events
    }

    /// Close the message (on `[DONE]` or end of input) and flush the closing events.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.is_closed() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.state.phase == StreamPhase::Idle {
            events.push(self.start_message());
        }

        if let Some(index) = self.state.text_block {
            events.push(StreamEvent::ContentBlockStop { index });
        }

        let mut tool_blocks: Vec<&mut ToolBlock> = self.state.tool_blocks.values_mut().collect();
        tool_blocks.sort_by_key(|b| b.assigned_index);
        for block in tool_blocks {
            if !block.started || block.finished {
                continue;
            }
            let args = block.arguments.trim();
            if !args.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index: block.assigned_index,
                    delta: Delta::InputJsonDelta {
                        partial_json: args.to_string(),
                    },
                });
            }
            events.push(StreamEvent::ContentBlockStop {
                index: block.assigned_index,
            });
            block.finished = true;
        }

        if let Some(ref reason) = self.state.finish_reason {
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(StopReason::from_finish_reason(
                        Some(reason),
                        self.state.has_tool_calls,
                    )),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: self.state.output_tokens,
                    input_tokens: (self.state.input_tokens > 0).then_some(self.state.input_tokens),
                },
            });
        }

        events.push(StreamEvent::MessageStop);
        self.state.phase = StreamPhase::Closed;
        events
    }

    fn start_message(&mut self) -> StreamEvent {
        if self.state.message_id.is_empty() {
            self.state.message_id = generate_message_id();
        }
        self.state.phase = StreamPhase::Started;
        StreamEvent::MessageStart {
            message: MessageStartBody {
                id: self.state.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                model: self.state.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }

    fn open_block(&mut self) -> usize {
        let index = self.state.next_block_index;
        self.state.next_block_index += 1;
        self.state.phase = StreamPhase::Emitting;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> UpstreamFrame {
        UpstreamFrame::parse(&value.to_string())
    }

    fn run(reframer: &mut StreamReframer, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads
            .iter()
            .flat_map(|p| reframer.process(UpstreamFrame::parse(p)))
            .collect()
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    fn tool_delta(position: usize, id: Option<&str>, name: Option<&str>, args: &str) -> String {
        json!({
            "choices": [{
                "delta": {"tool_calls": [{
                    "index": position,
                    "id": id,
                    "function": {"name": name, "arguments": args}
                }]}
            }]
        })
        .to_string()
    }

    #[test]
    fn test_three_chunk_text_stream() {
        let mut reframer = StreamReframer::new("fallback");
        let events = run(
            &mut reframer,
            &[
                r#"{"id":"x","model":"m","choices":[{"delta":{"content":"Hi"}}]}"#,
                r#"{"choices":[{"delta":{"content":" there"},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let StreamEvent::MessageStart { message } = &events[0] else {
            panic!("expected message_start");
        };
        assert_eq!(message.id, "x");
        assert_eq!(message.model, "m");
        assert_eq!(message.role, "assistant");
        assert!(message.content.is_empty());

        assert_eq!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text {
                    text: String::new()
                },
            }
        );
        assert_eq!(
            events[3],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::TextDelta {
                    text: " there".to_string()
                },
            }
        );
        assert_eq!(events[4], StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(
            events[5],
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage: DeltaUsage::default(),
            }
        );
        assert!(reframer.is_closed());
        assert!(reframer.finish().is_empty());
    }

    #[test]
    fn test_interleaved_tool_calls_get_distinct_indices() {
        let mut reframer = StreamReframer::new("m");
        let events = run(
            &mut reframer,
            &[
                &tool_delta(0, Some("call_a"), Some("search"), "{\"q\":"),
                &tool_delta(1, Some("call_b"), Some("lookup"), "{\"id\""),
                &tool_delta(0, None, None, "\"rust\"}"),
                &tool_delta(1, None, None, ":7}"),
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );

        let starts: Vec<(usize, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::ToolUse { id, .. },
                } => Some((*index, id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            starts,
            vec![(0, "call_a".to_string()), (1, "call_b".to_string())]
        );

        let deltas: Vec<(usize, &str)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::InputJsonDelta { partial_json },
                } => Some((*index, partial_json.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![(0, "{\"q\":\"rust\"}"), (1, "{\"id\":7}")]);

        let tail = names(&events[events.len() - 6..]);
        assert_eq!(
            tail,
            vec![
                "content_block_delta",
                "content_block_stop",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(matches!(
            &events[events.len() - 2],
            StreamEvent::MessageDelta { delta, .. } if delta.stop_reason == Some(StopReason::ToolUse)
        ));
    }

    #[test]
    fn test_indices_follow_first_appearance_not_position() {
        let mut reframer = StreamReframer::new("m");
        let events = run(
            &mut reframer,
            &[
                &tool_delta(3, None, Some("late"), ""),
                r#"{"choices":[{"delta":{"content":"text"}}]}"#,
                &tool_delta(0, Some("call_z"), Some("early"), ""),
            ],
        );

        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1, 2]);

        let StreamEvent::ContentBlockStart {
            content_block: ResponseContentBlock::ToolUse { id, name, .. },
            ..
        } = &events[1]
        else {
            panic!("expected tool_use start");
        };
        assert!(id.starts_with("call_"));
        assert_eq!(name, "late");
    }

    #[test]
    fn test_text_after_tool_deltas_reuses_text_block() {
        let mut reframer = StreamReframer::new("m");
        let mut events = run(
            &mut reframer,
            &[
                r#"{"choices":[{"delta":{"content":"before"}}]}"#,
                &tool_delta(0, Some("call_1"), Some("f"), "{}"),
                r#"{"choices":[{"delta":{"content":"after"}}]}"#,
            ],
        );
        events.extend(reframer.finish());

        let text_indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { .. },
                } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(text_indices, vec![0, 0]);

        let stops: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![0, 1]);
        // No finish reason was seen
        assert!(!names(&events).contains(&"message_delta"));
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[test]
    fn test_malformed_chunk_is_skipped() {
        let mut reframer = StreamReframer::new("m");
        let events = run(
            &mut reframer,
            &[
                r#"{"id":"x","choices":[{"delta":{"content":"a"}}]}"#,
                "{not json",
                r#"{"choices":[{"delta":{"content":"b"}}]}"#,
            ],
        );
        assert_eq!(
            names(&events),
            vec!["message_start", "content_block_start", "content_block_delta", "content_block_delta"]
        );
        assert_eq!(reframer.phase(), StreamPhase::Emitting);
    }

    #[test]
    fn test_malformed_first_chunk_does_not_start_message() {
        let mut reframer = StreamReframer::new("m");
        assert!(reframer.process(UpstreamFrame::parse("garbage")).is_empty());
        assert_eq!(reframer.phase(), StreamPhase::Idle);
    }

    #[test]
    fn test_finish_without_chunks() {
        let mut reframer = StreamReframer::new("fallback-model");
        let events = reframer.process(UpstreamFrame::Done);

        assert_eq!(names(&events), vec!["message_start", "message_stop"]);
        let StreamEvent::MessageStart { message } = &events[0] else {
            panic!("expected message_start");
        };
        assert!(message.id.starts_with("msg_"));
        assert_eq!(message.model, "fallback-model");
    }

    #[test]
    fn test_usage_reporting() {
        let mut reframer = StreamReframer::new("m");
        let mut events = run(
            &mut reframer,
            &[
                r#"{"choices":[{"delta":{"content":"a"},"finish_reason":"length"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":5,"total_tokens":17}}"#,
            ],
        );
        events.extend(reframer.finish());

        let delta = events
            .iter()
            .find(|e| e.event_name() == "message_delta")
            .unwrap();
        assert_eq!(
            serde_json::to_value(delta).unwrap(),
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "max_tokens", "stop_sequence": null},
                "usage": {"output_tokens": 5, "input_tokens": 12}
            })
        );

        let mut reframer = StreamReframer::new("m");
        let mut events = run(
            &mut reframer,
            &[r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":0,"completion_tokens":3}}"#],
        );
        events.extend(reframer.finish());
        let delta = events
            .iter()
            .find(|e| e.event_name() == "message_delta")
            .unwrap();
        assert_eq!(
            serde_json::to_value(delta).unwrap()["usage"],
            json!({"output_tokens": 3})
        );
    }

    #[test]
    fn test_null_delta_and_choices_keep_finish_and_usage() {
        let mut reframer = StreamReframer::new("m");
        let events = run(
            &mut reframer,
            &[
                r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
                r#"{"choices":[{"index":0,"delta":null,"finish_reason":"length"}]}"#,
                r#"{"choices":null,"usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}"#,
                "[DONE]",
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            serde_json::to_value(&events[4]).unwrap(),
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "max_tokens", "stop_sequence": null},
                "usage": {"output_tokens": 2, "input_tokens": 4}
            })
        );
    }

    #[test]
    fn test_message_start_reports_zero_usage() {
        let mut reframer = StreamReframer::new("m");
        let events = reframer.process(frame(json!({
            "id": "x",
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1}
        })));
        let StreamEvent::MessageStart { message } = &events[0] else {
            panic!("expected message_start");
        };
        assert_eq!(message.usage, Usage::default());
        assert_eq!(reframer.phase(), StreamPhase::Started);
    }

    #[test]
    fn test_input_after_close_is_ignored() {
        let mut reframer = StreamReframer::new("m");
        run(&mut reframer, &["[DONE]"]);
        let events = run(&mut reframer, &[r#"{"choices":[{"delta":{"content":"late"}}]}"#]);
        assert!(events.is_empty());
    }
}
