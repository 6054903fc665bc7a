//! Translate typed-block (Messages API) requests into flat-message (Chat Completions) requests.
//!
//! A single typed-block message can expand into several flat messages: the "main"
//! message carrying text and tool calls, followed by one `tool`-role message per
//! `tool_result` block.

use super::flat::{ChatCompletionRequest, ChatMessage, StreamOptions};
use super::tools::{
    tool_choice_to_flat, tool_result_to_flat_message, tool_use_to_flat_call, tools_to_flat,
};
use super::typed::{ContentBlock, Message, MessageContent, MessagesRequest};

/// Translates requests for one upstream. The default model is resolved by the caller
/// (from the upstream's configuration) and injected here.
#[derive(Debug, Clone, Default)]
pub struct RequestTranslator {
    default_model: String,
}

impl RequestTranslator {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// The model the upstream will be asked for.
    pub fn resolve_model(&self, requested: &str) -> String {
        if requested.trim().is_empty() {
            self.default_model.clone()
        } else {
            requested.to_string()
        }
    }

    pub fn translate(&self, req: &MessagesRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);

        if let Some(system) = req.system.as_ref().map(MessageContent::flatten_text) {
            if !system.trim().is_empty() {
                messages.push(ChatMessage::text("system", system));
            }
        }

        for msg in &req.messages {
            messages.extend(translate_message(msg));
        }

        let stream = req.is_streaming();

        ChatCompletionRequest {
            model: self.resolve_model(&req.model),
            messages,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: req.max_tokens.filter(|n| *n > 0),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
            tools: req.tools.as_deref().and_then(tools_to_flat),
            tool_choice: req.tool_choice.as_ref().map(tool_choice_to_flat),
        }
    }
}

/// Expand one typed-block message into its flat equivalents.
pub fn translate_message(msg: &Message) -> Vec<ChatMessage> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    match &msg.content {
        MessageContent::Text(_) => text_parts = msg.content.text_parts(),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.trim().is_empty() {
                            text_parts.push(text);
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(tool_use_to_flat_call(id, name, input.as_ref()));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        tool_results.push(tool_result_to_flat_message(tool_use_id, content.as_ref()));
                    }
                }
            }
        }
    }

    let mut messages = Vec::with_capacity(1 + tool_results.len());

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let mut main = ChatMessage::text(msg.role.clone(), text_parts.join("\n"));
        if !tool_calls.is_empty() {
            main.tool_calls = Some(tool_calls);
        }
        messages.push(main);
    } else if tool_results.is_empty() {
        // Keep the turn even when it carries nothing
        messages.push(ChatMessage::text(msg.role.clone(), String::new()));
    }

    messages.extend(tool_results);
    messages
}
