use super::flat::ChatCompletionResponse;
use super::tools::{flat_calls_to_tool_use, function_call_to_tool_use};
use super::typed::{MessagesResponse, ResponseContentBlock, StopReason, Usage};
use crate::error::{truncate, BridgeError, Result};

/// How much of an offending upstream body is kept for diagnostics.
const BODY_EXCERPT_LIMIT: usize = 2000;

/// Translate a completed flat-message response into a typed-block response.
/// `request_model` fills in the model when the upstream omits it.
///
/// # Errors
/// `BridgeError::UpstreamProtocol` when the response has no choices or the first
/// choice carries no message. The error's body is empty; [`body_to_typed`] fills it
/// from the raw upstream bytes.
pub fn flat_to_typed(resp: &ChatCompletionResponse, request_model: &str) -> Result<MessagesResponse> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| BridgeError::upstream_protocol("no choices in response", ""))?;
    let message = choice
        .message
        .as_ref()
        .ok_or_else(|| BridgeError::upstream_protocol("first choice has no message", ""))?;

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    let text = message
        .content
        .as_ref()
        .map(|c| c.flatten_text())
        .unwrap_or_default();
    if !text.trim().is_empty() {
        content.push(ResponseContentBlock::Text { text });
    }

    let mut tool_blocks = message
        .tool_calls
        .as_deref()
        .map(flat_calls_to_tool_use)
        .unwrap_or_default();
    tool_blocks.extend(message.function_call.as_ref().and_then(function_call_to_tool_use));
    let has_tool_calls = !tool_blocks.is_empty();
    content.extend(tool_blocks);

    // The typed-block protocol requires non-empty content
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = StopReason::from_finish_reason(choice.finish_reason.as_deref(), has_tool_calls);

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    let id = if resp.id.trim().is_empty() {
        generate_message_id()
    } else {
        resp.id.clone()
    };
    let model = if resp.model.trim().is_empty() {
        request_model.to_string()
    } else {
        resp.model.clone()
    };

    Ok(MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    })
}

/// A fresh typed-block message id.
pub fn generate_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Parse a raw upstream body and translate it. Protocol errors carry an excerpt of
/// `body` exactly as the upstream sent it.
pub fn body_to_typed(body: &[u8], request_model: &str) -> Result<MessagesResponse> {
    let text = String::from_utf8_lossy(body);
    let excerpt = || truncate(&text, BODY_EXCERPT_LIMIT).to_string();

    let parsed: ChatCompletionResponse = serde_json::from_slice(body).map_err(|e| {
        BridgeError::upstream_protocol(format!("invalid upstream response: {}", e), excerpt())
    })?;
    flat_to_typed(&parsed, request_model).map_err(|e| e.with_upstream_body(excerpt()))
}
