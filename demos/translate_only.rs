//! Demonstrate using the translation layer without a server.
//!
//! Usage:
//!   `cargo run --example translate_only`

use chat_bridge::translate::flat::ChatCompletionResponse;
use chat_bridge::translate::typed::MessagesRequest;
use chat_bridge::translate::{flat_to_typed, RequestTranslator, StreamReframer, UpstreamFrame};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    // A typed-block request, as a Messages API client would send it
    let typed_req: MessagesRequest = serde_json::from_value(json!({
        "model": "",
        "max_tokens": 1024,
        "system": "You are a geography expert. Be concise.",
        "stream": true,
        "messages": [
            {"role": "user", "content": "What is the capital of France?"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"country": "France"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "Paris"},
                {"type": "text", "text": "And Germany?"}
            ]}
        ],
        "tools": [{
            "name": "lookup",
            "description": "Look up a capital city",
            "input_schema": {"type": "object", "properties": {"country": {"type": "string"}}}
        }]
    }))?;

    // Blank model, so the upstream default applies
    let flat_req = RequestTranslator::new("gpt-4o").translate(&typed_req);

    println!("=== Translated Request (flat-message format) ===");
    println!("{}", serde_json::to_string_pretty(&flat_req)?);

    // A simulated upstream answer, translated back
    let flat_resp: ChatCompletionResponse = serde_json::from_value(json!({
        "id": "chatcmpl-demo",
        "object": "chat.completion",
        "created": 0,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "The capital of Germany is Berlin."},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 42, "completion_tokens": 8, "total_tokens": 50}
    }))?;

    let typed_resp = flat_to_typed(&flat_resp, &flat_req.model)?;

    println!();
    println!("=== Translated Response (typed-block format) ===");
    println!("{}", serde_json::to_string_pretty(&typed_resp)?);

    println!();
    println!("=== Streaming Translation Demo ===");

    let mut reframer = StreamReframer::new(&flat_req.model);
    let payloads = [
        r#"{"id":"chatcmpl-demo","model":"gpt-4o","choices":[{"delta":{"role":"assistant","content":"The"}}]}"#,
        r#"{"choices":[{"delta":{"content":" capital"}}]}"#,
        r#"{"choices":[{"delta":{"content":" is Berlin."},"finish_reason":"stop"}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":42,"completion_tokens":3,"total_tokens":45}}"#,
        "[DONE]",
    ];

    for (i, data) in payloads.iter().enumerate() {
        for event in reframer.process(UpstreamFrame::parse(data)) {
            println!("  chunk {} -> {}: {}", i, event.event_name(), serde_json::to_string(&event)?);
        }
    }

    println!();
    println!("Done! The translation layer works without any network calls.");
    Ok(())
}
