//! Tool definitions, tool choice, tool calls and tool results in both directions.
//!
//! Tool-call arguments travel as JSON *text* in the flat protocol and as a JSON
//! *value* in the typed-block protocol. Conversions here never lose the argument text:
//! when it does not parse, it is wrapped as `{"arguments": <raw text>}`.

use serde_json::Value;

use super::flat::{
    ChatContent, ChatFunction, ChatFunctionCall, ChatMessage, ChatTool, ChatToolCall, ChatToolChoice,
    ChatToolChoiceFunction, ChatToolChoiceSpecific,
};
use super::typed::{ResponseContentBlock, ToolChoice, ToolDefinition};

/// A fresh tool-call id, `call_<token>`. Tokens are time-ordered UUIDv7s, so ids
/// generated later in the process sort after earlier ones.
pub fn generate_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::now_v7().simple())
}

/// Translate tool definitions. Entries with a blank name are dropped; `None` when
/// nothing is left so the field can be omitted.
pub fn tools_to_flat(defs: &[ToolDefinition]) -> Option<Vec<ChatTool>> {
    let tools: Vec<ChatTool> = defs
        .iter()
        .filter_map(|def| {
            let name = def.name.trim();
            if name.is_empty() {
                return None;
            }
            Some(ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: name.to_string(),
                    description: def
                        .description
                        .as_ref()
                        .filter(|d| !d.trim().is_empty())
                        .cloned(),
                    parameters: def.input_schema.clone(),
                },
            })
        })
        .collect();

    if tools.is_empty() {
        None
    } else {
        Some(tools)
    }
}

pub fn tool_choice_to_flat(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "any" => ChatToolChoice::Mode("required".to_string()),
            "auto" => ChatToolChoice::Mode("auto".to_string()),
            other => ChatToolChoice::Mode(other.to_string()),
        },
        ToolChoice::Tool { name } => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
        ToolChoice::Other(value) => ChatToolChoice::Raw(value.clone()),
    }
}

/// Turn a `tool_use` block into a flat tool call.
pub fn tool_use_to_flat_call(id: &str, name: &str, input: Option<&Value>) -> ChatToolCall {
    let id = if id.trim().is_empty() {
        generate_tool_call_id()
    } else {
        id.to_string()
    };
    let arguments = input
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::to_string(v).ok())
        .unwrap_or_else(|| "{}".to_string());

    ChatToolCall {
        id,
        call_type: "function".to_string(),
        function: ChatFunctionCall {
            name: name.to_string(),
            arguments,
        },
    }
}

/// Turn flat tool calls into `tool_use` blocks, dropping calls that carry neither a
/// name nor arguments.
pub fn flat_calls_to_tool_use(calls: &[ChatToolCall]) -> Vec<ResponseContentBlock> {
    calls
        .iter()
        .filter_map(|call| tool_use_block(&call.id, &call.function))
        .collect()
}

/// The legacy single `function_call` field, as a `tool_use` block.
pub fn function_call_to_tool_use(call: &ChatFunctionCall) -> Option<ResponseContentBlock> {
    tool_use_block("", call)
}

fn tool_use_block(id: &str, function: &ChatFunctionCall) -> Option<ResponseContentBlock> {
    let name = function.name.trim();
    if name.is_empty() && function.arguments.trim().is_empty() {
        return None;
    }
    let id = match id.trim() {
        "" => generate_tool_call_id(),
        id => id.to_string(),
    };
    Some(ResponseContentBlock::ToolUse {
        id,
        name: name.to_string(),
        input: parse_tool_arguments(&function.arguments),
    })
}

/// Parse argument text into a JSON value: blank becomes `{}`, unparsable text is
/// wrapped as `{"arguments": <raw>}`.
pub fn parse_tool_arguments(args: &str) -> Value {
    if args.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(args).unwrap_or_else(|_| serde_json::json!({ "arguments": args }))
}

/// A `tool_result` block becomes a `tool`-role message.
pub fn tool_result_to_flat_message(tool_use_id: &str, content: Option<&Value>) -> ChatMessage {
    ChatMessage {
        role: "tool".to_string(),
        content: Some(ChatContent::Text(stringify_tool_result(content))),
        tool_calls: None,
        function_call: None,
        tool_call_id: Some(tool_use_id.to_string()),
    }
}

fn stringify_tool_result(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str, args: &str) -> ChatToolCall {
        ChatToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: ChatFunctionCall {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    #[test]
    fn test_tools_drop_blank_names() {
        let defs = vec![
            ToolDefinition {
                name: "  ".to_string(),
                description: Some("ignored".to_string()),
                input_schema: None,
            },
            ToolDefinition {
                name: "search".to_string(),
                description: Some(" ".to_string()),
                input_schema: Some(json!({"type": "object"})),
            },
        ];
        let tools = tools_to_flat(&defs).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "search");
        assert!(tools[0].function.description.is_none());
        assert_eq!(tools[0].function.parameters, Some(json!({"type": "object"})));

        assert!(tools_to_flat(&defs[..1]).is_none());
        assert!(tools_to_flat(&[]).is_none());
    }

    #[test]
    fn test_tool_choice_mapping() {
        let flat = |c: ToolChoice| serde_json::to_value(tool_choice_to_flat(&c)).unwrap();

        assert_eq!(flat(ToolChoice::Mode("any".into())), json!("required"));
        assert_eq!(flat(ToolChoice::Mode("auto".into())), json!("auto"));
        assert_eq!(flat(ToolChoice::Mode("none".into())), json!("none"));
        assert_eq!(
            flat(ToolChoice::Tool {
                name: "lookup".into()
            }),
            json!({"type": "function", "function": {"name": "lookup"}})
        );
        assert_eq!(
            flat(ToolChoice::Other(json!({"type": "auto"}))),
            json!({"type": "auto"})
        );
    }

    #[test]
    fn test_tool_use_serializes_input() {
        let call = tool_use_to_flat_call("toolu_1", "search", Some(&json!({"q": "rust"})));
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.arguments, r#"{"q":"rust"}"#);

        let call = tool_use_to_flat_call(" ", "search", None);
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.function.arguments, "{}");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_tool_call_id();
        let b = generate_tool_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with("call_"));
    }

    #[test]
    fn test_invalid_arguments_are_preserved() {
        let blocks = flat_calls_to_tool_use(&[call("c1", "run", "not-json")]);
        let ResponseContentBlock::ToolUse { input, .. } = &blocks[0] else {
            panic!("expected tool_use");
        };
        assert_eq!(input, &json!({"arguments": "not-json"}));

        let back = tool_use_to_flat_call("c1", "run", Some(input));
        assert_eq!(back.function.arguments, r#"{"arguments":"not-json"}"#);
    }

    #[test]
    fn test_empty_calls_are_dropped() {
        let blocks = flat_calls_to_tool_use(&[
            call("c1", "", ""),
            call("", "lookup", ""),
            call("c3", "", r#"{"x":1}"#),
        ]);
        assert_eq!(blocks.len(), 2);
        let ResponseContentBlock::ToolUse { id, input, .. } = &blocks[0] else {
            panic!("expected tool_use");
        };
        assert!(id.starts_with("call_"));
        assert_eq!(input, &json!({}));
    }

    #[test]
    fn test_tool_result_rendering() {
        let msg = tool_result_to_flat_message("t1", Some(&json!("plain")));
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(msg.content, Some(ChatContent::Text("plain".to_string())));

        let msg = tool_result_to_flat_message("t1", Some(&json!([{"type": "text", "text": "x"}])));
        assert_eq!(
            msg.content,
            Some(ChatContent::Text(r#"[{"text":"x","type":"text"}]"#.to_string()))
        );

        let msg = tool_result_to_flat_message("t1", None);
        assert_eq!(msg.content, Some(ChatContent::Text(String::new())));
    }
}
