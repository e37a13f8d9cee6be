use anyhow::{anyhow, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::{format_error_parts, send_with_backoff};
use super::{
    Message, MessagePart, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_data(mut self, data: crate::data::DataAttachment) -> Self {
        self.messages.push(Message::user_data(data));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self
                .tools
                .iter()
                .find(|tool| tool.name == tool_name)
                .cloned()
                .ok_or_else(|| anyhow!("tool '{}' not registered", tool_name))?;
            let client = reqwest::Client::new();
            let url = format!("{}/{}:generateContent", BASE_URL, self.model);
            let body = request_body(&self.messages, &tool);

            let text = send_with_backoff(
                "Gemini",
                || {
                    client
                        .post(&url)
                        .header("x-goog-api-key", self.key.as_str())
                        .json(&body)
                },
                extract_gemini_error,
            )
            .await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }
}

fn request_body(messages: &[Message], tool: &ToolSpec) -> Value {
    let system_instruction = messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::System))
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            MessagePart::Data(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let parts = messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::User))
        .flat_map(|message| message.parts.iter())
        .map(|part| match part {
            MessagePart::Text(text) => json!({"text": text}),
            MessagePart::Data(data) => json!({
                "inline_data": {
                    "mime_type": data.mime,
                    "data": BASE64.encode(&data.bytes)
                }
            }),
        })
        .collect::<Vec<_>>();

    json!({
        "contents": [{"role": "user", "parts": parts}],
        "systemInstruction": if system_instruction.trim().is_empty() {
            Value::Null
        } else {
            json!({"parts": [{"text": system_instruction}]})
        },
        "tools": [{
            "function_declarations": [{
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            }]
        }],
        "tool_config": {
            "function_calling_config": {
                "mode": "ANY",
                "allowed_function_names": [tool.name]
            }
        }
    })
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: GeminiResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let parts = payload
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| content.parts.as_slice())
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;

    let call = parts
        .iter()
        .filter_map(|part| part.function_call.as_ref())
        .find(|call| call.name == tool_name)
        .map(|call| call.args.clone());
    let prose = parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    let args = match call {
        Some(args) => args,
        None if !prose.trim().is_empty() => Value::String(prose),
        None => return Err(anyhow!("no tool call returned from Gemini")),
    };

    let model = payload
        .model_version
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage_metadata.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(
        error.message,
        error.status,
        error.code.map(|value| value.to_string()),
    ))
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataAttachment;

    fn tool() -> ToolSpec {
        ToolSpec {
            name: "report_fields".to_string(),
            description: "Report fields.".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn tool_call_arguments_are_returned() {
        let payload = r#"{
            "candidates": [{"content": {"parts": [
                {"functionCall": {"name": "report_fields", "args": {"fields": []}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 30, "totalTokenCount": 1230},
            "modelVersion": "gemini-2.5-flash-001"
        }"#;
        let response = extract_tool_response(payload, "report_fields", DEFAULT_MODEL).unwrap();
        assert_eq!(response.args, json!({"fields": []}));
        assert_eq!(response.model.as_deref(), Some("gemini-2.5-flash-001"));
        assert_eq!(response.usage.unwrap().total_tokens, Some(1230));
    }

    #[test]
    fn prose_reply_is_passed_through_as_string() {
        let payload = r#"{
            "candidates": [{"content": {"parts": [
                {"text": "```json\n{\"fields\": []}\n```"}
            ]}}]
        }"#;
        let response = extract_tool_response(payload, "report_fields", DEFAULT_MODEL).unwrap();
        assert_eq!(response.args, Value::String("```json\n{\"fields\": []}\n```".to_string()));
        assert_eq!(response.model.as_deref(), Some(DEFAULT_MODEL));
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        let err = extract_tool_response(r#"{"candidates": []}"#, "report_fields", DEFAULT_MODEL)
            .unwrap_err();
        assert!(err.to_string().contains("no candidate"));
    }

    #[test]
    fn error_body_is_summarized() {
        let body = r#"{"error": {"code": 400, "message": "Invalid image", "status": "INVALID_ARGUMENT"}}"#;
        assert_eq!(
            extract_gemini_error(body).as_deref(),
            Some("Invalid image | type: INVALID_ARGUMENT | code: 400")
        );
        assert_eq!(extract_gemini_error("<html>"), None);
    }

    #[test]
    fn request_body_inlines_page_image() {
        let messages = vec![
            Message::system("find blanks".to_string()),
            Message::user_data(DataAttachment {
                bytes: vec![1, 2, 3],
                mime: "image/png".to_string(),
                name: None,
            }),
            Message::user("page 1".to_string()),
        ];
        let body = request_body(&messages, &tool());
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("find blanks")
        );
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], json!("image/png"));
        assert_eq!(parts[0]["inline_data"]["data"], json!("AQID"));
        assert_eq!(parts[1]["text"], json!("page 1"));
        assert_eq!(
            body["tool_config"]["function_calling_config"]["allowed_function_names"][0],
            json!("report_fields")
        );
    }
}
