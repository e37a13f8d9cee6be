use anyhow::{anyhow, Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::{format_error_parts, send_with_backoff};
use super::{
    Message, MessagePart, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
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

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }
}

impl Provider for OpenAI {
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
            let tool = self.find_tool(&tool_name)?.clone();
            let client = reqwest::Client::new();
            let url = format!("{}/responses", base_url());
            let body = request_body(&self.model, &self.messages, &tool);

            let text = send_with_backoff(
                "OpenAI",
                || client.post(&url).bearer_auth(&self.key).json(&body),
                extract_openai_error,
            )
            .await?;
            extract_response_tool_call(&text, &tool_name, &self.model)
        })
    }
}

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn request_body(model: &str, messages: &[Message], tool: &ToolSpec) -> Value {
    let system = messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::System))
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            MessagePart::Data(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let input = messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::User))
        .map(|message| {
            let parts = message
                .parts
                .iter()
                .map(|part| match part {
                    MessagePart::Text(text) => json!({"type": "input_text", "text": text}),
                    MessagePart::Data(data) => {
                        let encoded = BASE64.encode(&data.bytes);
                        if data.mime.starts_with("image/") {
                            let url = format!("data:{};base64,{}", data.mime, encoded);
                            json!({"type": "input_image", "image_url": url})
                        } else {
                            let filename = data
                                .name
                                .clone()
                                .unwrap_or_else(|| "attachment".to_string());
                            json!({"type": "input_file", "filename": filename, "file_data": encoded})
                        }
                    }
                })
                .collect::<Vec<_>>();
            json!({"role": "user", "content": parts})
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "input": input,
        "tools": [
            {
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            }
        ],
        "tool_choice": {"type": "function", "name": tool.name}
    });
    if !system.trim().is_empty() {
        body["instructions"] = json!(system);
    }
    body
}

fn extract_response_tool_call(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: ResponseApiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let call = payload.output.iter().find_map(|item| match item {
        ResponseOutputItem::FunctionCall { name, arguments } if name == tool_name => {
            Some(arguments)
        }
        _ => None,
    });
    let args = match call {
        Some(arguments) => serde_json::from_str(arguments)
            .with_context(|| "failed to parse OpenAI tool arguments")?,
        None => {
            let prose = output_text(&payload.output);
            if prose.trim().is_empty() {
                return Err(anyhow!("no tool call returned from OpenAI"));
            }
            Value::String(prose)
        }
    };

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn output_text(output: &[ResponseOutputItem]) -> String {
    output
        .iter()
        .filter_map(|item| match item {
            ResponseOutputItem::Message { content } => Some(content),
            _ => None,
        })
        .flatten()
        .filter_map(|content| match content {
            ResponseContent::OutputText { text } => Some(text.as_str()),
            ResponseContent::Other => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, error.code))
}

#[derive(Debug, Deserialize)]
struct ResponseApiResponse {
    model: Option<String>,
    #[serde(default)]
    output: Vec<ResponseOutputItem>,
    usage: Option<ResponseApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseOutputItem {
    #[serde(rename = "function_call")]
    FunctionCall { name: String, arguments: String },
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<ResponseContent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContent {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}
