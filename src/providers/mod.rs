use anyhow::{anyhow, Result};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

use crate::data::DataAttachment;

mod gemini;
mod openai;
mod retry;

pub use gemini::Gemini;
pub use openai::OpenAI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenAI,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAI => "openai",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => gemini::DEFAULT_MODEL,
            ProviderKind::OpenAI => openai::DEFAULT_MODEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// `args` holds the tool-call arguments, or the reply text as a JSON string
/// when the model answered in prose instead of calling the tool.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    Data(DataAttachment),
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user_data(data: DataAttachment) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Data(data)],
        }
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;

pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn append_user_data(self, data: DataAttachment) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    Gemini(Gemini),
    OpenAI(OpenAI),
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.append_system_input(input)),
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.append_system_input(input)),
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.append_user_input(input)),
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.append_user_input(input)),
        }
    }

    fn append_user_data(self, data: DataAttachment) -> Self {
        match self {
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.append_user_data(data)),
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.append_user_data(data)),
        }
    }

    fn register_tool(self, tool: ToolSpec) -> Self {
        match self {
            ProviderImpl::Gemini(provider) => ProviderImpl::Gemini(provider.register_tool(tool)),
            ProviderImpl::OpenAI(provider) => ProviderImpl::OpenAI(provider.register_tool(tool)),
        }
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        match self {
            ProviderImpl::Gemini(provider) => provider.call_tool(tool_name),
            ProviderImpl::OpenAI(provider) => provider.call_tool(tool_name),
        }
    }
}

pub fn build_provider(provider: ProviderKind, key: String, model: Option<String>) -> ProviderImpl {
    let model = model.unwrap_or_else(|| provider.default_model().to_string());
    match provider {
        ProviderKind::Gemini => ProviderImpl::Gemini(Gemini::new(key).with_model(model)),
        ProviderKind::OpenAI => ProviderImpl::OpenAI(OpenAI::new(key).with_model(model)),
    }
}

/// Resolves `provider` or `provider:model`; without an argument the first
/// provider with a key in the environment wins, Gemini first.
pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    if let Some(model) = model_arg {
        return parse_model_arg(model);
    }
    for provider in [ProviderKind::Gemini, ProviderKind::OpenAI] {
        if env_key(provider).is_some() {
            return Ok(ProviderSelection {
                provider,
                requested_model: None,
            });
        }
    }
    if override_key.is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: None,
        });
    }
    Err(anyhow!(
        "no API keys found (checked GEMINI_API_KEY/GOOGLE_API_KEY, OPENAI_API_KEY)"
    ))
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key.filter(|key| !key.trim().is_empty()) {
        return Ok(key.to_string());
    }
    env_key(provider).ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

fn env_key(provider: ProviderKind) -> Option<String> {
    match provider {
        ProviderKind::Gemini => get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY")),
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
    }
}

fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }
    let (provider_part, model_part) = match raw.split_once(':') {
        Some((provider, model)) => (provider, Some(model.trim())),
        None => (raw, None),
    };
    let provider = provider_from_name(&provider_part.trim().to_lowercase()).ok_or_else(|| {
        anyhow!(
            "unable to infer provider from model '{}'. Use provider:model (gemini:, openai:)",
            raw
        )
    })?;
    Ok(ProviderSelection {
        provider,
        requested_model: model_part
            .filter(|model| !model.is_empty())
            .map(|model| model.to_string()),
    })
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "gemini" | "google" => Some(ProviderKind::Gemini),
        "openai" => Some(ProviderKind::OpenAI),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
