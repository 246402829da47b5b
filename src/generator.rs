//! Response generation behind the [`Generator`] trait.
//!
//! The engine only depends on the trait; [`OllamaGenerator`] is the stock
//! implementation speaking the Ollama chat API on a local endpoint. The
//! persona's voice travels in as a [`DecisionContext`] and is rendered into
//! the system prompt here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::error::{DoppelError, Result};
use crate::persona::{DecisionContext, RelationshipKind, ResponseLength};
use crate::store::{Message, Role};

/// Everything handed to a generator for one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub meta: serde_json::Value,
    pub context: DecisionContext,
    pub history: Vec<Message>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce reply text for the request. Implementations must bound their
    /// own network waits; the engine additionally enforces a timeout.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Called once during engine startup. Failures are logged, not fatal.
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Called during engine shutdown.
    async fn cleanup(&self) {}
}

// ─── Ollama wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Generator backed by a local Ollama instance.
pub struct OllamaGenerator {
    config: GeneratorConfig,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    async fn call_chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let url = format!("{}/api/chat", self.config.base_url);
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: false,
            options: ChatOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                repeat_penalty: self.config.repeat_penalty,
                num_predict: self.config.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    DoppelError::Unavailable
                } else if e.is_timeout() {
                    DoppelError::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    DoppelError::Generation(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            return Err(DoppelError::Generation(format!("HTTP {}: {}", status, body)));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| DoppelError::Generation(format!("bad chat response: {e}")))?;

        completion
            .message
            .map(|m| m.content)
            .ok_or_else(|| DoppelError::Generation("no message in chat response".to_string()))
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let system = build_system_prompt(
            self.config.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT),
            &request.context,
        );

        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: system,
        }];

        // Recent history only, to keep prompts inside token limits.
        let start = request.history.len().saturating_sub(10);
        for message in &request.history[start..] {
            messages.push(ChatMessage {
                role: match message.role {
                    Role::User => "user".to_string(),
                    Role::Assistant => "assistant".to_string(),
                },
                content: message.content.clone(),
            });
        }

        messages.push(ChatMessage {
            role: "user".to_string(),
            content: build_user_prompt(request),
        });

        let raw = self.call_chat(messages).await?;
        let reply = post_process(&raw, request.context.style.response_length);
        tracing::info!(
            "Generated reply for {} ({} chars)",
            request.sender,
            reply.len()
        );
        Ok(reply)
    }

    async fn ensure_ready(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|_| DoppelError::Unavailable)?;
        if !response.status().is_success() {
            return Err(DoppelError::Unavailable);
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|_| DoppelError::Unavailable)?;
        let names: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();
        if !names.iter().any(|name| *name == self.config.model) {
            tracing::warn!(
                "Model {} not found on {} (available: {:?})",
                self.config.model,
                self.config.base_url,
                names
            );
        }
        Ok(())
    }

    async fn cleanup(&self) {
        tracing::info!("Ollama generator shut down");
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are standing in for a real person in their online \
conversations. Reply the way they would: keep their personality, their communication style and \
their usual patterns.\n\nGround rules:\n1. Sound like the person, not like an assistant\n2. Stay \
consistent with the personality traits you are given\n3. Factor in the relationship with this \
contact\n4. Keep replies natural and conversational\n5. Never mention being an AI or a stand-in\n\
6. Use the conversation history when it is relevant";

/// Renders the persona context into the system prompt: prominent traits,
/// style phrasing, relationship guidance and behavioral guidelines.
pub fn build_system_prompt(base: &str, context: &DecisionContext) -> String {
    let mut parts = vec![base.to_string()];

    let trait_lines: Vec<String> = context
        .active_traits
        .iter()
        .filter(|(_, weight)| **weight > 0.5)
        .map(|(name, weight)| format!("- {}: {:.1}/1.0", title_case(name), weight))
        .collect();
    if !trait_lines.is_empty() {
        parts.push(format!("Your personality traits:\n{}", trait_lines.join("\n")));
    }

    let style = &context.style;
    let mut style_lines = Vec::new();
    style_lines.push(
        if style.formality < 0.3 {
            "Use casual, informal language"
        } else if style.formality > 0.7 {
            "Use formal, professional language"
        } else {
            "Use moderately formal language"
        }
        .to_string(),
    );
    style_lines.push(
        match style.response_length {
            ResponseLength::Short => "Keep responses brief and concise",
            ResponseLength::Long => "Provide detailed, comprehensive responses",
            ResponseLength::Medium => "Provide moderate-length responses",
        }
        .to_string(),
    );
    if style.humor_level > 0.6 {
        style_lines.push("Include appropriate humor when suitable".to_string());
    } else if style.humor_level < 0.3 {
        style_lines.push("Maintain a serious, professional tone".to_string());
    }
    style_lines.push(
        if style.emoji_usage > 0.6 {
            "Use emojis frequently to express emotions"
        } else if style.emoji_usage > 0.3 {
            "Use emojis occasionally"
        } else {
            "Rarely use emojis"
        }
        .to_string(),
    );
    parts.push(format!(
        "Communication style:\n{}",
        style_lines
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    ));

    let mut relationship = format!(
        "Relationship context:\n- This person is a {}",
        kind_label(context.relationship_kind)
    );
    if context.closeness > 0.7 {
        relationship.push_str("\n- You have a close relationship - be warm and personal");
    } else if context.closeness < 0.3 {
        relationship.push_str("\n- Keep interactions professional and somewhat distant");
    } else {
        relationship.push_str("\n- Maintain a friendly but not overly personal tone");
    }
    parts.push(relationship);

    if !context.guidelines.is_empty() {
        parts.push(format!(
            "Behavioral guidelines:\n{}",
            context
                .guidelines
                .iter()
                .map(|g| format!("- {g}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !context.examples.is_empty() {
        parts.push(format!(
            "Phrases you might use:\n{}",
            context
                .examples
                .iter()
                .map(|e| format!("- {e}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    parts.join("\n\n")
}

fn build_user_prompt(request: &GenerationRequest) -> String {
    let mut parts = vec![
        format!("Message from {} on {}:", request.sender, request.channel),
        format!("\"{}\"", request.content),
    ];
    if !request.meta.is_null() {
        parts.push(format!("Additional context: {}", request.meta));
    }
    parts.push(String::new());
    parts.push("Please respond naturally as you would to this person.".to_string());
    parts.join("\n")
}

/// Strips canned lead-ins the model sometimes adds and trims over-long
/// replies when the persona prefers short answers.
pub fn post_process(raw: &str, length: ResponseLength) -> String {
    let mut response = raw.trim().to_string();

    const UNWANTED_PREFIXES: [&str; 5] = [
        "Here's my response:",
        "I would respond:",
        "My response:",
        "Response:",
        "I'd say:",
    ];
    for prefix in UNWANTED_PREFIXES {
        if response.to_lowercase().starts_with(&prefix.to_lowercase()) {
            response = response[prefix.len()..].trim().to_string();
        }
    }

    if length == ResponseLength::Short && response.len() > 200 {
        if let Some(index) = response.find(". ") {
            response.truncate(index + 1);
        }
    }

    response
}

fn kind_label(kind: RelationshipKind) -> &'static str {
    match kind {
        RelationshipKind::Family => "family member",
        RelationshipKind::Friend => "friend",
        RelationshipKind::Colleague => "colleague",
        RelationshipKind::Professional => "professional contact",
        RelationshipKind::Unknown => "new or unknown contact",
    }
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
