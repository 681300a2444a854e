//! OpenAI-compatible completion client and the LLM-backed engagement
//! classifier built on top of it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::network::{
    CompletionClient, ConversationMessage, EngagementClassifier, EngagementVerdict,
};

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key: api_key.unwrap_or_default(),
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionClient for LlmClient {
    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature,
            max_tokens,
        };

        let mut req = self.client.post(&url).json(&request);
        // API key is optional for local models.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse =
            response.json().await.context("Failed to parse LLM response")?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

/// Pull a JSON object out of a completion that may wrap it in prose or a
/// markdown code fence.
pub fn extract_json<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response.trim()) {
        return Ok(parsed);
    }

    let candidate = if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => response,
        }
    } else if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        &response[start..=end]
    } else {
        response
    };

    serde_json::from_str::<T>(candidate.trim())
        .with_context(|| format!("Failed to parse JSON response. Raw response: {}", response))
}

#[derive(Debug, Deserialize)]
struct EngagementDecision {
    engaged: bool,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

/// Classifier that asks the completion service whether a message continues
/// the conversation with the agent.
pub struct LlmEngagementClassifier<C: CompletionClient> {
    client: C,
}

impl<C: CompletionClient> LlmEngagementClassifier<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn build_prompt(message_text: &str, recent_messages: &[ConversationMessage]) -> String {
        let mut transcript = String::new();
        for message in recent_messages.iter().rev().take(10).rev() {
            let who = if message.from_agent { "agent" } else { "user" };
            transcript.push_str(&format!("[{}] {}\n", who, message.text));
        }

        format!(
            "You are watching a group chat where an agent helps members launch \
             tokens and split trading fees. Recent messages:\n{}\n\
             New message: {:?}\n\n\
             Is the new message still directed at the agent or continuing its \
             conversation (as opposed to members talking among themselves)?\n\
             Respond with JSON: {{\"engaged\": true/false, \"reasoning\": \"...\"}}",
            transcript, message_text
        )
    }
}

#[async_trait]
impl<C: CompletionClient> EngagementClassifier for LlmEngagementClassifier<C> {
    async fn classify(
        &self,
        message_text: &str,
        recent_messages: &[ConversationMessage],
    ) -> Result<EngagementVerdict> {
        let prompt = Self::build_prompt(message_text, recent_messages);
        let response = self.client.complete(&prompt, 200, 0.0).await?;
        let decision: EngagementDecision = extract_json(&response)?;
        Ok(if decision.engaged {
            EngagementVerdict::Engaged
        } else {
            EngagementVerdict::Disengaged
        })
    }
}
