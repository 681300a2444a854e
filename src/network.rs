//! Narrow seams for the external collaborators: the messaging network, the
//! username resolver, and the engagement classifier.
//!
//! The core only ever sees these traits; transport and wire-format details
//! stay behind whichever adapter implements them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message inside a group conversation, as much of it as the core needs.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub sender_address: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    /// True when the agent itself authored the message.
    pub from_agent: bool,
}

/// One group conversation on the messaging network.
#[async_trait]
pub trait GroupConversation: Send + Sync {
    fn id(&self) -> &str;
    async fn members(&self) -> Result<Vec<String>>;
    async fn send(&self, text: &str) -> Result<()>;
    /// Most recent messages, newest last.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<ConversationMessage>>;
}

/// A live session with the messaging network.
#[async_trait]
pub trait MessagingSession: Send + Sync {
    /// The agent's own inbox/installation address on the network.
    fn agent_address(&self) -> &str;
    async fn list_conversations(&self, limit: Option<usize>) -> Result<Vec<String>>;
    async fn conversation(&self, id: &str) -> Result<Box<dyn GroupConversation>>;
}

/// Factory the bootstrapper drives. Connect failures surface as free-text
/// errors; some of those indicate the network's installation cap.
#[async_trait]
pub trait MessagingConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MessagingSession>>;
}

/// Resolves a typed identifier (ENS name, social handle, raw address) to an
/// address, or absent when nothing matches.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Option<String>;
}

/// Plain-text completion service. The returned string is never assumed to be
/// well-formed anything.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementVerdict {
    Engaged,
    Disengaged,
}

/// Decides whether a message from a known thread participant is still talking
/// to the agent, or the conversation has moved on.
#[async_trait]
pub trait EngagementClassifier: Send + Sync {
    async fn classify(
        &self,
        message_text: &str,
        recent_messages: &[ConversationMessage],
    ) -> Result<EngagementVerdict>;
}
