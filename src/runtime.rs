//! Message-driven runtime: one unit of work per inbound message, with
//! per-conversation arrival order preserved.
//!
//! The dispatcher owns a routing table of conversation id to worker channel.
//! Each conversation gets its own worker task fed through a flume channel, so
//! messages within a conversation are handled strictly in order while
//! different conversations proceed in parallel. The flow layer itself (intent
//! handling, transaction construction) stays behind [`FlowHandler`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::allocation::AllocationError;
use crate::config::AgentConfig;
use crate::engagement::ThreadEngagementTracker;
use crate::groups::GroupStateManager;
use crate::network::{EngagementClassifier, MessagingSession};

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub sender_address: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// The conversational flow layer. Receives only messages the engagement
/// gate let through; whatever it returns is sent back into the conversation.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn handle(
        &self,
        message: &InboundMessage,
        manager: &GroupStateManager,
    ) -> Result<Option<String>>;
}

pub struct AgentRuntime {
    config: AgentConfig,
    manager: Arc<GroupStateManager>,
    tracker: Arc<ThreadEngagementTracker>,
    classifier: Arc<dyn EngagementClassifier>,
    session: Arc<dyn MessagingSession>,
    flow: Arc<dyn FlowHandler>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        manager: Arc<GroupStateManager>,
        tracker: Arc<ThreadEngagementTracker>,
        classifier: Arc<dyn EngagementClassifier>,
        session: Arc<dyn MessagingSession>,
        flow: Arc<dyn FlowHandler>,
    ) -> Self {
        Self {
            config,
            manager,
            tracker,
            classifier,
            session,
            flow,
        }
    }

    pub fn manager(&self) -> &Arc<GroupStateManager> {
        &self.manager
    }

    pub fn tracker(&self) -> &Arc<ThreadEngagementTracker> {
        &self.tracker
    }

    /// Dispatch loop. Runs until the inbound channel closes.
    pub async fn run(self: Arc<Self>, inbound: flume::Receiver<InboundMessage>) {
        let mut routes: HashMap<String, flume::Sender<InboundMessage>> = HashMap::new();

        while let Ok(message) = inbound.recv_async().await {
            let route = routes
                .entry(message.conversation_id.clone())
                .or_insert_with(|| {
                    let (tx, rx) = flume::unbounded();
                    let runtime = self.clone();
                    let conversation_id = message.conversation_id.clone();
                    tokio::spawn(async move {
                        runtime.conversation_worker(conversation_id, rx).await;
                    });
                    tx
                });
            if route.send(message).is_err() {
                tracing::error!("conversation worker channel closed unexpectedly");
            }
        }
        tracing::info!("inbound channel closed, dispatcher stopping");
    }

    async fn conversation_worker(&self, conversation_id: String, rx: flume::Receiver<InboundMessage>) {
        tracing::debug!("worker started for conversation {}", conversation_id);
        while let Ok(message) = rx.recv_async().await {
            if let Err(e) = self.handle_message(&message).await {
                tracing::error!(
                    "failed handling message in {}: {:#}",
                    conversation_id,
                    e
                );
            }
        }
    }

    fn is_explicit_mention(&self, text: &str) -> bool {
        text.to_lowercase()
            .contains(&self.config.handle.to_lowercase())
    }

    /// One unit of work: gate on engagement, touch state, run the flow layer,
    /// send any reply back.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<()> {
        let engaged = if self.is_explicit_mention(&message.text) {
            self.tracker
                .update_active_thread(&message.conversation_id, &message.sender_address);
            true
        } else {
            let conversation = self.session.conversation(&message.conversation_id).await?;
            let recent = conversation
                .recent_messages(self.config.engagement_history_limit)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("could not fetch recent messages: {}", e);
                    Vec::new()
                });
            self.tracker
                .is_in_active_thread(
                    &message.conversation_id,
                    &message.sender_address,
                    &message.text,
                    &recent,
                    &self.manager,
                    self.classifier.as_ref(),
                )
                .await?
        };

        if !engaged {
            tracing::trace!(
                "ignoring message from {} in {} (not engaged)",
                message.sender_address,
                message.conversation_id
            );
            return Ok(());
        }

        // Group state tracks the conversation; first reference creates it.
        self.manager
            .add_participant(&message.conversation_id, &message.sender_address, None, None)
            .await?;

        let reply = match self.flow.handle(message, &self.manager).await {
            Ok(reply) => reply,
            Err(e) => {
                // Allocation and resolution problems become short corrective
                // replies; anything else is operational and stays in the logs.
                if let Some(allocation_error) = e.downcast_ref::<AllocationError>() {
                    Some(allocation_error.to_string())
                } else {
                    return Err(e);
                }
            }
        };

        if let Some(reply) = reply {
            let conversation = self.session.conversation(&message.conversation_id).await?;
            conversation.send(&reply).await?;
            self.tracker
                .update_thread_with_agent_message(&message.conversation_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConversationMessage, EngagementVerdict, GroupConversation};
    use crate::store::GroupStateStore;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const ALICE: &str = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";

    struct RecordingConversation {
        id: String,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GroupConversation for RecordingConversation {
        fn id(&self) -> &str {
            &self.id
        }

        async fn members(&self) -> Result<Vec<String>> {
            Ok(vec![ALICE.to_string()])
        }

        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().expect("sent lock").push(text.to_string());
            Ok(())
        }

        async fn recent_messages(&self, _limit: usize) -> Result<Vec<ConversationMessage>> {
            Ok(Vec::new())
        }
    }

    struct StubSession {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessagingSession for StubSession {
        fn agent_address(&self) -> &str {
            "0xagent"
        }

        async fn list_conversations(&self, _limit: Option<usize>) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn conversation(&self, id: &str) -> Result<Box<dyn GroupConversation>> {
            Ok(Box::new(RecordingConversation {
                id: id.to_string(),
                sent: self.sent.clone(),
            }))
        }
    }

    struct NeverEngagedClassifier;

    #[async_trait]
    impl EngagementClassifier for NeverEngagedClassifier {
        async fn classify(
            &self,
            _message_text: &str,
            _recent_messages: &[ConversationMessage],
        ) -> Result<EngagementVerdict> {
            Ok(EngagementVerdict::Disengaged)
        }
    }

    struct EchoFlow {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl FlowHandler for EchoFlow {
        async fn handle(
            &self,
            message: &InboundMessage,
            _manager: &GroupStateManager,
        ) -> Result<Option<String>> {
            // Yield so a racing out-of-order worker would be exposed.
            tokio::task::yield_now().await;
            self.seen.lock().expect("seen lock").push(message.text.clone());
            Ok(Some(format!("echo: {}", message.text)))
        }
    }

    struct FailingFlow;

    #[async_trait]
    impl FlowHandler for FailingFlow {
        async fn handle(
            &self,
            _message: &InboundMessage,
            _manager: &GroupStateManager,
        ) -> Result<Option<String>> {
            Err(AllocationError::PercentTotal { total_percent: 90.0 }.into())
        }
    }

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("splitlaunch_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn runtime(
        path: &PathBuf,
        flow: Arc<dyn FlowHandler>,
        sent: Arc<Mutex<Vec<String>>>,
    ) -> Arc<AgentRuntime> {
        let config = AgentConfig::default();
        let store = Arc::new(GroupStateStore::new(path).expect("store init"));
        let manager = Arc::new(GroupStateManager::new(store));
        let tracker = Arc::new(ThreadEngagementTracker::new(
            config.thread_timeout(),
            config.response_gap(),
        ));
        Arc::new(AgentRuntime::new(
            config,
            manager,
            tracker,
            Arc::new(NeverEngagedClassifier),
            Arc::new(StubSession { sent }),
            flow,
        ))
    }

    fn mention(text: &str) -> InboundMessage {
        InboundMessage {
            conversation_id: "conv-1".to_string(),
            sender_address: ALICE.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mention_is_handled_and_replied_to() {
        let path = temp_db_path("mention");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&path, Arc::new(EchoFlow { seen: seen.clone() }), sent.clone());

        rt.handle_message(&mention("@splitlaunch launch us a coin"))
            .await
            .expect("handle");

        assert_eq!(sent.lock().expect("sent")[0], "echo: @splitlaunch launch us a coin");
        // The sender is now a tracked participant of the group.
        let state = rt
            .manager()
            .get_group_state("conv-1")
            .await
            .expect("get")
            .expect("exists");
        assert!(state.participants.contains_key(ALICE));
        // And the thread window is open.
        assert_eq!(rt.tracker().active_thread_count(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unaddressed_message_outside_thread_is_ignored() {
        let path = temp_db_path("ignored");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&path, Arc::new(EchoFlow { seen: seen.clone() }), sent.clone());

        rt.handle_message(&mention("just chatting with friends"))
            .await
            .expect("handle");

        assert!(sent.lock().expect("sent").is_empty());
        assert!(seen.lock().expect("seen").is_empty());
        assert!(rt
            .manager()
            .get_group_state("conv-1")
            .await
            .expect("get")
            .is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn allocation_errors_become_corrective_replies() {
        let path = temp_db_path("corrective");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&path, Arc::new(FailingFlow), sent.clone());

        rt.handle_message(&mention("@splitlaunch split 60/30"))
            .await
            .expect("handle");

        let sent = sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("add up to 100%"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn same_conversation_messages_are_processed_in_order() {
        let path = temp_db_path("ordering");
        let sent = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(&path, Arc::new(EchoFlow { seen: seen.clone() }), sent.clone());

        let (tx, rx) = flume::unbounded();
        let dispatcher = tokio::spawn(rt.clone().run(rx));

        for i in 0..5 {
            tx.send(mention(&format!("@splitlaunch step {i}")))
                .expect("send");
        }
        drop(tx);
        dispatcher.await.expect("dispatcher");

        // Give the conversation worker a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let seen = seen.lock().expect("seen");
        let expected: Vec<String> = (0..5).map(|i| format!("@splitlaunch step {i}")).collect();
        assert_eq!(*seen, expected);

        let _ = std::fs::remove_file(&path);
    }
}
