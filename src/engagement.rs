//! Time-windowed registry of conversations the agent is currently engaged in.
//!
//! Once the agent has been addressed in a group, replies from the same
//! participants keep flowing to it for a bounded window without re-mentioning
//! the agent. The registry is a soft, self-healing cache: record-level
//! replacement, lost updates tolerated (worst case one extra re-mention), and
//! deterministic expiry. Owned and injected explicitly so tests can build
//! isolated instances and drive the clock through the `*_at` variants.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::groups::GroupStateManager;
use crate::network::{ConversationMessage, EngagementClassifier, EngagementVerdict};

#[derive(Debug, Clone)]
struct ThreadRecord {
    last_agent_activity: DateTime<Utc>,
    participating_addresses: HashSet<String>,
    thread_started_at: DateTime<Utc>,
}

pub struct ThreadEngagementTracker {
    records: Mutex<HashMap<String, ThreadRecord>>,
    /// Engagement lapses when the agent has been quiet this long.
    thread_timeout: Duration,
    /// A message this soon after the agent's last reply counts as a response
    /// to it (together with the authorship-majority check).
    response_gap: Duration,
}

impl ThreadEngagementTracker {
    pub fn new(thread_timeout: Duration, response_gap: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            thread_timeout,
            response_gap,
        }
    }

    fn normalize(address: &str) -> String {
        address.trim().to_ascii_lowercase()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ThreadRecord>> {
        // A poisoned registry only loses soft cache state; recover it.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register engagement after the agent was explicitly addressed.
    pub fn update_active_thread(&self, conversation_id: &str, address: &str) {
        self.update_active_thread_at(conversation_id, address, Utc::now());
    }

    pub fn update_active_thread_at(
        &self,
        conversation_id: &str,
        address: &str,
        now: DateTime<Utc>,
    ) {
        let mut records = self.lock();
        let record = records
            .entry(conversation_id.to_string())
            .or_insert_with(|| ThreadRecord {
                last_agent_activity: now,
                participating_addresses: HashSet::new(),
                thread_started_at: now,
            });
        record
            .participating_addresses
            .insert(Self::normalize(address));
    }

    /// Refresh the window every time the agent sends a reply into the
    /// conversation.
    pub fn update_thread_with_agent_message(&self, conversation_id: &str) {
        self.update_thread_with_agent_message_at(conversation_id, Utc::now());
    }

    pub fn update_thread_with_agent_message_at(&self, conversation_id: &str, now: DateTime<Utc>) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(conversation_id) {
            record.last_agent_activity = now;
        }
    }

    /// Should a message from `sender_address` keep being processed as part of
    /// an ongoing engagement?
    pub async fn is_in_active_thread(
        &self,
        conversation_id: &str,
        sender_address: &str,
        message_text: &str,
        recent_messages: &[ConversationMessage],
        manager: &GroupStateManager,
        classifier: &dyn EngagementClassifier,
    ) -> Result<bool> {
        self.is_in_active_thread_at(
            conversation_id,
            sender_address,
            message_text,
            recent_messages,
            manager,
            classifier,
            Utc::now(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn is_in_active_thread_at(
        &self,
        conversation_id: &str,
        sender_address: &str,
        message_text: &str,
        recent_messages: &[ConversationMessage],
        manager: &GroupStateManager,
        classifier: &dyn EngagementClassifier,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sender = Self::normalize(sender_address);

        // Registry checks under the lock; everything async happens after the
        // guard is dropped.
        let last_agent_activity = {
            let mut records = self.lock();
            let Some(record) = records.get(conversation_id) else {
                return Ok(false);
            };
            if now - record.last_agent_activity > self.thread_timeout {
                records.remove(conversation_id);
                tracing::debug!("thread {} expired, evicting", conversation_id);
                return Ok(false);
            }
            if !record.participating_addresses.contains(&sender) {
                return Ok(false);
            }
            record.last_agent_activity
        };

        // A participant mid-flow always stays engaged; a half-finished coin
        // launch must not stall because the wording drifted off topic.
        if manager.has_active_flow(&sender).await? {
            self.update_active_thread_at(conversation_id, &sender, now);
            return Ok(true);
        }

        let responding = self.is_response_to_agent(last_agent_activity, recent_messages, now);

        match classifier.classify(message_text, recent_messages).await {
            Ok(EngagementVerdict::Engaged) => Ok(true),
            Ok(EngagementVerdict::Disengaged) => {
                if responding {
                    return Ok(true);
                }
                let mut records = self.lock();
                if let Some(record) = records.get_mut(conversation_id) {
                    record.participating_addresses.remove(&sender);
                }
                tracing::debug!(
                    "{} disengaged from thread {}",
                    sender,
                    conversation_id
                );
                Ok(false)
            }
            Err(e) => {
                // Degrade to the temporal heuristic; do not drop the sender
                // over a classifier outage.
                tracing::warn!("engagement classifier failed: {}", e);
                Ok(responding)
            }
        }
    }

    /// Temporal "response" heuristic: the gap since the agent's last reply is
    /// short and the messages since then are mostly not the agent's own.
    fn is_response_to_agent(
        &self,
        last_agent_activity: DateTime<Utc>,
        recent_messages: &[ConversationMessage],
        now: DateTime<Utc>,
    ) -> bool {
        if now - last_agent_activity >= self.response_gap {
            return false;
        }
        let since: Vec<&ConversationMessage> = recent_messages
            .iter()
            .filter(|m| m.sent_at > last_agent_activity)
            .collect();
        if since.is_empty() {
            return false;
        }
        let non_agent = since.iter().filter(|m| !m.from_agent).count();
        non_agent * 2 > since.len()
    }

    /// Sweep every record past the timeout window. Called opportunistically,
    /// not from a timer.
    pub fn clear_inactive_threads(&self) -> usize {
        self.clear_inactive_threads_at(Utc::now())
    }

    pub fn clear_inactive_threads_at(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| now - record.last_agent_activity <= self.thread_timeout);
        let evicted = before - records.len();
        if evicted > 0 {
            tracing::debug!("evicted {} inactive thread(s)", evicted);
        }
        evicted
    }

    /// Live thread count, after an expiry sweep.
    pub fn active_thread_count(&self) -> usize {
        self.clear_inactive_threads();
        self.lock().len()
    }

    /// Age of a thread since first engagement, when one exists.
    pub fn thread_age(&self, conversation_id: &str) -> Option<Duration> {
        let records = self.lock();
        records
            .get(conversation_id)
            .map(|record| Utc::now() - record.thread_started_at)
    }
}
