//! Group state orchestration: participant lifecycle, manager/coin
//! registration, and cross-group aggregation for a single user.
//!
//! Every mutation is a read-modify-write of the whole group record, so the
//! manager serializes writers per group id behind a keyed async mutex. Two
//! concurrent updates to the same participant queue instead of clobbering
//! each other; updates to different groups still run fully in parallel.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::GroupStateStore;
use crate::types::{
    ActiveFlow, AggregatedUserData, FlowKind, GroupChatState, GroupCoin, GroupManager,
    GroupMembership, GroupMetadata, GroupParticipant, LaunchPreferences, ParticipantStatus,
    PendingTransaction,
};
use crate::types::{CoinLaunchProgress, ManagementProgress, OnboardingProgress};

/// Partial participant update. `None` fields are left untouched; progress
/// fields can only be set here, clearing goes through
/// [`GroupStateManager::clear_participant_progress`] so a flow is never
/// wiped out as a side effect.
#[derive(Debug, Default, Clone)]
pub struct ParticipantUpdate {
    pub status: Option<ParticipantStatus>,
    pub preferences: Option<LaunchPreferences>,
    pub coin_launch_progress: Option<CoinLaunchProgress>,
    pub onboarding_progress: Option<OnboardingProgress>,
    pub management_progress: Option<ManagementProgress>,
    pub pending_transaction: Option<PendingTransaction>,
}

#[derive(Debug, Clone)]
pub struct ParticipantBatchUpdate {
    pub group_id: String,
    pub address: String,
    pub update: ParticipantUpdate,
}

/// Result of a fire-all/await-all batch. Failures are collected, never
/// rolled back, and never abort sibling updates.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failures: Vec<(String, String, String)>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct GroupStateManager {
    store: Arc<GroupStateStore>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn normalize_key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl GroupStateManager {
    pub fn new(store: Arc<GroupStateStore>) -> Self {
        Self {
            store,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Single-writer lock for one group id. Lock entries are tiny and live
    /// for the process lifetime; groups number in the hundreds, not millions.
    async fn group_lock(&self, group_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_group_state(&self, group_id: &str) -> Result<Option<GroupChatState>> {
        self.store.get(group_id)
    }

    /// Create-if-absent, atomically per group: calling this twice returns the
    /// already-initialized state instead of overwriting it.
    pub async fn initialize_group(
        &self,
        group_id: &str,
        first_participant: &str,
        metadata: Option<GroupMetadata>,
    ) -> Result<GroupChatState> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.get(group_id)? {
            tracing::debug!("group {} already initialized", group_id);
            return Ok(existing);
        }

        let mut state = GroupChatState::new(group_id, metadata);
        let key = normalize_key(first_participant);
        state.participants.insert(
            key.clone(),
            GroupParticipant::new(&key, ParticipantStatus::New, Utc::now()),
        );
        self.store
            .put(&state)
            .with_context(|| format!("failed to initialize group {}", group_id))?;
        tracing::info!("initialized group {} with participant {}", group_id, key);
        Ok(state)
    }

    /// Add a participant, creating the group on first reference. Calling this
    /// for an existing participant only refreshes `last_active_at`; status,
    /// preferences and any in-flight progress are left alone.
    pub async fn add_participant(
        &self,
        group_id: &str,
        address: &str,
        status: Option<ParticipantStatus>,
        preferences: Option<LaunchPreferences>,
    ) -> Result<GroupParticipant> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let key = normalize_key(address);
        let mut state = match self.store.get(group_id)? {
            Some(state) => state,
            None => GroupChatState::new(group_id, None),
        };

        let now = Utc::now();
        let participant = match state.participants.get_mut(&key) {
            Some(existing) => {
                existing.last_active_at = now;
                existing.clone()
            }
            None => {
                let mut participant =
                    GroupParticipant::new(&key, status.unwrap_or_default(), now);
                if let Some(preferences) = preferences {
                    participant.preferences = preferences;
                }
                state.participants.insert(key.clone(), participant.clone());
                tracing::debug!("added participant {} to group {}", key, group_id);
                participant
            }
        };

        self.store.put(&state)?;
        Ok(participant)
    }

    /// Merge a partial update into a participant record, creating the
    /// participant (and group) when absent. Always refreshes `last_active_at`.
    pub async fn update_participant_state(
        &self,
        group_id: &str,
        address: &str,
        update: ParticipantUpdate,
    ) -> Result<GroupParticipant> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let key = normalize_key(address);
        let mut state = match self.store.get(group_id)? {
            Some(state) => state,
            None => GroupChatState::new(group_id, None),
        };

        let now = Utc::now();
        let participant = state
            .participants
            .entry(key.clone())
            .or_insert_with(|| GroupParticipant::new(&key, ParticipantStatus::New, now));

        participant.last_active_at = now;
        if let Some(status) = update.status {
            participant.status = status;
        }
        if let Some(preferences) = update.preferences {
            participant.preferences = preferences;
        }
        if let Some(progress) = update.coin_launch_progress {
            participant.coin_launch_progress = Some(progress);
        }
        if let Some(progress) = update.onboarding_progress {
            participant.onboarding_progress = Some(progress);
        }
        if let Some(progress) = update.management_progress {
            participant.management_progress = Some(progress);
        }
        if let Some(tx) = update.pending_transaction {
            participant.pending_transaction = Some(tx);
        }

        let updated = participant.clone();
        self.store.put(&state)?;
        Ok(updated)
    }

    /// Clear all four in-flight markers in one write, for flow completion or
    /// cancellation.
    pub async fn clear_participant_progress(&self, group_id: &str, address: &str) -> Result<()> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let key = normalize_key(address);
        let mut state = match self.store.get(group_id)? {
            Some(state) => state,
            None => return Ok(()),
        };
        let Some(participant) = state.participants.get_mut(&key) else {
            return Ok(());
        };
        participant.coin_launch_progress = None;
        participant.onboarding_progress = None;
        participant.management_progress = None;
        participant.pending_transaction = None;
        participant.last_active_at = Utc::now();
        self.store.put(&state)?;
        tracing::debug!("cleared progress for {} in group {}", key, group_id);
        Ok(())
    }

    pub async fn add_manager(&self, group_id: &str, manager: GroupManager) -> Result<()> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let mut state = match self.store.get(group_id)? {
            Some(state) => state,
            None => GroupChatState::new(group_id, None),
        };
        tracing::info!(
            "registering manager {} for group {} ({} receivers)",
            manager.contract_address,
            group_id,
            manager.receivers.len()
        );
        state.managers.push(manager);
        self.store.put(&state)
    }

    pub async fn add_coin(&self, group_id: &str, coin: GroupCoin) -> Result<()> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let mut state = match self.store.get(group_id)? {
            Some(state) => state,
            None => GroupChatState::new(group_id, None),
        };
        tracing::info!(
            "registering coin {} ({}) for group {}",
            coin.ticker,
            coin.contract_address,
            group_id
        );
        state.coins.push(coin);
        self.store.put(&state)
    }

    /// Fold everything known about one address across all groups. Status is
    /// the maximum by priority over the full membership set, so the answer
    /// does not depend on which group happens to be scanned first.
    pub async fn get_aggregated_user_data(&self, address: &str) -> Result<AggregatedUserData> {
        let key = normalize_key(address);
        let mut memberships = Vec::new();
        let mut coins = Vec::new();
        let mut active_flows = Vec::new();
        let mut status = ParticipantStatus::Inactive;
        let mut preferences: Option<(chrono::DateTime<Utc>, LaunchPreferences)> = None;

        for state in self.store.all()? {
            let Some(participant) = state.participants.get(&key) else {
                continue;
            };

            memberships.push(GroupMembership {
                group_id: state.group_id.clone(),
                group_name: state.metadata.name.clone(),
                status: participant.status,
                joined_at: participant.joined_at,
            });
            coins.extend(state.coins.iter().cloned());

            if participant.status.priority() > status.priority() {
                status = participant.status;
            }
            // Most-recently-active group's preferences win.
            let newer = preferences
                .as_ref()
                .map(|(seen, _)| participant.last_active_at > *seen)
                .unwrap_or(true);
            if newer {
                preferences = Some((participant.last_active_at, participant.preferences.clone()));
            }

            if participant.coin_launch_progress.is_some() {
                active_flows.push(ActiveFlow {
                    group_id: state.group_id.clone(),
                    kind: FlowKind::CoinLaunch,
                });
            }
            if participant.onboarding_progress.is_some() {
                active_flows.push(ActiveFlow {
                    group_id: state.group_id.clone(),
                    kind: FlowKind::Onboarding,
                });
            }
            if participant.management_progress.is_some() {
                active_flows.push(ActiveFlow {
                    group_id: state.group_id.clone(),
                    kind: FlowKind::Management,
                });
            }
            if participant.pending_transaction.is_some() {
                active_flows.push(ActiveFlow {
                    group_id: state.group_id.clone(),
                    kind: FlowKind::PendingTransaction,
                });
            }
        }

        Ok(AggregatedUserData {
            address: key,
            status,
            preferences: preferences.map(|(_, p)| p).unwrap_or_default(),
            memberships,
            coins,
            active_flows,
        })
    }

    /// Cheap check used by the engagement tracker: does this address have any
    /// unfinished flow anywhere?
    pub async fn has_active_flow(&self, address: &str) -> Result<bool> {
        let key = normalize_key(address);
        for state in self.store.all()? {
            if let Some(participant) = state.participants.get(&key) {
                if participant.has_active_flow() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Apply all updates concurrently and wait for every one of them.
    /// Per-group locks keep same-group updates ordered; there is no rollback
    /// when some fail.
    pub async fn batch_update_participants(
        &self,
        updates: Vec<ParticipantBatchUpdate>,
    ) -> BatchOutcome {
        let futures = updates.into_iter().map(|item| async move {
            let result = self
                .update_participant_state(&item.group_id, &item.address, item.update)
                .await;
            (item.group_id, item.address, result)
        });

        let mut outcome = BatchOutcome::default();
        for (group_id, address, result) in join_all(futures).await {
            match result {
                Ok(_) => outcome.applied += 1,
                Err(e) => {
                    tracing::warn!(
                        "batch update failed for {} in group {}: {}",
                        address,
                        group_id,
                        e
                    );
                    outcome.failures.push((group_id, address, e.to_string()));
                }
            }
        }
        outcome
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<bool> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;
        self.store.delete(group_id)
    }

    /// Liveness probe: a full-store read, reported as data instead of an
    /// error so callers can ship it to whatever is watching.
    pub async fn health_check(&self) -> HealthReport {
        match self.store.all() {
            Ok(states) => {
                tracing::debug!("health check passed ({} groups)", states.len());
                HealthReport {
                    healthy: true,
                    error: None,
                }
            }
            Err(e) => HealthReport {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}
