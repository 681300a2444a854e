use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Authoritative record for one group conversation: who is in it, which
/// fee-split managers have been deployed for it, and which coins it launched.
///
/// Created the first time any participant or manager event references its
/// `group_id`; only removed by an explicit admin delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChatState {
    pub group_id: String,
    #[serde(default)]
    pub metadata: GroupMetadata,
    /// Keyed by normalized participant address.
    #[serde(default)]
    pub participants: HashMap<String, GroupParticipant>,
    /// Insertion order is deployment order.
    #[serde(default)]
    pub managers: Vec<GroupManager>,
    #[serde(default)]
    pub coins: Vec<GroupCoin>,
}

impl GroupChatState {
    pub fn new(group_id: &str, metadata: Option<GroupMetadata>) -> Self {
        Self {
            group_id: group_id.to_string(),
            metadata: metadata.unwrap_or_default(),
            participants: HashMap::new(),
            managers: Vec::new(),
            coins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    New,
    Onboarding,
    Active,
    Invited,
    Inactive,
}

impl ParticipantStatus {
    /// Ranking used when folding one user's status across several groups.
    /// Higher wins regardless of which group was scanned first.
    pub fn priority(self) -> u8 {
        match self {
            ParticipantStatus::Active => 4,
            ParticipantStatus::Onboarding => 3,
            ParticipantStatus::Invited => 2,
            ParticipantStatus::New => 1,
            ParticipantStatus::Inactive => 0,
        }
    }
}

impl Default for ParticipantStatus {
    fn default() -> Self {
        ParticipantStatus::New
    }
}

/// One member of one group. Progress fields mark unfinished multi-step flows;
/// they are cleared explicitly on completion or cancellation, never replaced
/// as a side effect of some other update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub address: String,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ParticipantStatus,
    #[serde(default)]
    pub preferences: LaunchPreferences,
    #[serde(default)]
    pub coin_launch_progress: Option<CoinLaunchProgress>,
    #[serde(default)]
    pub onboarding_progress: Option<OnboardingProgress>,
    #[serde(default)]
    pub management_progress: Option<ManagementProgress>,
    #[serde(default)]
    pub pending_transaction: Option<PendingTransaction>,
}

impl GroupParticipant {
    pub fn new(address: &str, status: ParticipantStatus, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            joined_at: now,
            last_active_at: now,
            status,
            preferences: LaunchPreferences::default(),
            coin_launch_progress: None,
            onboarding_progress: None,
            management_progress: None,
            pending_transaction: None,
        }
    }

    /// True when any of the four in-flight markers is set.
    pub fn has_active_flow(&self) -> bool {
        self.coin_launch_progress.is_some()
            || self.onboarding_progress.is_some()
            || self.management_progress.is_some()
            || self.pending_transaction.is_some()
    }
}

/// Default launch parameters a participant has expressed in past flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchPreferences {
    #[serde(default)]
    pub default_chain_id: Option<u64>,
    #[serde(default)]
    pub default_initial_buy_eth: Option<f64>,
    #[serde(default)]
    pub notify_on_trades: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinLaunchProgress {
    pub step: String,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingProgress {
    pub step: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementProgress {
    pub step: String,
    /// Manager contract being modified, when known.
    #[serde(default)]
    pub manager_address: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A constructed transaction waiting on the participant's signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub tx_kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One fee receiver inside a deployed manager. `percentage` is the explicit
/// human-entered share if one was given; equal-split receivers carry None.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeReceiver {
    pub username: String,
    pub resolved_address: String,
    #[serde(default)]
    pub percentage: Option<f64>,
}

/// A deployed fee-split contract. `live_data` is advisory analytics sourced
/// externally; allocation correctness never reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManager {
    pub contract_address: String,
    pub deployed_at: DateTime<Utc>,
    pub tx_hash: String,
    pub deployed_by: String,
    pub chain_id: u64,
    pub receivers: Vec<FeeReceiver>,
    #[serde(default)]
    pub live_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCoin {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub image: String,
    pub contract_address: String,
    pub tx_hash: String,
    pub launched_at: DateTime<Utc>,
    pub launched_by: String,
    pub chain_id: u64,
    /// The fee-split manager receiving this coin's trading fees.
    pub manager_address: String,
    #[serde(default)]
    pub live_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    CoinLaunch,
    Onboarding,
    Management,
    PendingTransaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFlow {
    pub group_id: String,
    pub kind: FlowKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: String,
    pub group_name: String,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
}

/// Cross-group view of a single address, folded by the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedUserData {
    pub address: String,
    /// Highest-priority status across all memberships.
    pub status: ParticipantStatus,
    /// Preferences from the group where the user was most recently active.
    pub preferences: LaunchPreferences,
    pub memberships: Vec<GroupMembership>,
    pub coins: Vec<GroupCoin>,
    pub active_flows: Vec<ActiveFlow>,
}
