//! splitlaunch: coordination core for a group-chat agent that lets members of
//! a conversation launch a tradeable coin together and split its trading fees.
//!
//! The crate covers the parts that carry real invariants:
//! - [`allocation`]: sum-exact fee-split share tables (10_000_000 units = 100%)
//! - [`store`] / [`groups`]: durable per-group state and its orchestration
//! - [`engagement`]: the time-windowed "keep talking to me" registry
//! - [`bootstrap`]: messaging-network connection with timeouts, retries and
//!   installation-limit recovery
//!
//! Everything conversational (intent classification, reply generation,
//! transaction construction) lives behind the narrow traits in [`network`]
//! and [`runtime::FlowHandler`].

pub mod allocation;
pub mod bootstrap;
pub mod config;
pub mod engagement;
pub mod groups;
pub mod llm;
pub mod network;
pub mod runtime;
pub mod store;
pub mod types;
