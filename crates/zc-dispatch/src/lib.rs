//! Campaign Dispatch Engine
//!
//! Drives campaigns from eligibility to completion:
//! - `CampaignScheduler` ticks at a fixed cadence, finds due scheduled
//!   campaigns and running campaigns without a live lock (immediate starts,
//!   resumes and crash takeovers all land here), acquires the dispatch lock
//!   and spawns one dispatcher per campaign
//! - `CampaignDispatcher` walks the recipient list in insertion order,
//!   spacing sends through the `SendGate` and persisting every state change
//!   before and after each gateway call
//! - `EngineHandle` is the admin control surface; pause/cancel signals reach
//!   an in-flight dispatcher through per-campaign watch channels

use thiserror::Error;

pub mod control;
pub mod dispatcher;
pub mod engine;
pub mod gate;
pub mod scheduler;

pub use control::{ControlRegistry, ControlSignal};
pub use dispatcher::{CampaignDispatcher, DispatcherConfig};
pub use engine::EngineHandle;
pub use gate::SendGate;
pub use scheduler::{CampaignScheduler, SchedulerConfig};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] zc_store::StoreError),

    #[error("Slot wait cancelled by control signal")]
    SlotWaitCancelled,

    #[error("Message content not found: {0}")]
    MessageNotFound(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
