//! Campaign Store
//!
//! Persistence contract for campaigns and their recipients:
//! - atomic create of a campaign with its ordered recipient set
//! - lease-based dispatch lock (acquire / renew / release) so that exactly
//!   one worker drives a campaign at a time, with expiry-based takeover
//! - optimistic recipient updates that are rejected once the lease is lost
//! - progress counts derived from per-recipient truth
//!
//! Two implementations: SQLite (production) and in-memory (tests, dev mode).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use zc_common::{Campaign, CampaignProgress, CampaignRecipient, CampaignStatus};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCampaignStore, MemoryMessageStore};
pub use sqlite::{SqliteCampaignStore, SqliteMessageStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Recipient not found: campaign {campaign_id}, group {group_handle}")]
    RecipientNotFound {
        campaign_id: String,
        group_handle: String,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Campaign {0} has no recipients")]
    NoRecipients(String),

    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("Dispatch lock for campaign {0} is no longer held")]
    LockLost(String),

    #[error("Campaign {0} is running and cannot be deleted")]
    CampaignRunning(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract consumed by the scheduler and dispatcher.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Create a campaign together with its ordered recipient set, atomically.
    ///
    /// A scheduled campaign must carry a future `scheduled_at`.
    async fn create_campaign(
        &self,
        campaign: &Campaign,
        recipients: &[CampaignRecipient],
    ) -> Result<()>;

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;

    /// Campaigns in `status` that are actionable at `before`:
    /// - `Scheduled`: the schedule time has been reached
    /// - `Running`: no live lock (fresh immediate start, or an expired lease
    ///   left behind by a crashed worker)
    async fn list_eligible(
        &self,
        status: CampaignStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Campaign>>;

    /// Compare-and-set acquisition of the dispatch lock.
    ///
    /// Succeeds only when no live lease exists and the campaign is not
    /// terminal. Returns false on contention; that is not an error.
    async fn try_acquire_lock(
        &self,
        campaign_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool>;

    /// Extend the lease. Returns false when the lease was already lost.
    async fn renew_lock(&self, campaign_id: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Release the lock if still held by `owner`. Releasing a lost lock is a no-op.
    async fn release_lock(&self, campaign_id: &str, owner: &str) -> Result<()>;

    /// Transition the campaign status, validating against the state machine.
    ///
    /// Sets `started_at` on the first move to Running and `completed_at` on
    /// Completed. Re-asserting the current status is a no-op. Leaving Draft
    /// requires a non-empty recipient set.
    async fn update_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<Campaign>;

    /// All recipients of a campaign in insertion order.
    async fn list_recipients(&self, campaign_id: &str) -> Result<Vec<CampaignRecipient>>;

    /// Persist a recipient, guarded by the dispatch lock.
    ///
    /// The write is rejected with `LockLost` when `owner` no longer holds a
    /// live lease, so two workers can never both believe they own the same
    /// recipient. Also refreshes the campaign's processed count.
    async fn update_recipient(&self, recipient: &CampaignRecipient, owner: &str) -> Result<()>;

    /// Reset recipients stranded in `sending` back to `pending`.
    ///
    /// Called by a takeover before dispatching: an attempt with an unknown
    /// outcome is retried rather than silently dropped. Returns the number
    /// of recipients reset.
    async fn reset_stranded_recipients(&self, campaign_id: &str) -> Result<u32>;

    /// Delivery counts reflecting last-persisted truth.
    async fn get_progress(&self, campaign_id: &str) -> Result<CampaignProgress>;

    /// Delete a campaign and its recipients. Refused while the campaign is running.
    async fn delete_campaign(&self, campaign_id: &str) -> Result<()>;
}

/// Read path of the external message-content store.
///
/// Campaigns reference content by id; the dispatcher resolves the text once
/// per run. Content CRUD belongs to the admin layer and is not modelled here.
#[async_trait]
pub trait MessageContentStore: Send + Sync {
    async fn get_message_text(&self, message_ref: &str) -> Result<Option<String>>;
}
