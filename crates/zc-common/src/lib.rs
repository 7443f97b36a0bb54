use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Campaign Types
// ============================================================================

/// How a campaign is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Eligible as soon as the admin activates it
    Immediate,
    /// Eligible once `scheduled_at` has passed
    Scheduled,
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Immediate
    }
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Immediate => "immediate",
            DispatchMode::Scheduled => "scheduled",
        }
    }

    /// Parse from string, defaulting to Immediate for unknown values
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "scheduled" => DispatchMode::Scheduled,
            _ => DispatchMode::Immediate,
        }
    }
}

/// Campaign lifecycle states.
///
/// Transitions are monotone except for the explicit pause/resume cycle and
/// the cancel escape:
///
/// ```text
/// draft -> scheduled | running
/// scheduled -> running
/// running <-> paused
/// running -> completed
/// {draft, scheduled, running, paused} -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from string, defaulting to Draft for unknown values
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "scheduled" => CampaignStatus::Scheduled,
            "running" => CampaignStatus::Running,
            "paused" => CampaignStatus::Paused,
            "completed" => CampaignStatus::Completed,
            "cancelled" => CampaignStatus::Cancelled,
            _ => CampaignStatus::Draft,
        }
    }

    /// Terminal states accept no further transitions or recipient work
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (Draft, Scheduled) | (Draft, Running) => true,
            (Scheduled, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) => true,
            (Draft, Cancelled) | (Scheduled, Cancelled) | (Running, Cancelled) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message scheduled for broadcast to a set of recipient groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    /// Admin-facing label
    pub name: String,
    /// Identifier of the content to send, owned by the message store
    pub message_ref: String,
    /// Minimum spacing in seconds between consecutive sends within this campaign
    pub interval_seconds: u32,
    pub dispatch_mode: DispatchMode,
    /// Required iff `dispatch_mode` is Scheduled
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub total_recipients: u32,
    /// Recipients that have reached a terminal state (sent + failed)
    pub processed_recipients: u32,
    /// Worker currently holding the dispatch lock
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(
        name: impl Into<String>,
        message_ref: impl Into<String>,
        interval_seconds: u32,
        dispatch_mode: DispatchMode,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            message_ref: message_ref.into(),
            interval_seconds,
            dispatch_mode,
            scheduled_at,
            status: CampaignStatus::Draft,
            total_recipients: 0,
            processed_recipients: 0,
            lock_owner: None,
            lock_expires_at: None,
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the dispatch lock is currently held by a live lease
    pub fn lock_is_live(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }
}

// ============================================================================
// Recipient Types
// ============================================================================

/// Per-recipient delivery states.
///
/// `pending -> sending -> {sent | failed}` with failures cycling back to
/// `pending` until the attempts budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sending => "sending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }

    /// Parse from string, defaulting to Pending for unknown values
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "sending" => RecipientStatus::Sending,
            "sent" => RecipientStatus::Sent,
            "failed" => RecipientStatus::Failed,
            _ => RecipientStatus::Pending,
        }
    }

    /// Sent and failed recipients are never revisited
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecipientStatus::Sent | RecipientStatus::Failed)
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One group-message pairing within a campaign, tracked independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub campaign_id: String,
    /// Opaque external group identifier from the group registry
    pub group_handle: String,
    /// Insertion order; defines dispatch order
    pub position: u32,
    pub status: RecipientStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Timestamp of confirmed acceptance by the gateway
    pub sent_at: Option<DateTime<Utc>>,
}

impl CampaignRecipient {
    pub fn new(campaign_id: impl Into<String>, group_handle: impl Into<String>, position: u32) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            group_handle: group_handle.into(),
            position,
            status: RecipientStatus::Pending,
            attempts: 0,
            last_error: None,
            sent_at: None,
        }
    }
}

// ============================================================================
// Gateway Outcome
// ============================================================================

/// Tagged result of a gateway send attempt.
///
/// The dispatcher's retry logic is a pure function of recipient state and
/// this tag; rejections and transient errors share the same attempts budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The gateway accepted the message for delivery
    Accepted,
    /// The gateway refused the message (bad handle, blocked number, ...)
    Rejected(String),
    /// Timeout, connection failure or 5xx; worth another attempt
    TransientError(String),
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted)
    }

    /// Failure reason for persisting as `last_error`
    pub fn error_message(&self) -> Option<&str> {
        match self {
            SendOutcome::Accepted => None,
            SendOutcome::Rejected(reason) | SendOutcome::TransientError(reason) => Some(reason),
        }
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Per-campaign delivery counts, always reflecting last-persisted truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub sent: u32,
    pub failed: u32,
    pub pending: u32,
    pub sending: u32,
    pub total: u32,
}

impl CampaignProgress {
    /// Recipients that have reached a terminal state
    pub fn processed(&self) -> u32 {
        self.sent + self.failed
    }

    /// All recipients terminal; the campaign can complete
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.processed() == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Draft.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Scheduled.can_transition_to(Paused));
        assert!(!Draft.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Running,
            CampaignStatus::Paused,
            CampaignStatus::Completed,
            CampaignStatus::Cancelled,
        ] {
            assert_eq!(CampaignStatus::from_str_lossy(status.as_str()), status);
        }
    }

    #[test]
    fn test_recipient_terminal() {
        assert!(RecipientStatus::Sent.is_terminal());
        assert!(RecipientStatus::Failed.is_terminal());
        assert!(!RecipientStatus::Pending.is_terminal());
        assert!(!RecipientStatus::Sending.is_terminal());
    }

    #[test]
    fn test_progress_complete() {
        let progress = CampaignProgress { sent: 2, failed: 1, pending: 0, sending: 0, total: 3 };
        assert_eq!(progress.processed(), 3);
        assert!(progress.is_complete());

        let partial = CampaignProgress { sent: 1, failed: 0, pending: 2, sending: 0, total: 3 };
        assert!(!partial.is_complete());
    }

    #[test]
    fn test_lock_liveness() {
        let mut campaign = Campaign::new("promo", "msg-1", 0, DispatchMode::Immediate, None);
        let now = Utc::now();
        assert!(!campaign.lock_is_live(now));

        campaign.lock_owner = Some("worker-a".to_string());
        campaign.lock_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(campaign.lock_is_live(now));

        campaign.lock_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!campaign.lock_is_live(now));
    }
}
