//! In-Memory Campaign Store
//!
//! Mirrors the SQLite semantics (CAS lock, lease expiry, guarded recipient
//! writes) without a database. Used by dev mode and by dispatcher tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use zc_common::{
    Campaign, CampaignProgress, CampaignRecipient, CampaignStatus, DispatchMode, RecipientStatus,
};

use crate::{CampaignStore, MessageContentStore, Result, StoreError};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<String, Campaign>,
    // keyed by campaign id, kept in position order
    recipients: HashMap<String, Vec<CampaignRecipient>>,
}

/// In-memory implementation of `CampaignStore`
#[derive(Default)]
pub struct MemoryCampaignStore {
    inner: RwLock<Inner>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn recompute_processed(inner: &mut Inner, campaign_id: &str) {
        let processed = inner
            .recipients
            .get(campaign_id)
            .map(|rs| rs.iter().filter(|r| r.status.is_terminal()).count() as u32)
            .unwrap_or(0);
        if let Some(campaign) = inner.campaigns.get_mut(campaign_id) {
            campaign.processed_recipients = processed;
            campaign.updated_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn create_campaign(
        &self,
        campaign: &Campaign,
        recipients: &[CampaignRecipient],
    ) -> Result<()> {
        if campaign.dispatch_mode == DispatchMode::Scheduled {
            match campaign.scheduled_at {
                None => {
                    return Err(StoreError::InvalidCampaign(
                        "scheduled campaign requires scheduled_at".to_string(),
                    ))
                }
                Some(at) if at <= Utc::now() => {
                    return Err(StoreError::InvalidCampaign(
                        "scheduled_at must be in the future".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut inner = self.inner.write();
        let mut stored = campaign.clone();
        stored.total_recipients = recipients.len() as u32;
        stored.processed_recipients = 0;
        inner.recipients.insert(campaign.id.clone(), recipients.to_vec());
        inner.campaigns.insert(campaign.id.clone(), stored);
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.inner.read().campaigns.get(id).cloned())
    }

    async fn list_eligible(
        &self,
        status: CampaignStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Campaign>> {
        let inner = self.inner.read();
        let mut eligible: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .filter(|c| match status {
                CampaignStatus::Scheduled => {
                    c.scheduled_at.map(|at| at <= before).unwrap_or(true)
                }
                CampaignStatus::Running => !c.lock_is_live(before),
                _ => true,
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|c| c.created_at);
        eligible.truncate(limit as usize);
        Ok(eligible)
    }

    async fn try_acquire_lock(
        &self,
        campaign_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let campaign = inner
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;

        if campaign.status.is_terminal() || campaign.lock_is_live(now) {
            return Ok(false);
        }

        campaign.lock_owner = Some(owner.to_string());
        campaign.lock_expires_at =
            Some(now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)));
        campaign.updated_at = Some(now);
        debug!(campaign_id = %campaign_id, owner = %owner, "Acquired dispatch lock");
        Ok(true)
    }

    async fn renew_lock(&self, campaign_id: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let campaign = inner
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;

        if campaign.lock_owner.as_deref() != Some(owner) || !campaign.lock_is_live(now) {
            return Ok(false);
        }

        campaign.lock_expires_at =
            Some(now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)));
        Ok(true)
    }

    async fn release_lock(&self, campaign_id: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(campaign) = inner.campaigns.get_mut(campaign_id) {
            if campaign.lock_owner.as_deref() == Some(owner) {
                campaign.lock_owner = None;
                campaign.lock_expires_at = None;
                campaign.updated_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn update_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<Campaign> {
        let mut inner = self.inner.write();
        let campaign = inner
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;

        if campaign.status == status {
            return Ok(campaign.clone());
        }
        if !campaign.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: campaign.status,
                to: status,
            });
        }
        if campaign.status == CampaignStatus::Draft && campaign.total_recipients == 0 {
            return Err(StoreError::NoRecipients(campaign_id.to_string()));
        }

        let now = Utc::now();
        campaign.status = status;
        campaign.updated_at = Some(now);
        if status == CampaignStatus::Running && campaign.started_at.is_none() {
            campaign.started_at = Some(now);
        }
        if status == CampaignStatus::Completed {
            campaign.completed_at = Some(now);
        }
        Ok(campaign.clone())
    }

    async fn list_recipients(&self, campaign_id: &str) -> Result<Vec<CampaignRecipient>> {
        Ok(self
            .inner
            .read()
            .recipients
            .get(campaign_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_recipient(&self, recipient: &CampaignRecipient, owner: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let lock_held = inner
            .campaigns
            .get(&recipient.campaign_id)
            .map(|c| c.lock_owner.as_deref() == Some(owner) && c.lock_is_live(now))
            .unwrap_or(false);

        let slot = inner
            .recipients
            .get_mut(&recipient.campaign_id)
            .and_then(|rs| {
                rs.iter_mut()
                    .find(|r| r.group_handle == recipient.group_handle)
            });

        match slot {
            None => Err(StoreError::RecipientNotFound {
                campaign_id: recipient.campaign_id.clone(),
                group_handle: recipient.group_handle.clone(),
            }),
            Some(_) if !lock_held => Err(StoreError::LockLost(recipient.campaign_id.clone())),
            Some(existing) => {
                *existing = recipient.clone();
                Self::recompute_processed(&mut inner, &recipient.campaign_id);
                Ok(())
            }
        }
    }

    async fn reset_stranded_recipients(&self, campaign_id: &str) -> Result<u32> {
        let mut inner = self.inner.write();
        let mut count = 0;
        if let Some(recipients) = inner.recipients.get_mut(campaign_id) {
            for recipient in recipients.iter_mut() {
                if recipient.status == RecipientStatus::Sending {
                    recipient.status = RecipientStatus::Pending;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn get_progress(&self, campaign_id: &str) -> Result<CampaignProgress> {
        let inner = self.inner.read();
        if !inner.campaigns.contains_key(campaign_id) {
            return Err(StoreError::CampaignNotFound(campaign_id.to_string()));
        }

        let mut progress = CampaignProgress::default();
        if let Some(recipients) = inner.recipients.get(campaign_id) {
            for recipient in recipients {
                match recipient.status {
                    RecipientStatus::Pending => progress.pending += 1,
                    RecipientStatus::Sending => progress.sending += 1,
                    RecipientStatus::Sent => progress.sent += 1,
                    RecipientStatus::Failed => progress.failed += 1,
                }
                progress.total += 1;
            }
        }
        Ok(progress)
    }

    async fn delete_campaign(&self, campaign_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let campaign = inner
            .campaigns
            .get(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;
        if campaign.status == CampaignStatus::Running {
            return Err(StoreError::CampaignRunning(campaign_id.to_string()));
        }
        inner.campaigns.remove(campaign_id);
        inner.recipients.remove(campaign_id);
        Ok(())
    }
}

/// In-memory message content, keyed by message id
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, String>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_message(&self, id: &str, body: &str) {
        self.messages
            .write()
            .insert(id.to_string(), body.to_string());
    }
}

#[async_trait]
impl MessageContentStore for MemoryMessageStore {
    async fn get_message_text(&self, message_ref: &str) -> Result<Option<String>> {
        Ok(self.messages.read().get(message_ref).cloned())
    }
}
