//! Admin control surface
//!
//! Thin handle over the store and the control registry. Every operation
//! persists the status change first; the watch signal only tells an
//! in-flight dispatcher to stop early. `start_now` and `resume` do not
//! signal anything: they leave the campaign `running` without a live lock,
//! which is exactly what the next scheduler tick picks up.

use std::sync::Arc;

use zc_common::{Campaign, CampaignProgress, CampaignStatus};
use zc_store::CampaignStore;

use crate::control::{ControlRegistry, ControlSignal};
use crate::Result;

#[derive(Clone)]
pub struct EngineHandle {
    store: Arc<dyn CampaignStore>,
    controls: Arc<ControlRegistry>,
}

impl EngineHandle {
    pub fn new(store: Arc<dyn CampaignStore>, controls: Arc<ControlRegistry>) -> Self {
        Self { store, controls }
    }

    /// Start a draft or scheduled campaign immediately, ahead of any
    /// schedule. Dispatch begins on the next scheduler tick.
    pub async fn start_now(&self, campaign_id: &str) -> Result<Campaign> {
        Ok(self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Running)
            .await?)
    }

    /// Pause a running campaign. The in-flight send, if any, completes; the
    /// dispatcher stops before the next one.
    pub async fn pause(&self, campaign_id: &str) -> Result<Campaign> {
        let campaign = self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Paused)
            .await?;
        self.controls.signal(campaign_id, ControlSignal::Pause);
        Ok(campaign)
    }

    /// Resume a paused campaign from the first still-pending recipient.
    pub async fn resume(&self, campaign_id: &str) -> Result<Campaign> {
        Ok(self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Running)
            .await?)
    }

    /// Cancel a campaign. Recipients already sent stay sent.
    pub async fn cancel(&self, campaign_id: &str) -> Result<Campaign> {
        let campaign = self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Cancelled)
            .await?;
        self.controls.signal(campaign_id, ControlSignal::Cancel);
        Ok(campaign)
    }

    /// Delivery counts from last-persisted recipient truth.
    pub async fn progress(&self, campaign_id: &str) -> Result<CampaignProgress> {
        Ok(self.store.get_progress(campaign_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DispatchError;
    use zc_common::{CampaignRecipient, DispatchMode};
    use zc_store::{CampaignStore as _, MemoryCampaignStore, StoreError};

    async fn seed(store: &MemoryCampaignStore, id: &str) {
        let mut campaign = Campaign::new("Test", "msg-1", 0, DispatchMode::Immediate, None);
        campaign.id = id.to_string();
        let recipients = vec![CampaignRecipient::new(id, "group-a", 0)];
        store.create_campaign(&campaign, &recipients).await.unwrap();
    }

    fn engine(store: Arc<MemoryCampaignStore>) -> EngineHandle {
        EngineHandle::new(store, Arc::new(ControlRegistry::new()))
    }

    #[tokio::test]
    async fn test_start_now_from_draft() {
        let store = Arc::new(MemoryCampaignStore::new());
        seed(&store, "c1").await;
        let engine = engine(store);

        let campaign = engine.start_now("c1").await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Running);
        assert!(campaign.started_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let store = Arc::new(MemoryCampaignStore::new());
        seed(&store, "c1").await;
        let engine = engine(store);

        engine.start_now("c1").await.unwrap();
        let paused = engine.pause("c1").await.unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);

        let resumed = engine.resume("c1").await.unwrap();
        assert_eq!(resumed.status, CampaignStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_from_paused() {
        let store = Arc::new(MemoryCampaignStore::new());
        seed(&store, "c1").await;
        let engine = engine(store);

        engine.start_now("c1").await.unwrap();
        engine.pause("c1").await.unwrap();
        let cancelled = engine.cancel("c1").await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_terminal_campaign_rejects_control() {
        let store = Arc::new(MemoryCampaignStore::new());
        seed(&store, "c1").await;
        let engine = engine(store);

        engine.start_now("c1").await.unwrap();
        engine.cancel("c1").await.unwrap();

        let err = engine.resume("c1").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Store(StoreError::InvalidTransition { .. })
        ));
    }
}
