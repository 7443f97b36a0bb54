//! Campaign scheduler
//!
//! Fixed-cadence tick that turns persisted campaign state into dispatcher
//! runs. Two queries per tick: scheduled campaigns whose time has come, and
//! running campaigns without a live lock. The second query is the single
//! entry point for immediate starts, resumes and crash takeovers, so all
//! three share one code path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use zc_common::{Campaign, CampaignStatus};
use zc_store::CampaignStore;

use crate::control::ControlRegistry;
use crate::dispatcher::CampaignDispatcher;
use crate::Result;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
    /// Max campaigns picked up per status per tick
    pub batch_size: u32,
    pub lock_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(2),
            batch_size: 50,
            lock_lease: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct CampaignScheduler {
    config: SchedulerConfig,
    store: Arc<dyn CampaignStore>,
    dispatcher: Arc<CampaignDispatcher>,
    controls: Arc<ControlRegistry>,
    running: Arc<AtomicBool>,
}

impl CampaignScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn CampaignStore>,
        dispatcher: Arc<CampaignDispatcher>,
        controls: Arc<ControlRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            controls,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the tick loop. Idempotent; a second call is a warning no-op.
    pub fn start(&self) {
        if !self.config.enabled {
            info!("Campaign scheduler is disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Campaign scheduler already running");
            return;
        }

        info!(
            tick_interval_ms = self.config.tick_interval.as_millis(),
            batch_size = self.config.batch_size,
            worker_id = %self.dispatcher.worker_id(),
            "Starting campaign scheduler"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.tick_interval);
            loop {
                ticker.tick().await;
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = scheduler.tick().await {
                    error!("Scheduler tick failed: {}", e);
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Campaign scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One pass over eligible campaigns.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        let due = self
            .store
            .list_eligible(CampaignStatus::Scheduled, now, self.config.batch_size)
            .await?;
        let unlocked = self
            .store
            .list_eligible(CampaignStatus::Running, now, self.config.batch_size)
            .await?;

        if due.is_empty() && unlocked.is_empty() {
            trace!("No eligible campaigns");
            return Ok(());
        }

        debug!(due = due.len(), unlocked = unlocked.len(), "Found eligible campaigns");
        metrics::gauge!("zapcast.scheduler.eligible_campaigns")
            .set((due.len() + unlocked.len()) as f64);

        for campaign in due.into_iter().chain(unlocked) {
            let campaign_id = campaign.id.clone();
            // one bad campaign never stalls the rest of the tick
            if let Err(e) = self.launch(campaign).await {
                error!(campaign_id = %campaign_id, "Failed to launch campaign: {}", e);
            }
        }
        Ok(())
    }

    async fn launch(&self, campaign: Campaign) -> Result<()> {
        let worker_id = self.dispatcher.worker_id().to_string();

        let acquired = self
            .store
            .try_acquire_lock(&campaign.id, &worker_id, self.config.lock_lease)
            .await?;
        if !acquired {
            // another worker got there between the listing and now
            debug!(campaign_id = %campaign.id, "Dispatch lock held elsewhere, skipping");
            return Ok(());
        }

        // The listing snapshot may be stale by the time the lock is won; an
        // admin pause or cancel can land in between. Re-read before starting.
        let campaign = match self.store.get_campaign(&campaign.id).await? {
            Some(c) => c,
            None => {
                warn!(campaign_id = %campaign.id, "Campaign vanished before launch");
                self.store.release_lock(&campaign.id, &worker_id).await?;
                return Ok(());
            }
        };

        let campaign = match campaign.status {
            CampaignStatus::Running => campaign,
            CampaignStatus::Scheduled => {
                match self
                    .store
                    .update_campaign_status(&campaign.id, CampaignStatus::Running)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(campaign_id = %campaign.id, "Failed to start campaign: {}", e);
                        self.store.release_lock(&campaign.id, &worker_id).await?;
                        return Ok(());
                    }
                }
            }
            status => {
                debug!(campaign_id = %campaign.id, %status, "No longer dispatchable, skipping");
                self.store.release_lock(&campaign.id, &worker_id).await?;
                return Ok(());
            }
        };

        info!(
            campaign_id = %campaign.id,
            name = %campaign.name,
            recipients = campaign.total_recipients,
            "Launching campaign dispatch"
        );
        metrics::counter!("zapcast.campaigns.launched_total").increment(1);

        let control = self.controls.register(&campaign.id);
        let dispatcher = self.dispatcher.clone();
        let controls = self.controls.clone();
        tokio::spawn(async move {
            let campaign_id = campaign.id.clone();
            if let Err(e) = dispatcher.run(campaign, control).await {
                error!(campaign_id = %campaign_id, "Campaign dispatch failed: {}", e);
            }
            controls.remove(&campaign_id);
        });
        Ok(())
    }
}
