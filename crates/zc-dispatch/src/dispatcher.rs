//! Campaign dispatcher
//!
//! Runs one locked campaign to a stopping point: completion, a pause or
//! cancel (signalled in-process or persisted through the store by another
//! worker), lease loss, or a pass that makes no progress. Every
//! recipient state change is persisted before and after the gateway call,
//! so a crash at any point loses at most the outcome of one in-flight send,
//! and that recipient is reconciled back to `pending` on takeover.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zc_common::{CampaignStatus, RecipientStatus, SendOutcome};
use zc_gateway::GatewayClient;
use zc_store::{CampaignStore, MessageContentStore, StoreError};

use crate::{ControlSignal, DispatchError, Result};
use crate::gate::SendGate;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts budget per recipient, shared by rejections and transient errors
    pub max_attempts: u32,
    /// Pause between passes while failed recipients remain retryable
    pub retry_backoff: Duration,
    /// Dispatch lock lease; the heartbeat renews at half this
    pub lock_lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            lock_lease: Duration::from_secs(60),
        }
    }
}

pub struct CampaignDispatcher {
    config: DispatcherConfig,
    store: Arc<dyn CampaignStore>,
    messages: Arc<dyn MessageContentStore>,
    gateway: Arc<dyn GatewayClient>,
    gate: Arc<SendGate>,
    worker_id: String,
}

impl CampaignDispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn CampaignStore>,
        messages: Arc<dyn MessageContentStore>,
        gateway: Arc<dyn GatewayClient>,
        gate: Arc<SendGate>,
        worker_id: String,
    ) -> Self {
        Self {
            config,
            store,
            messages,
            gateway,
            gate,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drive a campaign whose dispatch lock this worker already holds.
    ///
    /// The lock is released on every exit path; the campaign's persisted
    /// status tells the scheduler whether there is anything left to do.
    pub async fn run(
        &self,
        campaign: zc_common::Campaign,
        control: watch::Receiver<ControlSignal>,
    ) -> Result<()> {
        let (lost_tx, lost_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(campaign.id.clone(), lost_tx);

        let result = self.run_inner(&campaign, control, lost_rx).await;

        heartbeat.abort();
        self.gate.release(&campaign.id);
        if let Err(e) = self.store.release_lock(&campaign.id, &self.worker_id).await {
            warn!(campaign_id = %campaign.id, "Failed to release dispatch lock: {}", e);
        }
        result
    }

    async fn run_inner(
        &self,
        campaign: &zc_common::Campaign,
        mut control: watch::Receiver<ControlSignal>,
        lease_lost: watch::Receiver<bool>,
    ) -> Result<()> {
        // A fresh run owns the lock, so any recipient still in `sending` was
        // stranded by a dead worker; its outcome is unknown, retry it.
        let reconciled = self.store.reset_stranded_recipients(&campaign.id).await?;
        if reconciled > 0 {
            info!(campaign_id = %campaign.id, reconciled, "Reconciled stranded recipients");
        }

        let text = self
            .messages
            .get_message_text(&campaign.message_ref)
            .await?
            .ok_or_else(|| DispatchError::MessageNotFound(campaign.message_ref.clone()))?;

        let interval = Duration::from_secs(u64::from(campaign.interval_seconds));

        loop {
            let pending: Vec<_> = self
                .store
                .list_recipients(&campaign.id)
                .await?
                .into_iter()
                .filter(|r| r.status == RecipientStatus::Pending)
                .collect();
            if pending.is_empty() {
                break;
            }

            debug!(campaign_id = %campaign.id, pending = pending.len(), "Starting dispatch pass");
            let mut progressed = false;

            for mut recipient in pending {
                loop {
                    if *control.borrow() != ControlSignal::Run {
                        info!(campaign_id = %campaign.id, "Dispatch halted by control signal");
                        return Ok(());
                    }
                    if *lease_lost.borrow() {
                        return Err(StoreError::LockLost(campaign.id.clone()).into());
                    }
                    match self.gate.await_slot(&campaign.id, interval, &mut control).await {
                        Ok(()) => break,
                        Err(DispatchError::SlotWaitCancelled) => continue,
                        Err(e) => return Err(e),
                    }
                }

                // The control channel only reaches the worker that spawned
                // this run; a pause or cancel persisted by another process is
                // visible in the store alone. The persisted status is
                // authoritative, so re-read it before every send.
                let status = self
                    .store
                    .get_campaign(&campaign.id)
                    .await?
                    .ok_or_else(|| StoreError::CampaignNotFound(campaign.id.clone()))?
                    .status;
                if status != CampaignStatus::Running {
                    info!(
                        campaign_id = %campaign.id,
                        %status,
                        "Dispatch halted, campaign is no longer running"
                    );
                    return Ok(());
                }

                // Persist the attempt before calling out, so a crash between
                // here and the outcome write is visible as a stranded send.
                recipient.status = RecipientStatus::Sending;
                recipient.attempts += 1;
                self.store.update_recipient(&recipient, &self.worker_id).await?;

                let outcome = self.gateway.send_text(&recipient.group_handle, &text).await;
                match &outcome {
                    SendOutcome::Accepted => {
                        recipient.status = RecipientStatus::Sent;
                        recipient.sent_at = Some(Utc::now());
                        recipient.last_error = None;
                        progressed = true;
                        metrics::counter!("zapcast.sends.accepted_total").increment(1);
                        debug!(
                            campaign_id = %campaign.id,
                            group_handle = %recipient.group_handle,
                            "Recipient sent"
                        );
                    }
                    SendOutcome::Rejected(reason) | SendOutcome::TransientError(reason) => {
                        recipient.last_error = Some(reason.clone());
                        if recipient.attempts >= self.config.max_attempts {
                            recipient.status = RecipientStatus::Failed;
                            progressed = true;
                            metrics::counter!("zapcast.sends.failed_total").increment(1);
                        } else {
                            recipient.status = RecipientStatus::Pending;
                            metrics::counter!("zapcast.sends.retried_total").increment(1);
                        }
                        warn!(
                            campaign_id = %campaign.id,
                            group_handle = %recipient.group_handle,
                            attempts = recipient.attempts,
                            "Send attempt failed: {}",
                            reason
                        );
                    }
                }
                self.store.update_recipient(&recipient, &self.worker_id).await?;
            }

            if !progressed {
                // Nothing moved this pass; stop and let a later scheduler
                // tick retry, rather than spinning against a down gateway.
                warn!(campaign_id = %campaign.id, "Dispatch pass made no progress, ending run");
                return Ok(());
            }

            // recipients reverted to pending get another pass after a breather
            if self.config.retry_backoff > Duration::ZERO {
                let _ = tokio::time::timeout(self.config.retry_backoff, control.changed()).await;
            }
        }

        let progress = self.store.get_progress(&campaign.id).await?;
        if progress.is_complete() {
            match self
                .store
                .update_campaign_status(&campaign.id, CampaignStatus::Completed)
                .await
            {
                Ok(_) => {
                    info!(
                        campaign_id = %campaign.id,
                        sent = progress.sent,
                        failed = progress.failed,
                        "Campaign completed"
                    );
                    metrics::counter!("zapcast.campaigns.completed_total").increment(1);
                }
                // admin changed the status under us; their write wins
                Err(StoreError::InvalidTransition { from, to }) => {
                    warn!(campaign_id = %campaign.id, %from, %to, "Skipping completion transition");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, campaign_id: String, lost_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let lease = self.config.lock_lease;
        let period = (lease / 2).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lock(&campaign_id, &worker_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(campaign_id = %campaign_id, "Dispatch lease lost");
                        let _ = lost_tx.send(true);
                        break;
                    }
                    Err(e) => {
                        warn!(campaign_id = %campaign_id, "Lease renewal failed: {}", e);
                    }
                }
            }
        })
    }
}
