//! Dispatcher integration tests
//!
//! Exercise the recipient loop against the in-memory store and a scripted
//! gateway: retry budgets, pause/resume, cancellation (signalled and
//! persisted), lease loss, and missing message content.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use zc_common::{
    Campaign, CampaignRecipient, CampaignStatus, DispatchMode, RecipientStatus, SendOutcome,
};
use zc_dispatch::{
    CampaignDispatcher, ControlSignal, DispatchError, DispatcherConfig, SendGate,
};
use zc_gateway::{GatewayClient, GatewayError, InstanceStatus};
use zc_store::{CampaignStore, MemoryCampaignStore, MemoryMessageStore, StoreError};

const WORKER: &str = "worker-1";
const LEASE: Duration = Duration::from_secs(30);

/// Gateway double: scripted per-handle outcomes (default Accepted), a call
/// log, an optional control flip after the Nth call, and an optional status
/// write through the store after the Nth call (an admin acting from another
/// process, which never reaches this worker's control channel).
struct MockGateway {
    calls: StdMutex<Vec<String>>,
    script: StdMutex<HashMap<String, VecDeque<SendOutcome>>>,
    flip_after: StdMutex<Option<(usize, watch::Sender<ControlSignal>, ControlSignal)>>,
    persist_after: StdMutex<Option<(usize, Arc<MemoryCampaignStore>, String, CampaignStatus)>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            calls: StdMutex::new(Vec::new()),
            script: StdMutex::new(HashMap::new()),
            flip_after: StdMutex::new(None),
            persist_after: StdMutex::new(None),
        }
    }

    fn script_outcomes(&self, handle: &str, outcomes: Vec<SendOutcome>) {
        self.script
            .lock()
            .unwrap()
            .insert(handle.to_string(), outcomes.into());
    }

    fn flip_control_after(&self, calls: usize, tx: watch::Sender<ControlSignal>, to: ControlSignal) {
        *self.flip_after.lock().unwrap() = Some((calls, tx, to));
    }

    fn persist_status_after(
        &self,
        calls: usize,
        store: Arc<MemoryCampaignStore>,
        campaign_id: &str,
        to: CampaignStatus,
    ) {
        *self.persist_after.lock().unwrap() =
            Some((calls, store, campaign_id.to_string(), to));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn send_text(&self, group_handle: &str, _text: &str) -> SendOutcome {
        let call_count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(group_handle.to_string());
            calls.len()
        };

        if let Some((after, tx, to)) = self.flip_after.lock().unwrap().as_ref() {
            if call_count >= *after {
                let _ = tx.send(*to);
            }
        }

        let due_write = {
            let mut guard = self.persist_after.lock().unwrap();
            let due = matches!(guard.as_ref(), Some((after, _, _, _)) if call_count >= *after);
            if due {
                guard.take()
            } else {
                None
            }
        };
        if let Some((_, store, campaign_id, to)) = due_write {
            store.update_campaign_status(&campaign_id, to).await.unwrap();
        }

        self.script
            .lock()
            .unwrap()
            .get_mut(group_handle)
            .and_then(|q| q.pop_front())
            .unwrap_or(SendOutcome::Accepted)
    }

    async fn get_instance_status(&self) -> Result<InstanceStatus, GatewayError> {
        Ok(InstanceStatus {
            connected: true,
            smartphone_connected: Some(true),
            error: None,
        })
    }
}

struct Harness {
    store: Arc<MemoryCampaignStore>,
    gateway: Arc<MockGateway>,
    dispatcher: CampaignDispatcher,
}

fn harness(max_attempts: u32) -> Harness {
    let store = Arc::new(MemoryCampaignStore::new());
    let messages = Arc::new(MemoryMessageStore::new());
    messages.put_message("msg-1", "Hello groups!");
    let gateway = Arc::new(MockGateway::new());
    let dispatcher = CampaignDispatcher::new(
        DispatcherConfig {
            max_attempts,
            retry_backoff: Duration::ZERO,
            lock_lease: LEASE,
        },
        store.clone(),
        messages,
        gateway.clone(),
        Arc::new(SendGate::unthrottled()),
        WORKER.to_string(),
    );
    Harness {
        store,
        gateway,
        dispatcher,
    }
}

async fn seed_running(store: &MemoryCampaignStore, id: &str, handles: &[&str]) -> Campaign {
    let mut campaign = Campaign::new("Test campaign", "msg-1", 0, DispatchMode::Immediate, None);
    campaign.id = id.to_string();
    let recipients: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, h)| CampaignRecipient::new(id, *h, i as u32))
        .collect();
    store.create_campaign(&campaign, &recipients).await.unwrap();
    store
        .update_campaign_status(id, CampaignStatus::Running)
        .await
        .unwrap()
}

async fn locked_run(h: &Harness, campaign_id: &str) -> Result<(), DispatchError> {
    assert!(h
        .store
        .try_acquire_lock(campaign_id, WORKER, LEASE)
        .await
        .unwrap());
    let campaign = h.store.get_campaign(campaign_id).await.unwrap().unwrap();
    let (_tx, rx) = watch::channel(ControlSignal::Run);
    h.dispatcher.run(campaign, rx).await
}

#[tokio::test]
async fn test_all_recipients_sent_in_order() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;

    locked_run(&h, "c1").await.unwrap();

    assert_eq!(h.gateway.calls(), vec!["group-a", "group-b", "group-c"]);

    let recipients = h.store.list_recipients("c1").await.unwrap();
    for r in &recipients {
        assert_eq!(r.status, RecipientStatus::Sent);
        assert_eq!(r.attempts, 1);
        assert!(r.sent_at.is_some());
    }

    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert!(campaign.completed_at.is_some());
    assert_eq!(campaign.processed_recipients, 3);
    assert!(campaign.lock_owner.is_none());
}

#[tokio::test]
async fn test_attempts_budget_exhausted_across_runs() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;
    h.gateway.script_outcomes(
        "group-b",
        vec![
            SendOutcome::Rejected("blocked".to_string()),
            SendOutcome::Rejected("blocked".to_string()),
            SendOutcome::Rejected("blocked".to_string()),
        ],
    );

    // a no-progress pass ends a run; rerun until the campaign settles, the
    // way successive scheduler ticks would
    for _ in 0..5 {
        locked_run(&h, "c1").await.unwrap();
        let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
        if campaign.status == CampaignStatus::Completed {
            break;
        }
    }

    let recipients = h.store.list_recipients("c1").await.unwrap();
    assert_eq!(recipients[0].status, RecipientStatus::Sent);
    assert_eq!(recipients[2].status, RecipientStatus::Sent);
    assert_eq!(recipients[1].status, RecipientStatus::Failed);
    assert_eq!(recipients[1].attempts, 3);
    assert_eq!(recipients[1].last_error.as_deref(), Some("blocked"));

    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);

    // the healthy recipients were never re-sent
    let calls = h.gateway.calls();
    assert_eq!(calls.iter().filter(|c| *c == "group-a").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "group-b").count(), 3);
    assert_eq!(calls.iter().filter(|c| *c == "group-c").count(), 1);
}

#[tokio::test]
async fn test_transient_error_retried_within_run() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;
    h.gateway.script_outcomes(
        "group-b",
        vec![SendOutcome::TransientError("timeout".to_string())],
    );

    locked_run(&h, "c1").await.unwrap();

    let recipients = h.store.list_recipients("c1").await.unwrap();
    assert_eq!(recipients[1].status, RecipientStatus::Sent);
    assert_eq!(recipients[1].attempts, 2);
    // success clears the stale failure reason
    assert!(recipients[1].last_error.is_none());

    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(h.gateway.calls(), vec!["group-a", "group-b", "group-c", "group-b"]);
}

#[tokio::test]
async fn test_pause_after_first_recipient_and_resume() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;

    assert!(h.store.try_acquire_lock("c1", WORKER, LEASE).await.unwrap());
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    let (tx, rx) = watch::channel(ControlSignal::Run);
    h.gateway.flip_control_after(1, tx, ControlSignal::Pause);

    h.dispatcher.run(campaign, rx).await.unwrap();

    // the in-flight send completed; nothing after it was attempted
    assert_eq!(h.gateway.calls(), vec!["group-a"]);
    let progress = h.store.get_progress("c1").await.unwrap();
    assert_eq!(progress.sent, 1);
    assert_eq!(progress.pending, 2);

    // the admin surface persists Paused; the dispatcher released the lock
    h.store
        .update_campaign_status("c1", CampaignStatus::Paused)
        .await
        .unwrap();
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert!(campaign.lock_owner.is_none());

    // resume picks up from the first pending recipient, no duplicates
    h.store
        .update_campaign_status("c1", CampaignStatus::Running)
        .await
        .unwrap();
    locked_run(&h, "c1").await.unwrap();

    assert_eq!(h.gateway.calls(), vec!["group-a", "group-b", "group-c"]);
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_cancel_stops_dispatch() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;

    assert!(h.store.try_acquire_lock("c1", WORKER, LEASE).await.unwrap());
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    let (tx, rx) = watch::channel(ControlSignal::Run);
    h.gateway.flip_control_after(1, tx, ControlSignal::Cancel);

    h.dispatcher.run(campaign, rx).await.unwrap();

    assert_eq!(h.gateway.calls(), vec!["group-a"]);
    let progress = h.store.get_progress("c1").await.unwrap();
    assert_eq!(progress.sent, 1);
    assert_eq!(progress.pending, 2);
}

#[tokio::test]
async fn test_missing_message_content_aborts_run() {
    let h = harness(3);
    let mut campaign = Campaign::new("No content", "msg-gone", 0, DispatchMode::Immediate, None);
    campaign.id = "c1".to_string();
    let recipients = vec![CampaignRecipient::new("c1", "group-a", 0)];
    h.store.create_campaign(&campaign, &recipients).await.unwrap();
    h.store
        .update_campaign_status("c1", CampaignStatus::Running)
        .await
        .unwrap();

    let err = locked_run(&h, "c1").await.unwrap_err();
    assert!(matches!(err, DispatchError::MessageNotFound(_)));

    // nothing was attempted and the lock is free for a later run
    assert!(h.gateway.calls().is_empty());
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Running);
    assert!(campaign.lock_owner.is_none());
}

#[tokio::test]
async fn test_expired_lease_rejects_recipient_write() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a"]).await;

    // lease already expired at acquisition, so the first recipient write fails
    assert!(h
        .store
        .try_acquire_lock("c1", WORKER, Duration::ZERO)
        .await
        .unwrap());
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    let (_tx, rx) = watch::channel(ControlSignal::Run);

    let err = h.dispatcher.run(campaign, rx).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Store(StoreError::LockLost(_))
    ));

    let recipients = h.store.list_recipients("c1").await.unwrap();
    assert_eq!(recipients[0].status, RecipientStatus::Pending);
    assert_eq!(recipients[0].attempts, 0);
}

#[tokio::test]
async fn test_persisted_pause_halts_dispatch_without_signal() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;

    assert!(h.store.try_acquire_lock("c1", WORKER, LEASE).await.unwrap());
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    // admin in another process persists the pause; this worker's control
    // channel never hears about it
    h.store
        .update_campaign_status("c1", CampaignStatus::Paused)
        .await
        .unwrap();

    let (_tx, rx) = watch::channel(ControlSignal::Run);
    h.dispatcher.run(campaign, rx).await.unwrap();

    // the persisted status is authoritative: nothing was sent
    assert!(h.gateway.calls().is_empty());
    let progress = h.store.get_progress("c1").await.unwrap();
    assert_eq!(progress.pending, 3);
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Paused);
    assert!(campaign.lock_owner.is_none());
}

#[tokio::test]
async fn test_persisted_cancel_mid_run_stops_after_inflight_send() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a", "group-b", "group-c"]).await;
    h.gateway
        .persist_status_after(1, h.store.clone(), "c1", CampaignStatus::Cancelled);

    locked_run(&h, "c1").await.unwrap();

    // the in-flight send completed; the store-level cancel stopped the rest
    assert_eq!(h.gateway.calls(), vec!["group-a"]);
    let progress = h.store.get_progress("c1").await.unwrap();
    assert_eq!(progress.sent, 1);
    assert_eq!(progress.pending, 2);
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert!(campaign.lock_owner.is_none());
}

#[tokio::test]
async fn test_completed_campaign_is_never_redispatched() {
    let h = harness(3);
    seed_running(&h.store, "c1", &["group-a"]).await;

    locked_run(&h, "c1").await.unwrap();
    let campaign = h.store.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);

    // terminal campaigns refuse the lock, so no second run can start
    assert!(!h.store.try_acquire_lock("c1", WORKER, LEASE).await.unwrap());
    assert_eq!(h.gateway.calls(), vec!["group-a"]);
}
