//! Send rate gate
//!
//! Enforces two spacings at the moment a send slot is granted:
//! - per-campaign: at least `interval` between consecutive sends of the
//!   same campaign
//! - global: at least `global_min_gap` between any two sends across all
//!   campaigns, so concurrent campaigns cannot burst the gateway
//!
//! The global gate is a tokio mutex over the last-send instant; tokio
//! mutexes grant in FIFO order, so the earliest waiter sends first. Waits
//! are cooperative: a pause/cancel flip on the campaign's control channel
//! interrupts the wait with `SlotWaitCancelled`.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::{ControlSignal, DispatchError, Result};

pub struct SendGate {
    global_min_gap: Duration,
    last_global_send: Mutex<Option<Instant>>,
    last_campaign_send: DashMap<String, Instant>,
}

impl SendGate {
    pub fn new(global_min_gap: Duration) -> Self {
        Self {
            global_min_gap,
            last_global_send: Mutex::new(None),
            last_campaign_send: DashMap::new(),
        }
    }

    /// Gate with no global spacing, for tests and dev mode.
    pub fn unthrottled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Wait until this campaign may send, then claim the slot.
    ///
    /// Returns `SlotWaitCancelled` as soon as `control` leaves `Run`; the
    /// slot is not claimed in that case.
    pub async fn await_slot(
        &self,
        campaign_id: &str,
        interval: Duration,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<()> {
        // campaign spacing first, without holding the global gate
        if let Some(last) = self.last_campaign_send.get(campaign_id).map(|e| *e) {
            self.sleep_until(last + interval, control).await?;
        }

        {
            let mut last_global = self.last_global_send.lock().await;
            if let Some(last) = *last_global {
                self.sleep_until(last + self.global_min_gap, control).await?;
            }
            *last_global = Some(Instant::now());
        }

        self.last_campaign_send
            .insert(campaign_id.to_string(), Instant::now());
        Ok(())
    }

    /// Drop the campaign's spacing state once its run ends.
    pub fn release(&self, campaign_id: &str) {
        self.last_campaign_send.remove(campaign_id);
    }

    async fn sleep_until(
        &self,
        deadline: Instant,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<()> {
        while Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                changed = control.changed() => {
                    match changed {
                        Ok(()) if *control.borrow() != ControlSignal::Run => {
                            return Err(DispatchError::SlotWaitCancelled);
                        }
                        // re-asserted Run, keep waiting
                        Ok(()) => {}
                        // sender dropped; nothing left to cancel us
                        Err(_) => return Ok(()),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_control() -> (watch::Sender<ControlSignal>, watch::Receiver<ControlSignal>) {
        watch::channel(ControlSignal::Run)
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_interval_spacing() {
        let gate = SendGate::unthrottled();
        let (_tx, mut control) = run_control();
        let interval = Duration::from_secs(5);

        let start = Instant::now();
        gate.await_slot("c1", interval, &mut control).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        gate.await_slot("c1", interval, &mut control).await.unwrap();
        assert!(start.elapsed() >= interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaigns_are_independent() {
        let gate = SendGate::unthrottled();
        let (_tx, mut control) = run_control();

        let start = Instant::now();
        gate.await_slot("c1", Duration::from_secs(60), &mut control)
            .await
            .unwrap();
        gate.await_slot("c2", Duration::from_secs(60), &mut control)
            .await
            .unwrap();
        // c2's first send does not wait on c1's interval
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_min_gap_spans_campaigns() {
        let gate = SendGate::new(Duration::from_secs(2));
        let (_tx, mut control) = run_control();

        let start = Instant::now();
        gate.await_slot("c1", Duration::ZERO, &mut control).await.unwrap();
        gate.await_slot("c2", Duration::ZERO, &mut control).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_clears_campaign_spacing() {
        let gate = SendGate::unthrottled();
        let (_tx, mut control) = run_control();
        let interval = Duration::from_secs(60);

        gate.await_slot("c1", interval, &mut control).await.unwrap();
        gate.release("c1");

        let start = Instant::now();
        gate.await_slot("c1", interval, &mut control).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_by_control_flip() {
        let gate = SendGate::unthrottled();
        let (tx, mut control) = run_control();

        gate.await_slot("c1", Duration::from_secs(3600), &mut control)
            .await
            .unwrap();

        let waiter = tokio::spawn(async move {
            gate.await_slot("c1", Duration::from_secs(3600), &mut control)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(ControlSignal::Pause).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DispatchError::SlotWaitCancelled)));
    }
}
