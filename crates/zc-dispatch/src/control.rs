//! Per-campaign control channels
//!
//! The admin surface and an in-flight dispatcher never call each other
//! directly: control flows through a watch channel per campaign. The
//! dispatcher checks the latest value between sends and during slot waits,
//! so an in-flight send always completes before a signal takes effect.

use dashmap::DashMap;
use tokio::sync::watch;

/// Latest-wins control state for one dispatcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Registry of live control channels, keyed by campaign id.
#[derive(Default)]
pub struct ControlRegistry {
    channels: DashMap<String, watch::Sender<ControlSignal>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh channel for a dispatcher run, replacing any stale one.
    pub fn register(&self, campaign_id: &str) -> watch::Receiver<ControlSignal> {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        self.channels.insert(campaign_id.to_string(), tx);
        rx
    }

    /// Signal the in-flight dispatcher, if any. Signalling a campaign with
    /// no live run is a no-op; the persisted status is authoritative.
    pub fn signal(&self, campaign_id: &str, signal: ControlSignal) {
        if let Some(tx) = self.channels.get(campaign_id) {
            let _ = tx.send(signal);
        }
    }

    pub fn remove(&self, campaign_id: &str) {
        self.channels.remove(campaign_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_reaches_receiver() {
        let registry = ControlRegistry::new();
        let rx = registry.register("c1");
        assert_eq!(*rx.borrow(), ControlSignal::Run);

        registry.signal("c1", ControlSignal::Pause);
        assert_eq!(*rx.borrow(), ControlSignal::Pause);
    }

    #[tokio::test]
    async fn test_signal_without_registration_is_noop() {
        let registry = ControlRegistry::new();
        registry.signal("unknown", ControlSignal::Cancel);
    }

    #[tokio::test]
    async fn test_reregister_resets_to_run() {
        let registry = ControlRegistry::new();
        let _rx = registry.register("c1");
        registry.signal("c1", ControlSignal::Cancel);

        let rx = registry.register("c1");
        assert_eq!(*rx.borrow(), ControlSignal::Run);
    }
}
