//! Daemon/socket lifecycle controller (spec §4.7).
//!
//! Four idempotent primitives plus a cancellable delayed-stop timer. The
//! timer is modeled with a generation counter rather than an abort handle:
//! each `schedule_stop` bumps the generation and spawns a sleep that, on
//! firing, posts `DaemonCleanup { epoch }` back to the event loop. The loop
//! only acts on a `DaemonCleanup` whose epoch still matches the current
//! generation — anything older was implicitly cancelled by a later
//! `cancel_stop`/`schedule_stop` call (spec: "a re-enqueue replaces the
//! existing one").

use crate::backends::{LegacyEngine, SocketProvider};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct DaemonLifecycle {
    daemon_started: bool,
    sockets_monitored: bool,
    cleanup_epoch: u64,
    cleanup_delay: Duration,
}

/// Posted back to the event loop when a scheduled cleanup timer fires.
#[derive(Debug, Clone, Copy)]
pub struct CleanupTick {
    pub epoch: u64,
}

impl DaemonLifecycle {
    pub fn new(cleanup_delay: Duration) -> Self {
        Self {
            daemon_started: false,
            sockets_monitored: false,
            cleanup_epoch: 0,
            cleanup_delay,
        }
    }

    pub fn daemon_started(&self) -> bool {
        self.daemon_started
    }

    pub fn sockets_monitored(&self) -> bool {
        self.sockets_monitored
    }

    /// Idempotent; registers the engine's listener and starts it, then
    /// cancels any pending stop (the spec notes this becomes a no-op
    /// because work is about to be stored right after).
    pub fn maybe_start_daemon(&mut self, engine: &mut dyn LegacyEngine) -> Result<(), nsd_core::error::NsdError> {
        if !self.daemon_started {
            engine.start_daemon()?;
            self.daemon_started = true;
        }
        self.cancel_stop();
        Ok(())
    }

    pub fn maybe_stop_daemon(&mut self, engine: &mut dyn LegacyEngine) {
        if self.daemon_started {
            engine.stop_daemon();
            self.daemon_started = false;
        }
    }

    /// Arms the cleanup timer: no more legacy work and no legacy clients.
    /// Spawns a sleep that posts `CleanupTick` through `notify` on firing.
    pub fn maybe_schedule_stop(
        &mut self,
        any_legacy_request_active: bool,
        legacy_client_count: usize,
        notify: mpsc::UnboundedSender<CleanupTick>,
    ) {
        if any_legacy_request_active || legacy_client_count > 0 {
            return;
        }
        self.cleanup_epoch += 1;
        let epoch = self.cleanup_epoch;
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notify.send(CleanupTick { epoch });
        });
    }

    /// Invalidates any in-flight timer by bumping the generation; a late
    /// `CleanupTick` for an older epoch is then ignored by the caller.
    pub fn cancel_stop(&mut self) {
        self.cleanup_epoch += 1;
    }

    pub fn is_current_epoch(&self, epoch: u64) -> bool {
        epoch == self.cleanup_epoch
    }

    pub fn maybe_start_monitoring_sockets(&mut self, sockets: &mut dyn SocketProvider) {
        if !self.sockets_monitored {
            sockets.start_monitoring_sockets();
            self.sockets_monitored = true;
        }
    }

    pub fn maybe_stop_monitoring_sockets_if_no_active_request(
        &mut self,
        any_managed_request_exists: bool,
        sockets: &mut dyn SocketProvider,
    ) {
        if self.sockets_monitored && !any_managed_request_exists {
            sockets.stop_monitoring_sockets();
            self.sockets_monitored = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsd_core::error::NsdError;
    use nsd_core::types::{NetworkHandle, ServiceInfo, TransactionId};

    struct NoopLegacyEngine {
        started: bool,
    }
    impl LegacyEngine for NoopLegacyEngine {
        fn start_daemon(&mut self) -> Result<(), NsdError> {
            self.started = true;
            Ok(())
        }
        fn stop_daemon(&mut self) {
            self.started = false;
        }
        fn discover(&mut self, _: TransactionId, _: &str, _: i32) -> bool {
            true
        }
        fn register(&mut self, _: TransactionId, _: &ServiceInfo, _: i32) -> bool {
            true
        }
        fn resolve(&mut self, _: TransactionId, _: &str, _: &str, _: i32) -> bool {
            true
        }
        fn get_service_address(&mut self, _: TransactionId, _: &str, _: i32) -> bool {
            true
        }
        fn stop_operation(&mut self, _: TransactionId) {}
    }

    struct NoopSocketProvider {
        monitoring: bool,
    }
    impl SocketProvider for NoopSocketProvider {
        fn start_monitoring_sockets(&mut self) {
            self.monitoring = true;
        }
        fn stop_monitoring_sockets(&mut self) {
            self.monitoring = false;
        }
    }

    #[test]
    fn start_daemon_is_idempotent() {
        let mut lifecycle = DaemonLifecycle::new(Duration::from_millis(10));
        let mut engine = NoopLegacyEngine { started: false };
        lifecycle.maybe_start_daemon(&mut engine).unwrap();
        lifecycle.maybe_start_daemon(&mut engine).unwrap();
        assert!(lifecycle.daemon_started());
        assert!(engine.started);
    }

    #[test]
    fn stop_monitoring_only_fires_when_no_managed_requests() {
        let mut lifecycle = DaemonLifecycle::new(Duration::from_millis(10));
        let mut sockets = NoopSocketProvider { monitoring: false };
        lifecycle.maybe_start_monitoring_sockets(&mut sockets);
        assert!(sockets.monitoring);
        lifecycle.maybe_stop_monitoring_sockets_if_no_active_request(true, &mut sockets);
        assert!(sockets.monitoring, "must not stop while managed requests remain");
        lifecycle.maybe_stop_monitoring_sockets_if_no_active_request(false, &mut sockets);
        assert!(!sockets.monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stop_invalidates_pending_epoch() {
        let mut lifecycle = DaemonLifecycle::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        lifecycle.maybe_schedule_stop(false, 0, tx.clone());
        let scheduled_epoch = lifecycle.cleanup_epoch;
        lifecycle.cancel_stop();
        tokio::time::advance(Duration::from_millis(150)).await;
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.epoch, scheduled_epoch);
        assert!(!lifecycle.is_current_epoch(tick.epoch));
    }
}
