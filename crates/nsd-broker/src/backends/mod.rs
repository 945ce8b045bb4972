//! The two mDNS backends and the router that chooses between them.
//!
//! The broker treats both backends as external collaborators (spec §1,
//! §6): their internal wire logic is opaque, reached only through these
//! trait boundaries. [`legacy`] and [`managed`] provide concrete adapters
//! over `mdns-sd`, grounded in the teacher's `discovery.rs` wrapper.

pub mod iface;
pub mod legacy;
pub mod managed;

use mdns_sd::{IfKind, ServiceDaemon};
use nsd_core::error::NsdError;
use nsd_core::types::{NetworkHandle, ServiceInfo, TransactionId};
use std::collections::HashMap;
use tracing::{info, warn};

/// Which backend started (and therefore must tear down) a given request.
///
/// Stamped onto the stored request at start time and never re-derived from
/// the current feature flags — that is the backend-preservation invariant
/// (spec §4.5, P4): a stop/unregister always branches on this value, not on
/// whatever the flags say *now*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Legacy,
    Managed,
}

/// A callback from the legacy mDNS daemon, tagged with the transaction id
/// the event loop allocated for the operation that produced it.
#[derive(Debug, Clone)]
pub enum LegacyCallback {
    Found {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    Lost {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    DiscoveryFailed {
        global_id: TransactionId,
    },
    Registered {
        global_id: TransactionId,
    },
    RegistrationFailed {
        global_id: TransactionId,
    },
    /// Stage 1 of the two-stage legacy resolve (spec §4.5): hostname/port/txt
    /// resolved, address lookup still pending.
    Resolved {
        global_id: TransactionId,
        hostname: String,
        port: u16,
        txt: HashMap<String, Vec<u8>>,
    },
    ResolutionFailed {
        global_id: TransactionId,
    },
    /// Stage 2: address lookup completed for the `global_id` allocated when
    /// stage 1 resolved (a different id than `Resolved` carried).
    GetAddrSuccess {
        global_id: TransactionId,
        network: Option<NetworkHandle>,
        address: std::net::IpAddr,
    },
    GetAddrFailed {
        global_id: TransactionId,
    },
}

/// A callback from the managed mDNS engine.
#[derive(Debug, Clone)]
pub enum ManagedCallback {
    Found {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    Lost {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    ResolveSucceeded {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    ResolveFailed {
        global_id: TransactionId,
    },
    RegisterSucceeded {
        global_id: TransactionId,
        info: ServiceInfo,
    },
    RegisterFailed {
        global_id: TransactionId,
    },
}

/// The legacy mDNS daemon (spec §6: `register_event_listener`, `start_daemon`,
/// `stop_daemon`, `register_service`, `discover`, `resolve`,
/// `get_service_address`, `stop_operation`).
pub trait LegacyEngine: Send {
    fn start_daemon(&mut self) -> Result<(), NsdError>;
    fn stop_daemon(&mut self);
    fn discover(&mut self, global_id: TransactionId, service_type: &str, iface_idx: i32) -> bool;
    fn register(&mut self, global_id: TransactionId, info: &ServiceInfo, iface_idx: i32) -> bool;
    fn resolve(
        &mut self,
        global_id: TransactionId,
        service_name: &str,
        service_type: &str,
        iface_idx: i32,
    ) -> bool;
    fn get_service_address(
        &mut self,
        global_id: TransactionId,
        hostname: &str,
        iface_idx: i32,
    ) -> bool;
    fn stop_operation(&mut self, global_id: TransactionId);
}

/// The managed discovery manager (spec §6: `register_listener`,
/// `unregister_listener`). Discover and resolve both go through here; the
/// distinction is carried in `resolve_instance_name`.
pub trait ManagedDiscoveryManager: Send {
    fn register_listener(
        &mut self,
        global_id: TransactionId,
        service_type: &str,
        network: Option<NetworkHandle>,
        resolve_instance_name: Option<&str>,
    ) -> Result<(), NsdError>;
    fn unregister_listener(&mut self, global_id: TransactionId);
}

/// The managed advertiser (spec §6: `add_service`, `remove_service`).
pub trait ManagedAdvertiser: Send {
    fn add_service(&mut self, global_id: TransactionId, info: &ServiceInfo) -> Result<(), NsdError>;
    fn remove_service(&mut self, global_id: TransactionId);
}

/// Resolves a [`NetworkHandle`] to an interface index, or the `0` ("no
/// usable interface") sentinel (spec §4.5, §9 Open Questions — a race with
/// network teardown returning 0 is accepted as-is).
pub trait InterfaceResolver: Send {
    fn resolve(&self, network: Option<NetworkHandle>) -> i32;
}

/// Multi-network socket monitoring, started once any managed request exists
/// and stopped once none remain (spec §4.7, P7).
pub trait SocketProvider: Send {
    fn start_monitoring_sockets(&mut self);
    fn stop_monitoring_sockets(&mut self);
}

/// A bookkeeping-only [`SocketProvider`]: the managed engine's own
/// `mdns-sd` daemon already binds and monitors its sockets internally for
/// the lifetime of the process, so there is no separate OS resource to open
/// or close here. This collaborator exists to keep `sockets_monitored`
/// (P7) observable and logged, matching the spec's separation between
/// "is anyone watching" bookkeeping and the engine's own socket lifecycle.
pub struct LoggingSocketProvider;

impl SocketProvider for LoggingSocketProvider {
    fn start_monitoring_sockets(&mut self) {
        tracing::debug!("socket monitoring started");
    }

    fn stop_monitoring_sockets(&mut self) {
        tracing::debug!("socket monitoring stopped");
    }
}

/// Restricts `daemon` to a single named interface, falling back to the OS's
/// default-route interface when no override is configured (spec §B
/// `network_interface` override, grounded in the teacher's `discovery.rs`
/// interface-pinning). Leaves the daemon on "all interfaces" if neither is
/// available.
pub(crate) fn pin_to_interface(daemon: &ServiceDaemon, network_interface: Option<&str>) {
    let iface_name = match network_interface {
        Some(name) => name.to_string(),
        None => netdev::get_default_interface()
            .map(|iface| iface.name)
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not detect default network interface, using all");
                String::new()
            }),
    };
    if iface_name.is_empty() {
        return;
    }
    info!(interface = %iface_name, "restricting mDNS daemon to interface");
    if let Err(e) = daemon.disable_interface(IfKind::All) {
        warn!(error = %e, "failed to disable all interfaces");
        return;
    }
    if let Err(e) = daemon.enable_interface(IfKind::Name(iface_name)) {
        warn!(error = %e, "failed to enable named interface");
    }
}

/// Chooses legacy vs managed per new operation from the two feature flags
/// (spec §4.5). Never consulted for stop/unregister — those branch on the
/// stored request's [`BackendKind`] instead.
pub struct BackendRouter {
    managed_discovery_enabled: bool,
    managed_advertiser_enabled: bool,
}

impl BackendRouter {
    pub fn new(managed_discovery_enabled: bool, managed_advertiser_enabled: bool) -> Self {
        Self {
            managed_discovery_enabled,
            managed_advertiser_enabled,
        }
    }

    pub fn choose_for_discover(&self) -> BackendKind {
        if self.managed_discovery_enabled {
            BackendKind::Managed
        } else {
            BackendKind::Legacy
        }
    }

    pub fn choose_for_resolve(&self) -> BackendKind {
        self.choose_for_discover()
    }

    pub fn choose_for_register(&self) -> BackendKind {
        if self.managed_advertiser_enabled {
            BackendKind::Managed
        } else {
            BackendKind::Legacy
        }
    }

    pub fn set_managed_discovery_enabled(&mut self, enabled: bool) {
        self.managed_discovery_enabled = enabled;
    }

    pub fn set_managed_advertiser_enabled(&mut self, enabled: bool) {
        self.managed_advertiser_enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_prefers_managed_when_enabled() {
        let router = BackendRouter::new(true, true);
        assert_eq!(router.choose_for_discover(), BackendKind::Managed);
        assert_eq!(router.choose_for_resolve(), BackendKind::Managed);
        assert_eq!(router.choose_for_register(), BackendKind::Managed);
    }

    #[test]
    fn router_defaults_to_legacy() {
        let router = BackendRouter::new(false, false);
        assert_eq!(router.choose_for_discover(), BackendKind::Legacy);
        assert_eq!(router.choose_for_register(), BackendKind::Legacy);
    }

    #[test]
    fn discovery_and_advertiser_flags_are_independent() {
        let router = BackendRouter::new(true, false);
        assert_eq!(router.choose_for_discover(), BackendKind::Managed);
        assert_eq!(router.choose_for_register(), BackendKind::Legacy);
    }
}
