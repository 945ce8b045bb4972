//! The event loop / state machine (spec §4.1): the sole writer of every
//! piece of broker state. Everything else in this crate exists to feed it
//! typed messages or to be called from inside it.
//!
//! Modeled as a single async task owning `Broker` by value, draining a
//! [`LoopMessage`] queue with `tokio::select!` — the async-runtime option
//! the source spec calls out explicitly, grounded in the teacher's
//! `app.rs` central-select-loop shape.

use crate::backends::{
    BackendKind, LegacyCallback, LegacyEngine, ManagedAdvertiser, ManagedCallback,
    ManagedDiscoveryManager, SocketProvider,
};
use crate::ids::TransactionIdAllocator;
use crate::lifecycle::{CleanupTick, DaemonLifecycle};
use crate::registry::{ClientId, LegacyResolveStage, Registry, RequestEntry, RequestKind};
use crate::txindex::TransactionIndex;
use nsd_core::error::NsdError;
use nsd_core::ipc::ServerEvent;
use nsd_core::names;
use nsd_core::types::{ListenerKey, NetworkHandle, ServiceInfo, TransactionId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// An interface resolver that lets every network handle through, mapping it
/// to a nonzero placeholder index. Used where a real OS lookup collaborator
/// hasn't been wired in; `None` (no network requested) still maps to
/// IFACE_ANY (`0`) by the caller, not by this resolver.
pub struct PermissiveInterfaceResolver;

impl crate::backends::InterfaceResolver for PermissiveInterfaceResolver {
    fn resolve(&self, network: Option<NetworkHandle>) -> i32 {
        match network {
            None => 0,
            Some(handle) => {
                if handle.0 == 0 {
                    0
                } else {
                    1
                }
            }
        }
    }
}

/// Every external input to the loop, tagged (spec §4.1's closed message
/// set). `RegisterClient` carries a reply channel because the connector
/// needs its freshly minted [`ClientId`] before it can send anything else.
pub enum LoopMessage {
    RegisterClient {
        sink: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<ClientId>,
    },
    UnregisterClient {
        client: ClientId,
    },
    Discover {
        client: ClientId,
        listener_key: ListenerKey,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    StopDiscovery {
        client: ClientId,
        listener_key: ListenerKey,
    },
    Register {
        client: ClientId,
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    Unregister {
        client: ClientId,
        listener_key: ListenerKey,
    },
    Resolve {
        client: ClientId,
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    StopResolution {
        client: ClientId,
        listener_key: ListenerKey,
    },
    WatchRegisteredService {
        client: ClientId,
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    StopWatch {
        client: ClientId,
        listener_key: ListenerKey,
    },
    DaemonStartup {
        client: ClientId,
    },
    DaemonCleanup(CleanupTick),
    LegacyEngineEvent(LegacyCallback),
    ManagedEngineEvent(ManagedCallback),
}

pub struct Broker {
    registry: Registry,
    txindex: TransactionIndex,
    allocator: TransactionIdAllocator,
    router: crate::backends::BackendRouter,
    lifecycle: DaemonLifecycle,
    legacy_engine: Box<dyn LegacyEngine>,
    managed_discovery: Box<dyn ManagedDiscoveryManager>,
    managed_advertiser: Box<dyn ManagedAdvertiser>,
    socket_provider: Box<dyn SocketProvider>,
    interface_resolver: Box<dyn crate::backends::InterfaceResolver>,
    max_requests_per_client: usize,
    cleanup_notify: mpsc::UnboundedSender<CleanupTick>,
    /// *Default* (reject everything but the four always-on message kinds)
    /// vs *Enabled* (process normally). The loop starts Enabled (spec §4.1).
    enabled: bool,
}

#[allow(clippy::too_many_arguments)]
impl Broker {
    pub fn new(
        legacy_engine: Box<dyn LegacyEngine>,
        managed_discovery: Box<dyn ManagedDiscoveryManager>,
        managed_advertiser: Box<dyn ManagedAdvertiser>,
        socket_provider: Box<dyn SocketProvider>,
        interface_resolver: Box<dyn crate::backends::InterfaceResolver>,
        router: crate::backends::BackendRouter,
        cleanup_delay: std::time::Duration,
        max_requests_per_client: usize,
        cleanup_notify: mpsc::UnboundedSender<CleanupTick>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            txindex: TransactionIndex::new(),
            allocator: TransactionIdAllocator::new(),
            router,
            lifecycle: DaemonLifecycle::new(cleanup_delay),
            legacy_engine,
            managed_discovery,
            managed_advertiser,
            socket_provider,
            interface_resolver,
            max_requests_per_client,
            cleanup_notify,
            enabled: true,
        }
    }

    fn send(&self, client: ClientId, event: ServerEvent) {
        let Some(record) = self.registry.get(client) else {
            return;
        };
        if let Err(e) = record.sink.try_send(event) {
            warn!(?client, error = %e, "dropping event for unreachable client sink");
        }
    }

    fn fail(&self, client: ClientId, listener_key: ListenerKey, error: NsdError) {
        self.send(client, ServerEvent::RequestFailed { listener_key, error });
    }

    /// Interface index for a requested network, applying IFACE_ANY (spec
    /// §4.5): `None` is always usable; `Some` that resolves to `0` means the
    /// network is gone or unknown and the caller must fail the request.
    fn resolve_iface(&self, network: Option<NetworkHandle>) -> Result<i32, ()> {
        match network {
            None => Ok(0),
            Some(handle) => {
                let idx = self.interface_resolver.resolve(Some(handle));
                if idx == 0 {
                    Err(())
                } else {
                    Ok(idx)
                }
            }
        }
    }

    /// Tears down whichever backend owns `global_id` — used both by
    /// explicit stop ops and by rollback when `insert_request` itself
    /// rejects a request the backend had already started (spec P4: always
    /// branch on the stored `BackendKind`, never the live flags).
    fn teardown_backend(&mut self, backend: BackendKind, global_id: TransactionId) {
        match backend {
            BackendKind::Legacy => self.legacy_engine.stop_operation(global_id),
            BackendKind::Managed => self.managed_discovery.unregister_listener(global_id),
        }
    }

    fn after_legacy_request_removed(&mut self) {
        self.lifecycle.maybe_schedule_stop(
            self.registry.any_legacy_request_exists(),
            self.registry.legacy_client_count(),
            self.cleanup_notify.clone(),
        );
    }

    fn after_managed_request_removed(&mut self) {
        self.lifecycle
            .maybe_stop_monitoring_sockets_if_no_active_request(
                self.registry.any_managed_request_exists(),
                self.socket_provider.as_mut(),
            );
    }

    // -----------------------------------------------------------------
    // RegisterClient / UnregisterClient
    // -----------------------------------------------------------------

    fn register_client(&mut self, sink: mpsc::Sender<ServerEvent>) -> ClientId {
        self.registry.register(sink)
    }

    /// Expunges every request the client held, invoking the matching
    /// backend teardown for each (spec §4.3, P5).
    fn unregister_client(&mut self, client: ClientId) {
        let Some(record) = self.registry.remove(client) else {
            return;
        };
        for (_, entry) in record.requests.into_iter() {
            self.txindex.remove(entry.global_id);
            self.teardown_backend(entry.backend, entry.global_id);
        }
        // Re-check unconditionally, not just when this client held a legacy
        // request: a legacy client kept alive only by `daemon_startup` (no
        // requests of its own) must still retire the daemon once it's the
        // last one gone (spec §4.7, §8 "daemon cleanup").
        self.lifecycle.maybe_schedule_stop(
            self.registry.any_legacy_request_exists(),
            self.registry.legacy_client_count(),
            self.cleanup_notify.clone(),
        );
        self.lifecycle
            .maybe_stop_monitoring_sockets_if_no_active_request(
                self.registry.any_managed_request_exists(),
                self.socket_provider.as_mut(),
            );
    }

    fn daemon_startup(&mut self, client: ClientId) {
        self.registry.mark_legacy_client(client);
        if let Err(e) = self.lifecycle.maybe_start_daemon(self.legacy_engine.as_mut()) {
            warn!(?client, ?e, "legacy daemon failed to start");
        }
    }

    // -----------------------------------------------------------------
    // Discover
    // -----------------------------------------------------------------

    fn discover(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        service_type: String,
        network: Option<NetworkHandle>,
    ) {
        if !self.enabled {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        let Some(canonical) = names::validate_service_type(&service_type) else {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        };
        let Ok(iface_idx) = self.resolve_iface(network) else {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        };
        let backend = self.router.choose_for_discover();
        let global_id = self.allocator.allocate();

        let started = match backend {
            BackendKind::Legacy => {
                if self.lifecycle.maybe_start_daemon(self.legacy_engine.as_mut()).is_err() {
                    false
                } else {
                    self.legacy_engine.discover(global_id, &canonical, iface_idx)
                }
            }
            BackendKind::Managed => {
                self.lifecycle
                    .maybe_start_monitoring_sockets(self.socket_provider.as_mut());
                self.managed_discovery
                    .register_listener(global_id, &canonical, network, None)
                    .is_ok()
            }
        };
        if !started {
            self.teardown_backend(backend, global_id);
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }

        let entry = RequestEntry {
            kind: RequestKind::Discover,
            backend,
            global_id,
            service_type: canonical,
            service_name: None,
            network,
            legacy_stage: None,
        };
        match self
            .registry
            .insert_request(client, listener_key, entry, self.max_requests_per_client)
        {
            Ok(()) => self.txindex.insert(global_id, client, listener_key),
            Err(e) => {
                self.teardown_backend(backend, global_id);
                match backend {
                    BackendKind::Legacy => self.after_legacy_request_removed(),
                    BackendKind::Managed => self.after_managed_request_removed(),
                }
                self.fail(client, listener_key, e);
            }
        }
    }

    fn stop_discovery(&mut self, client: ClientId, listener_key: ListenerKey) {
        self.stop_request(client, listener_key, |kind| kind == RequestKind::Discover);
    }

    /// Shared stop-op body for discovery/resolve/watch: removes the
    /// request, tears down its backend, and answers the client.
    fn stop_request(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        accept_kind: impl FnOnce(RequestKind) -> bool,
    ) {
        if !self.enabled {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        let Some(entry) = self.registry.remove_request(client, listener_key) else {
            self.fail(client, listener_key, NsdError::OperationNotRunning);
            return;
        };
        if !accept_kind(entry.kind) {
            // Put it back; wrong stop op for this request kind.
            let _ = self.registry.insert_request(
                client,
                listener_key,
                entry,
                self.max_requests_per_client,
            );
            self.fail(client, listener_key, NsdError::OperationNotRunning);
            return;
        }
        self.txindex.remove(entry.global_id);
        self.teardown_backend(entry.backend, entry.global_id);
        match entry.backend {
            BackendKind::Legacy => self.after_legacy_request_removed(),
            BackendKind::Managed => self.after_managed_request_removed(),
        }
        if let Some(record) = self.registry.get_mut(client) {
            if record.watched_listener_key == Some(listener_key) {
                record.watched_listener_key = None;
                record.watched_scratch = None;
            }
            if entry.kind == RequestKind::Resolve {
                record.resolved_scratch = None;
            }
        }
    }

    // -----------------------------------------------------------------
    // Register / Unregister
    // -----------------------------------------------------------------

    fn register(&mut self, client: ClientId, listener_key: ListenerKey, mut info: ServiceInfo) {
        if !self.enabled {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        let Some(canonical_type) = names::validate_service_type(&info.service_type) else {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        };
        info.service_type = canonical_type.clone();
        if let Some(name) = &info.service_name {
            info.service_name = Some(names::truncate_instance_name(name));
        } else {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        }
        let Ok(iface_idx) = self.resolve_iface(info.network) else {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        };
        let backend = self.router.choose_for_register();
        let global_id = self.allocator.allocate();

        let started = match backend {
            BackendKind::Legacy => {
                if self.lifecycle.maybe_start_daemon(self.legacy_engine.as_mut()).is_err() {
                    false
                } else {
                    self.legacy_engine.register(global_id, &info, iface_idx)
                }
            }
            BackendKind::Managed => {
                self.lifecycle
                    .maybe_start_monitoring_sockets(self.socket_provider.as_mut());
                self.managed_advertiser.add_service(global_id, &info).is_ok()
            }
        };
        if !started {
            self.teardown_backend(backend, global_id);
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }

        let entry = RequestEntry {
            kind: RequestKind::Register,
            backend,
            global_id,
            service_type: canonical_type,
            service_name: info.service_name.clone(),
            network: info.network,
            legacy_stage: None,
        };
        match self
            .registry
            .insert_request(client, listener_key, entry, self.max_requests_per_client)
        {
            Ok(()) => self.txindex.insert(global_id, client, listener_key),
            Err(e) => {
                self.teardown_backend(backend, global_id);
                match backend {
                    BackendKind::Legacy => self.after_legacy_request_removed(),
                    BackendKind::Managed => self.after_managed_request_removed(),
                }
                self.fail(client, listener_key, e);
            }
        }
    }

    fn unregister(&mut self, client: ClientId, listener_key: ListenerKey) {
        self.stop_request(client, listener_key, |kind| kind == RequestKind::Register);
    }

    // -----------------------------------------------------------------
    // Resolve (two-stage on legacy, single-stage on managed)
    // -----------------------------------------------------------------

    fn resolve(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    ) {
        if !self.enabled {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        if let Some(record) = self.registry.get(client) {
            if record.resolved_scratch.is_some() {
                self.fail(client, listener_key, NsdError::AlreadyActive);
                return;
            }
        }
        let Some(canonical_type) = names::validate_service_type(&service_type) else {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        };
        let Ok(iface_idx) = self.resolve_iface(network) else {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        };
        let backend = self.router.choose_for_resolve();
        let global_id = self.allocator.allocate();

        let (started, legacy_stage) = match backend {
            BackendKind::Legacy => {
                if self.lifecycle.maybe_start_daemon(self.legacy_engine.as_mut()).is_err() {
                    (false, None)
                } else {
                    let ok = self
                        .legacy_engine
                        .resolve(global_id, &service_name, &canonical_type, iface_idx);
                    (ok, Some(LegacyResolveStage::ResolvePending))
                }
            }
            BackendKind::Managed => {
                self.lifecycle
                    .maybe_start_monitoring_sockets(self.socket_provider.as_mut());
                let ok = self
                    .managed_discovery
                    .register_listener(global_id, &canonical_type, network, Some(&service_name))
                    .is_ok();
                (ok, None)
            }
        };
        if !started {
            self.teardown_backend(backend, global_id);
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }

        let entry = RequestEntry {
            kind: RequestKind::Resolve,
            backend,
            global_id,
            service_type: canonical_type,
            service_name: Some(service_name),
            network,
            legacy_stage,
        };
        match self
            .registry
            .insert_request(client, listener_key, entry, self.max_requests_per_client)
        {
            Ok(()) => {
                self.txindex.insert(global_id, client, listener_key);
                if let Some(record) = self.registry.get_mut(client) {
                    record.resolved_scratch = Some(ServiceInfo::default());
                }
            }
            Err(e) => {
                self.teardown_backend(backend, global_id);
                match backend {
                    BackendKind::Legacy => self.after_legacy_request_removed(),
                    BackendKind::Managed => self.after_managed_request_removed(),
                }
                self.fail(client, listener_key, e);
            }
        }
    }

    fn stop_resolution(&mut self, client: ClientId, listener_key: ListenerKey) {
        self.stop_request(client, listener_key, |kind| kind == RequestKind::Resolve);
    }

    // -----------------------------------------------------------------
    // Watch (register_service_info_callback)
    // -----------------------------------------------------------------

    fn watch_registered_service(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    ) {
        if !self.enabled {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        }
        let Some(record) = self.registry.get(client) else {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        };
        if record.watched_scratch.is_some() {
            self.fail(client, listener_key, NsdError::AlreadyActive);
            return;
        }
        let Some(canonical_type) = names::validate_service_type(&service_type) else {
            self.fail(client, listener_key, NsdError::BadParameters);
            return;
        };
        let Ok(iface_idx) = self.resolve_iface(network) else {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        };
        // Watch always uses the legacy two-stage path regardless of flags
        // (spec §4.5 — the managed-backend equivalent is surfaced via
        // plain ResolveSucceeded/RegisterSucceeded without a long-lived
        // "updated" channel, so only legacy's callback shape supports the
        // repeated-update semantics watch needs).
        if self.lifecycle.maybe_start_daemon(self.legacy_engine.as_mut()).is_err() {
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        let global_id = self.allocator.allocate();
        let ok = self
            .legacy_engine
            .resolve(global_id, &service_name, &canonical_type, iface_idx);
        if !ok {
            self.legacy_engine.stop_operation(global_id);
            self.fail(client, listener_key, NsdError::Internal);
            return;
        }
        let entry = RequestEntry {
            kind: RequestKind::Watch,
            backend: BackendKind::Legacy,
            global_id,
            service_type: canonical_type,
            service_name: Some(service_name),
            network,
            legacy_stage: Some(LegacyResolveStage::ResolvePending),
        };
        match self
            .registry
            .insert_request(client, listener_key, entry, self.max_requests_per_client)
        {
            Ok(()) => {
                self.txindex.insert(global_id, client, listener_key);
                if let Some(record) = self.registry.get_mut(client) {
                    record.watched_scratch = Some(ServiceInfo::default());
                    record.watched_listener_key = Some(listener_key);
                }
            }
            Err(e) => {
                self.legacy_engine.stop_operation(global_id);
                self.after_legacy_request_removed();
                self.fail(client, listener_key, e);
            }
        }
    }

    fn stop_watch(&mut self, client: ClientId, listener_key: ListenerKey) {
        self.stop_request(client, listener_key, |kind| kind == RequestKind::Watch);
    }

    // -----------------------------------------------------------------
    // Legacy engine callback processing (spec §4.6)
    // -----------------------------------------------------------------

    fn on_legacy_event(&mut self, event: LegacyCallback) {
        match event {
            LegacyCallback::Found { global_id, info } => self.on_found(global_id, info, false),
            LegacyCallback::Lost { global_id, info } => self.on_lost(global_id, info),
            LegacyCallback::DiscoveryFailed { global_id } => {
                self.on_terminal_failure(global_id, NsdError::Internal, TerminalKind::Discovery)
            }
            LegacyCallback::Registered { global_id } => self.on_registered(global_id),
            LegacyCallback::RegistrationFailed { global_id } => {
                self.on_terminal_failure(global_id, NsdError::Internal, TerminalKind::Register)
            }
            LegacyCallback::Resolved {
                global_id,
                hostname,
                port,
                txt,
            } => self.on_legacy_resolved(global_id, hostname, port, txt),
            LegacyCallback::ResolutionFailed { global_id } => {
                self.on_legacy_resolution_failed(global_id)
            }
            LegacyCallback::GetAddrSuccess {
                global_id,
                network,
                address,
            } => self.on_legacy_get_addr_success(global_id, network, address),
            LegacyCallback::GetAddrFailed { global_id } => {
                self.on_legacy_resolution_failed(global_id)
            }
        }
    }

    fn on_managed_event(&mut self, event: ManagedCallback) {
        match event {
            ManagedCallback::Found { global_id, info } => self.on_found(global_id, info, true),
            ManagedCallback::Lost { global_id, info } => self.on_lost(global_id, info),
            ManagedCallback::ResolveSucceeded { global_id, info } => {
                self.on_managed_resolve_succeeded(global_id, info)
            }
            ManagedCallback::ResolveFailed { global_id } => {
                self.on_terminal_failure(global_id, NsdError::Internal, TerminalKind::Resolve)
            }
            ManagedCallback::RegisterSucceeded { global_id, .. } => self.on_registered(global_id),
            ManagedCallback::RegisterFailed { global_id } => {
                self.on_terminal_failure(global_id, NsdError::Internal, TerminalKind::Register)
            }
        }
    }

    fn lookup(&self, global_id: TransactionId) -> Option<(ClientId, ListenerKey)> {
        let found = self.txindex.lookup(global_id);
        if found.is_none() {
            debug!(?global_id, "engine callback for unknown transaction, dropping");
        }
        found
    }

    fn on_found(&mut self, global_id: TransactionId, info: ServiceInfo, _managed: bool) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        self.send(client, ServerEvent::ServiceFound { listener_key, info });
    }

    fn on_lost(&mut self, global_id: TransactionId, info: ServiceInfo) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        self.send(client, ServerEvent::ServiceLost { listener_key, info: info.clone() });
        self.correlate_watch_loss(client, &info);
    }

    /// Watch mode's loss correlation (spec §4.5, §9): a discovery stream's
    /// SERVICE_LOST for the same (name, type) the watch is resolving also
    /// delivers a loss to the watcher, tolerating the leading-dot mismatch
    /// between watched and discovered type strings.
    fn correlate_watch_loss(&mut self, client: ClientId, lost_info: &ServiceInfo) {
        let Some(record) = self.registry.get(client) else {
            return;
        };
        let Some(watch_key) = record.watched_listener_key else {
            return;
        };
        let Some(watch_entry) = record.requests.get(&watch_key) else {
            return;
        };
        let watched_name = watch_entry.service_name.as_deref().unwrap_or("");
        let watched_type = watch_entry.service_type.trim_start_matches('.');
        let lost_type = lost_info.service_type.trim_start_matches('.');
        let name_matches = lost_info.service_name.as_deref().map(|n| n == watched_name).unwrap_or(false);
        if name_matches && (watched_type.is_empty() || watched_type == lost_type) {
            self.send(
                client,
                ServerEvent::ServiceUpdatedLost {
                    listener_key: watch_key,
                    info: lost_info.clone(),
                },
            );
        }
    }

    fn on_registered(&mut self, global_id: TransactionId) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        let Some(record) = self.registry.get(client) else {
            return;
        };
        let Some(entry) = record.requests.get(&listener_key) else {
            return;
        };
        let info = ServiceInfo {
            service_name: entry.service_name.clone(),
            service_type: entry.service_type.clone(),
            network: entry.network,
            ..Default::default()
        };
        self.send(client, ServerEvent::ServiceRegistered { listener_key, info });
    }

    fn on_terminal_failure(&mut self, global_id: TransactionId, error: NsdError, kind: TerminalKind) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        let event = match kind {
            TerminalKind::Discovery => ServerEvent::DiscoveryFailed { listener_key, error },
            TerminalKind::Register => ServerEvent::RegistrationFailed { listener_key, error },
            TerminalKind::Resolve => ServerEvent::ResolutionFailed { listener_key, error },
        };
        self.send(client, event);
        self.stop_request_silent(client, listener_key);
    }

    /// Stage 1 -> stage 2 of the legacy two-stage resolve (spec §4.5): a new
    /// transaction id is allocated for the address lookup even though it
    /// answers the same client listener key, matching the spec's two
    /// engine-facing calls under one logical client operation. `hostname`'s
    /// addresses are already cached inside the legacy engine by the time
    /// this runs (populated the moment `mdns-sd` resolved it), so
    /// `get_service_address` below never actually blocks on the network.
    fn on_legacy_resolved(
        &mut self,
        global_id: TransactionId,
        hostname: String,
        port: u16,
        txt: std::collections::HashMap<String, Vec<u8>>,
    ) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        self.txindex.remove(global_id);
        let service_type = self
            .registry
            .get(client)
            .and_then(|r| r.requests.get(&listener_key))
            .map(|e| e.service_type.clone())
            .unwrap_or_default();
        let is_watch = self
            .registry
            .get(client)
            .map(|r| r.watched_listener_key == Some(listener_key))
            .unwrap_or(false);
        let scratch = ServiceInfo {
            service_name: Some(hostname.clone()),
            service_type,
            port: Some(port),
            txt_records: txt,
            ..Default::default()
        };
        if let Some(record) = self.registry.get_mut(client) {
            if is_watch {
                record.watched_scratch = Some(scratch);
            } else {
                record.resolved_scratch = Some(scratch);
            }
        }
        let requested_network = self
            .registry
            .get(client)
            .and_then(|r| r.requests.get(&listener_key))
            .and_then(|e| e.network);
        // Re-resolve rather than reuse the original iface_idx: the network
        // may have gone away between the stage-1 resolve and this stage-2
        // lookup (spec §9 Open Question — a race with teardown returning 0
        // is accepted as best-effort).
        let iface_idx = self.resolve_iface(requested_network).unwrap_or(0);
        let next_id = self.allocator.allocate();
        let ok = self
            .legacy_engine
            .get_service_address(next_id, &hostname, iface_idx);
        if let Some(record) = self.registry.get_mut(client) {
            if let Some(entry) = record.requests.get_mut(&listener_key) {
                entry.global_id = next_id;
                entry.legacy_stage = Some(LegacyResolveStage::AddrPending);
                entry.service_name = Some(hostname.clone());
            }
        }
        self.txindex.insert(next_id, client, listener_key);
        if !ok {
            self.legacy_engine.stop_operation(next_id);
            self.fail_resolve_or_watch(client, listener_key);
        }
    }

    fn on_legacy_get_addr_success(
        &mut self,
        global_id: TransactionId,
        network: Option<NetworkHandle>,
        address: std::net::IpAddr,
    ) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        // spec §4.5: a GET_ADDR_SUCCESS only counts if the network id it
        // carries is meaningful. When the client asked for a specific
        // network, a `None`/zero handle back means the interface vanished
        // between the stage-1 resolve and this stage-2 lookup, and the
        // result is untrustworthy; fail closed. A client that asked for
        // IFACE_ANY has no specific network to confirm, so any returned
        // value (including none) is meaningful for that request.
        let requested_network = self
            .registry
            .get(client)
            .and_then(|r| r.requests.get(&listener_key))
            .and_then(|e| e.network);
        let network_meaningful = match requested_network {
            Some(_) => network.map(|n| n.0 != 0).unwrap_or(false),
            None => true,
        };
        let is_watch = self
            .registry
            .get(client)
            .map(|r| r.watched_listener_key == Some(listener_key))
            .unwrap_or(false);
        if !network_meaningful {
            self.fail_resolve_or_watch_event(client, listener_key, is_watch, NsdError::Internal);
            return;
        }
        let Some(record) = self.registry.get_mut(client) else {
            return;
        };
        let mut info = if is_watch {
            record.watched_scratch.clone()
        } else {
            record.resolved_scratch.clone()
        }
        .unwrap_or_default();
        info.network = network;
        info.host_addresses = vec![address];
        if is_watch {
            record.watched_scratch = Some(info.clone());
            self.send(client, ServerEvent::ServiceUpdated { listener_key, info });
            // Watch stays alive for further updates; do not remove the request.
        } else {
            record.resolved_scratch = None;
            self.send(client, ServerEvent::ServiceResolved { listener_key, info });
            self.stop_request_silent(client, listener_key);
        }
    }

    fn on_legacy_resolution_failed(&mut self, global_id: TransactionId) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        let is_watch = self
            .registry
            .get(client)
            .map(|r| r.watched_listener_key == Some(listener_key))
            .unwrap_or(false);
        // Legacy-compat wart (spec §7): watch mode maps engine resolve/addr
        // failure to bad-parameters; plain resolve maps it to internal-error.
        let error = if is_watch {
            NsdError::BadParameters
        } else {
            NsdError::Internal
        };
        self.fail_resolve_or_watch_event(client, listener_key, is_watch, error);
    }

    /// Sends the async failure event for a resolve or watch (distinct
    /// variants — spec §6's `register_service_info_callback` has its own
    /// `callback-registration-failed`, separate from plain resolve's
    /// `resolve-failed`) and tears the request down.
    fn fail_resolve_or_watch_event(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        is_watch: bool,
        error: NsdError,
    ) {
        let event = if is_watch {
            ServerEvent::CallbackRegistrationFailed { listener_key, error }
        } else {
            ServerEvent::ResolutionFailed { listener_key, error }
        };
        self.send(client, event);
        self.fail_resolve_or_watch(client, listener_key);
    }

    fn fail_resolve_or_watch(&mut self, client: ClientId, listener_key: ListenerKey) {
        self.stop_request_silent(client, listener_key);
    }

    /// Removes a terminated request without sending another client event
    /// (the caller already sent the terminal success/failure event).
    fn stop_request_silent(&mut self, client: ClientId, listener_key: ListenerKey) {
        let Some(entry) = self.registry.remove_request(client, listener_key) else {
            return;
        };
        self.txindex.remove(entry.global_id);
        self.teardown_backend(entry.backend, entry.global_id);
        match entry.backend {
            BackendKind::Legacy => self.after_legacy_request_removed(),
            BackendKind::Managed => self.after_managed_request_removed(),
        }
        if let Some(record) = self.registry.get_mut(client) {
            if record.watched_listener_key == Some(listener_key) {
                record.watched_listener_key = None;
                record.watched_scratch = None;
            }
            record.resolved_scratch = None;
        }
    }

    /// Tears down whatever idle-teardown-eligible state is still live, for
    /// an orderly exit (spec's graceful-shutdown addition, SPEC_FULL.md §C):
    /// stop the legacy daemon if it's running and socket monitoring if it's
    /// active, regardless of the normal idle-timer gating.
    fn shutdown(&mut self) {
        self.lifecycle.maybe_stop_daemon(self.legacy_engine.as_mut());
        self.lifecycle
            .maybe_stop_monitoring_sockets_if_no_active_request(false, self.socket_provider.as_mut());
    }

    fn on_managed_resolve_succeeded(&mut self, global_id: TransactionId, info: ServiceInfo) {
        let Some((client, listener_key)) = self.lookup(global_id) else {
            return;
        };
        self.send(
            client,
            ServerEvent::ServiceResolved {
                listener_key,
                info: info.clone(),
            },
        );
        // One-shot on the managed backend: unregister immediately (spec §4.6).
        self.managed_discovery.unregister_listener(global_id);
        self.stop_request_silent(client, listener_key);
    }

    /// The `DaemonCleanup` branch of [`run`]'s select loop, exposed directly
    /// so tests can drive the timer without a full async loop harness.
    #[cfg(test)]
    fn apply_cleanup_tick(&mut self, tick: CleanupTick) {
        if self.lifecycle.is_current_epoch(tick.epoch) {
            self.lifecycle.maybe_stop_daemon(self.legacy_engine.as_mut());
        }
    }
}

/// Dispatch code shared by every "this operation simply failed" engine
/// event (discovery-failed, registration-failed, managed resolve-failed).
enum TerminalKind {
    Discovery,
    Register,
    Resolve,
}

/// Drives the loop until every sender side is dropped, or `shutdown` fires
/// first — in which case the broker tears down idle-eligible state before
/// the loop exits (graceful shutdown, SPEC_FULL.md §C).
pub async fn run(
    mut broker: Broker,
    mut messages: mpsc::UnboundedReceiver<LoopMessage>,
    mut legacy_events: mpsc::UnboundedReceiver<LegacyCallback>,
    mut managed_events: mpsc::UnboundedReceiver<ManagedCallback>,
    mut cleanup_ticks: mpsc::UnboundedReceiver<CleanupTick>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                broker.shutdown();
                break;
            }
            msg = messages.recv() => {
                let Some(msg) = msg else { break };
                dispatch(&mut broker, msg);
            }
            Some(event) = legacy_events.recv() => {
                broker.on_legacy_event(event);
            }
            Some(event) = managed_events.recv() => {
                broker.on_managed_event(event);
            }
            Some(tick) = cleanup_ticks.recv() => {
                if broker.lifecycle.is_current_epoch(tick.epoch) {
                    broker.lifecycle.maybe_stop_daemon(broker.legacy_engine.as_mut());
                }
            }
        }
    }
}

fn dispatch(broker: &mut Broker, msg: LoopMessage) {
    match msg {
        LoopMessage::RegisterClient { sink, reply } => {
            let id = broker.register_client(sink);
            let _ = reply.send(id);
        }
        LoopMessage::UnregisterClient { client } => broker.unregister_client(client),
        LoopMessage::Discover {
            client,
            listener_key,
            service_type,
            network,
        } => broker.discover(client, listener_key, service_type, network),
        LoopMessage::StopDiscovery { client, listener_key } => {
            broker.stop_discovery(client, listener_key)
        }
        LoopMessage::Register {
            client,
            listener_key,
            info,
        } => broker.register(client, listener_key, info),
        LoopMessage::Unregister { client, listener_key } => broker.unregister(client, listener_key),
        LoopMessage::Resolve {
            client,
            listener_key,
            service_name,
            service_type,
            network,
        } => broker.resolve(client, listener_key, service_name, service_type, network),
        LoopMessage::StopResolution { client, listener_key } => {
            broker.stop_resolution(client, listener_key)
        }
        LoopMessage::WatchRegisteredService {
            client,
            listener_key,
            service_name,
            service_type,
            network,
        } => broker.watch_registered_service(client, listener_key, service_name, service_type, network),
        LoopMessage::StopWatch { client, listener_key } => broker.stop_watch(client, listener_key),
        LoopMessage::DaemonStartup { client } => broker.daemon_startup(client),
        LoopMessage::DaemonCleanup(tick) => {
            if broker.lifecycle.is_current_epoch(tick.epoch) {
                broker.lifecycle.maybe_stop_daemon(broker.legacy_engine.as_mut());
            }
        }
        LoopMessage::LegacyEngineEvent(event) => broker.on_legacy_event(event),
        LoopMessage::ManagedEngineEvent(event) => broker.on_managed_event(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendRouter, InterfaceResolver, ManagedAdvertiser, ManagedDiscoveryManager, SocketProvider};
    use crate::lifecycle::CleanupTick;
    use crate::registry::ClientId;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // -------------------------------------------------------------
    // Fakes. Each wraps its call history behind `Arc<Mutex<_>>` so a test
    // can keep a handle after the `Box<dyn Trait>` moves into the Broker,
    // the same shared-state shape `main.rs`'s `ArcManagedEngine` uses.
    // -------------------------------------------------------------

    #[derive(Default)]
    struct FakeLegacyState {
        daemon_started: bool,
        start_calls: u32,
        stop_calls: u32,
        discover_calls: Vec<TransactionId>,
        register_calls: Vec<TransactionId>,
        resolve_calls: Vec<TransactionId>,
        addr_calls: Vec<(TransactionId, String)>,
        stopped_ops: Vec<TransactionId>,
        fail_discover: bool,
        fail_register: bool,
        fail_resolve: bool,
        fail_addr: bool,
    }

    struct FakeLegacyEngine(Arc<Mutex<FakeLegacyState>>);

    impl LegacyEngine for FakeLegacyEngine {
        fn start_daemon(&mut self) -> Result<(), NsdError> {
            let mut s = self.0.lock().unwrap();
            s.daemon_started = true;
            s.start_calls += 1;
            Ok(())
        }
        fn stop_daemon(&mut self) {
            let mut s = self.0.lock().unwrap();
            s.daemon_started = false;
            s.stop_calls += 1;
        }
        fn discover(&mut self, global_id: TransactionId, _service_type: &str, _iface_idx: i32) -> bool {
            let mut s = self.0.lock().unwrap();
            s.discover_calls.push(global_id);
            !s.fail_discover
        }
        fn register(&mut self, global_id: TransactionId, _info: &ServiceInfo, _iface_idx: i32) -> bool {
            let mut s = self.0.lock().unwrap();
            s.register_calls.push(global_id);
            !s.fail_register
        }
        fn resolve(
            &mut self,
            global_id: TransactionId,
            _service_name: &str,
            _service_type: &str,
            _iface_idx: i32,
        ) -> bool {
            let mut s = self.0.lock().unwrap();
            s.resolve_calls.push(global_id);
            !s.fail_resolve
        }
        fn get_service_address(&mut self, global_id: TransactionId, hostname: &str, _iface_idx: i32) -> bool {
            let mut s = self.0.lock().unwrap();
            s.addr_calls.push((global_id, hostname.to_string()));
            !s.fail_addr
        }
        fn stop_operation(&mut self, global_id: TransactionId) {
            self.0.lock().unwrap().stopped_ops.push(global_id);
        }
    }

    #[derive(Default)]
    struct FakeManagedState {
        discover_registered: Vec<TransactionId>,
        discover_unregistered: Vec<TransactionId>,
        advertiser_added: Vec<TransactionId>,
        advertiser_removed: Vec<TransactionId>,
        fail_register_listener: bool,
        fail_add_service: bool,
    }

    struct FakeManagedDiscovery(Arc<Mutex<FakeManagedState>>);

    impl ManagedDiscoveryManager for FakeManagedDiscovery {
        fn register_listener(
            &mut self,
            global_id: TransactionId,
            _service_type: &str,
            _network: Option<NetworkHandle>,
            _resolve_instance_name: Option<&str>,
        ) -> Result<(), NsdError> {
            let mut s = self.0.lock().unwrap();
            if s.fail_register_listener {
                return Err(NsdError::Internal);
            }
            s.discover_registered.push(global_id);
            Ok(())
        }
        fn unregister_listener(&mut self, global_id: TransactionId) {
            self.0.lock().unwrap().discover_unregistered.push(global_id);
        }
    }

    struct FakeManagedAdvertiser(Arc<Mutex<FakeManagedState>>);

    impl ManagedAdvertiser for FakeManagedAdvertiser {
        fn add_service(&mut self, global_id: TransactionId, _info: &ServiceInfo) -> Result<(), NsdError> {
            let mut s = self.0.lock().unwrap();
            if s.fail_add_service {
                return Err(NsdError::Internal);
            }
            s.advertiser_added.push(global_id);
            Ok(())
        }
        fn remove_service(&mut self, global_id: TransactionId) {
            self.0.lock().unwrap().advertiser_removed.push(global_id);
        }
    }

    #[derive(Default)]
    struct FakeSocketState {
        monitoring: bool,
        start_calls: u32,
        stop_calls: u32,
    }

    struct FakeSocketProvider(Arc<Mutex<FakeSocketState>>);

    impl SocketProvider for FakeSocketProvider {
        fn start_monitoring_sockets(&mut self) {
            let mut s = self.0.lock().unwrap();
            s.monitoring = true;
            s.start_calls += 1;
        }
        fn stop_monitoring_sockets(&mut self) {
            let mut s = self.0.lock().unwrap();
            s.monitoring = false;
            s.stop_calls += 1;
        }
    }

    struct Harness {
        broker: Broker,
        legacy: Arc<Mutex<FakeLegacyState>>,
        managed: Arc<Mutex<FakeManagedState>>,
        sockets: Arc<Mutex<FakeSocketState>>,
    }

    fn make_broker(
        managed_discovery_enabled: bool,
        managed_advertiser_enabled: bool,
        max_requests_per_client: usize,
    ) -> (Harness, mpsc::UnboundedReceiver<CleanupTick>) {
        let legacy = Arc::new(Mutex::new(FakeLegacyState::default()));
        let managed = Arc::new(Mutex::new(FakeManagedState::default()));
        let sockets = Arc::new(Mutex::new(FakeSocketState::default()));
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let broker = Broker::new(
            Box::new(FakeLegacyEngine(legacy.clone())),
            Box::new(FakeManagedDiscovery(managed.clone())),
            Box::new(FakeManagedAdvertiser(managed.clone())),
            Box::new(FakeSocketProvider(sockets.clone())),
            Box::new(PermissiveInterfaceResolver),
            BackendRouter::new(managed_discovery_enabled, managed_advertiser_enabled),
            Duration::from_millis(20),
            max_requests_per_client,
            cleanup_tx,
        );
        (
            Harness {
                broker,
                legacy,
                managed,
                sockets,
            },
            cleanup_rx,
        )
    }

    fn register_test_client(broker: &mut Broker) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let (sink, rx) = mpsc::channel(32);
        (broker.register_client(sink), rx)
    }

    fn recv_all(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // -------------------------------------------------------------
    // spec §8 scenario 1: discover happy path (managed).
    // -------------------------------------------------------------
    #[test]
    fn discover_happy_path_managed() {
        let (mut h, _cleanup_rx) = make_broker(true, true, 10);
        let (client, mut rx) = register_test_client(&mut h.broker);
        let key = ListenerKey::new(1);

        h.broker.discover(client, key, "_http._tcp".to_string(), None);
        assert!(recv_all(&mut rx).is_empty(), "discover itself is not answered synchronously");
        let global_id = *h.managed.lock().unwrap().discover_registered.last().unwrap();

        let found_info = ServiceInfo {
            service_name: Some("printer._http._tcp.local.".to_string()),
            service_type: "_http._tcp".to_string(),
            ..Default::default()
        };
        h.broker
            .on_managed_event(ManagedCallback::Found { global_id, info: found_info.clone() });
        let events = recv_all(&mut rx);
        assert_eq!(events, vec![ServerEvent::ServiceFound { listener_key: key, info: found_info }]);

        h.broker.stop_discovery(client, key);
        assert_eq!(h.managed.lock().unwrap().discover_unregistered, vec![global_id]);
    }

    // -------------------------------------------------------------
    // spec §8 scenario 2: legacy two-stage resolve.
    // -------------------------------------------------------------
    #[test]
    fn legacy_two_stage_resolve() {
        let (mut h, _cleanup_rx) = make_broker(false, false, 10);
        let (client, mut rx) = register_test_client(&mut h.broker);
        let key = ListenerKey::new(1);

        h.broker.resolve(
            client,
            key,
            "X".to_string(),
            "_ipp._tcp".to_string(),
            Some(NetworkHandle(42)),
        );
        let stage1_id = *h.legacy.lock().unwrap().resolve_calls.last().unwrap();

        let mut txt = std::collections::HashMap::new();
        txt.insert("rp".to_string(), b"ipp/print".to_vec());
        h.broker.on_legacy_event(LegacyCallback::Resolved {
            global_id: stage1_id,
            hostname: "x.local.".to_string(),
            port: 631,
            txt,
        });
        let stage2_id = h.legacy.lock().unwrap().addr_calls.last().unwrap().0;
        assert_ne!(stage1_id.raw(), stage2_id.raw());

        h.broker.on_legacy_event(LegacyCallback::GetAddrSuccess {
            global_id: stage2_id,
            network: Some(NetworkHandle(42)),
            address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
        });

        let events = recv_all(&mut rx);
        match events.as_slice() {
            [ServerEvent::ServiceResolved { listener_key, info }] => {
                assert_eq!(*listener_key, key);
                assert_eq!(info.network, Some(NetworkHandle(42)));
                assert_eq!(info.host_addresses, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))]);
                assert_eq!(info.port, Some(631));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(h.broker.registry.get(client).unwrap().resolved_scratch.is_none());
        assert!(h.broker.registry.get(client).unwrap().requests.get(&key).is_none());
    }

    // -------------------------------------------------------------
    // spec §8 scenario 3: already-active resolve.
    // -------------------------------------------------------------
    #[test]
    fn second_resolve_on_same_key_is_rejected_already_active() {
        let (mut h, _cleanup_rx) = make_broker(false, false, 10);
        let (client, mut rx) = register_test_client(&mut h.broker);
        let key = ListenerKey::new(1);

        h.broker
            .resolve(client, key, "X".to_string(), "_ipp._tcp".to_string(), None);
        assert!(recv_all(&mut rx).is_empty());

        h.broker
            .resolve(client, key, "X".to_string(), "_ipp._tcp".to_string(), None);
        let events = recv_all(&mut rx);
        assert_eq!(
            events,
            vec![ServerEvent::RequestFailed { listener_key: key, error: NsdError::AlreadyActive }]
        );
        // The first resolve is still in flight.
        assert_eq!(h.legacy.lock().unwrap().resolve_calls.len(), 1);
    }

    // -------------------------------------------------------------
    // spec §8 scenario 4: peer death during discovery.
    // -------------------------------------------------------------
    #[test]
    fn unregister_client_tears_down_its_discovery_exactly_once() {
        let (mut h, _cleanup_rx) = make_broker(true, true, 10);
        let (client, _rx) = register_test_client(&mut h.broker);
        let key = ListenerKey::new(1);

        h.broker.discover(client, key, "_http._tcp".to_string(), None);
        let global_id = *h.managed.lock().unwrap().discover_registered.last().unwrap();

        h.broker.unregister_client(client);

        assert_eq!(h.managed.lock().unwrap().discover_unregistered, vec![global_id]);
        assert!(h.broker.registry.get(client).is_none());
        assert!(h.broker.txindex.lookup(global_id).is_none());
    }

    // -------------------------------------------------------------
    // spec §8 scenario 5: per-client max limit.
    // -------------------------------------------------------------
    #[test]
    fn eleventh_discover_hits_max_limit_synchronously() {
        let (mut h, _cleanup_rx) = make_broker(true, true, 10);
        let (client, mut rx) = register_test_client(&mut h.broker);

        for i in 0..10 {
            h.broker.discover(client, ListenerKey::new(i), "_http._tcp".to_string(), None);
        }
        assert!(recv_all(&mut rx).is_empty());
        assert_eq!(h.broker.registry.get(client).unwrap().requests.len(), 10);

        h.broker.discover(client, ListenerKey::new(10), "_http._tcp".to_string(), None);
        let events = recv_all(&mut rx);
        assert_eq!(
            events,
            vec![ServerEvent::RequestFailed { listener_key: ListenerKey::new(10), error: NsdError::MaxLimit }]
        );
        assert_eq!(h.broker.registry.get(client).unwrap().requests.len(), 10);
        // The 11th registered with the backend before the cap rejected it, then rolled back.
        assert_eq!(h.managed.lock().unwrap().discover_registered.len(), 11);
        assert_eq!(h.managed.lock().unwrap().discover_unregistered.len(), 1);
    }

    // -------------------------------------------------------------
    // spec §8 scenario 6: daemon cleanup.
    // -------------------------------------------------------------
    #[tokio::test(start_paused = true)]
    async fn daemon_stops_after_delay_once_last_legacy_client_disconnects() {
        let (mut h, mut cleanup_rx) = make_broker(false, false, 10);
        let (client, _rx) = register_test_client(&mut h.broker);

        h.broker.daemon_startup(client);
        assert!(h.legacy.lock().unwrap().daemon_started);

        h.broker.unregister_client(client);
        assert!(h.legacy.lock().unwrap().daemon_started, "must not stop before the delay elapses");

        tokio::time::advance(Duration::from_millis(50)).await;
        let tick = cleanup_rx.recv().await.unwrap();
        h.broker.apply_cleanup_tick(tick);

        assert!(!h.legacy.lock().unwrap().daemon_started);
        assert_eq!(h.legacy.lock().unwrap().stop_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_request_mid_delay_cancels_the_pending_stop() {
        let (mut h, mut cleanup_rx) = make_broker(false, false, 10);
        let (client, _rx) = register_test_client(&mut h.broker);

        h.broker.daemon_startup(client);
        h.broker.unregister_client(client);

        tokio::time::advance(Duration::from_millis(10)).await;
        // A new legacy client shows up before the delay elapses.
        let (other_client, _rx2) = register_test_client(&mut h.broker);
        h.broker.daemon_startup(other_client);

        tokio::time::advance(Duration::from_millis(50)).await;
        let tick = cleanup_rx.recv().await.unwrap();
        h.broker.apply_cleanup_tick(tick);

        assert!(h.legacy.lock().unwrap().daemon_started, "the stale tick must not stop a still-needed daemon");
    }

    // -------------------------------------------------------------
    // Property-based invariants (spec §8 P1-P7).
    // -------------------------------------------------------------
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Discover(i32),
            StopDiscovery(i32),
            Register(i32),
            Unregister(i32),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..6i32).prop_map(Op::Discover),
                (0..6i32).prop_map(Op::StopDiscovery),
                (0..6i32).prop_map(Op::Register),
                (0..6i32).prop_map(Op::Unregister),
            ]
        }

        fn dummy_service_info(key: i32) -> ServiceInfo {
            ServiceInfo {
                service_name: Some(format!("svc-{key}")),
                service_type: "_http._tcp".to_string(),
                ..Default::default()
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// P1 (bijection), P2 (cap), P3 (id uniqueness), P6 (daemon
            /// lifecycle never lags active legacy state), P7 (socket
            /// monitoring mirrors managed-request existence) all hold after
            /// every operation in an arbitrary sequence, on a single client.
            #[test]
            fn invariants_hold_after_every_op(
                use_managed in any::<bool>(),
                ops in proptest::collection::vec(op_strategy(), 0..40),
            ) {
                let (mut h, _cleanup_rx) = make_broker(use_managed, use_managed, 4);
                let (client, _rx) = register_test_client(&mut h.broker);

                for op in ops {
                    match op {
                        Op::Discover(k) => {
                            h.broker.discover(client, ListenerKey::new(k), "_http._tcp".to_string(), None)
                        }
                        Op::StopDiscovery(k) => h.broker.stop_discovery(client, ListenerKey::new(k)),
                        Op::Register(k) => {
                            h.broker.register(client, ListenerKey::new(k), dummy_service_info(k))
                        }
                        Op::Unregister(k) => h.broker.unregister(client, ListenerKey::new(k)),
                    }

                    if let Some(record) = h.broker.registry.get(client) {
                        // P1: every live request is reachable from the index
                        // under the same (client, listener_key), and nothing
                        // extra lives in the index.
                        prop_assert_eq!(record.requests.len(), h.broker.txindex.len());
                        for (key, entry) in record.requests.iter() {
                            prop_assert_eq!(h.broker.txindex.lookup(entry.global_id), Some((client, *key)));
                        }
                        // P2: the per-client cap is never exceeded.
                        prop_assert!(record.requests.len() <= 4);
                        // P3: no two live requests share a global id.
                        let ids: Vec<_> = record.requests.values().map(|e| e.global_id).collect();
                        let unique: HashSet<_> = ids.iter().collect();
                        prop_assert_eq!(ids.len(), unique.len());
                    }
                    // P6: daemon lifecycle never lags active legacy state.
                    if h.broker.registry.any_legacy_request_exists() || h.broker.registry.legacy_client_count() > 0 {
                        prop_assert!(h.broker.lifecycle.daemon_started());
                    }
                    // P7: socket monitoring mirrors managed-request existence
                    // exactly (no delay on this side, unlike the legacy daemon).
                    prop_assert_eq!(
                        h.broker.lifecycle.sockets_monitored(),
                        h.broker.registry.any_managed_request_exists()
                    );
                }
            }

            /// P4: a stop always routes to the backend that started the
            /// request, never to whatever the flags say once the stop runs.
            #[test]
            fn stop_routes_to_the_backend_that_created_the_request(
                start_managed in any::<bool>(),
                toggle_to_managed in any::<bool>(),
            ) {
                let (mut h, _cleanup_rx) = make_broker(start_managed, start_managed, 10);
                let (client, _rx) = register_test_client(&mut h.broker);
                let key = ListenerKey::new(0);

                h.broker.discover(client, key, "_http._tcp".to_string(), None);
                let backend_before = h
                    .broker
                    .registry
                    .get(client)
                    .unwrap()
                    .requests
                    .get(&key)
                    .unwrap()
                    .backend;

                h.broker.router.set_managed_discovery_enabled(toggle_to_managed);
                h.broker.router.set_managed_advertiser_enabled(toggle_to_managed);
                h.broker.stop_discovery(client, key);

                match backend_before {
                    BackendKind::Managed => {
                        prop_assert_eq!(h.managed.lock().unwrap().discover_unregistered.len(), 1);
                        prop_assert_eq!(h.legacy.lock().unwrap().stopped_ops.len(), 0);
                    }
                    BackendKind::Legacy => {
                        prop_assert_eq!(h.legacy.lock().unwrap().stopped_ops.len(), 1);
                        prop_assert_eq!(h.managed.lock().unwrap().discover_unregistered.len(), 0);
                    }
                }
            }

            /// P5: expungement is total — the client vanishes from the
            /// registry and the index, and every request it held got
            /// exactly one teardown call to the backend that owned it.
            #[test]
            fn unregister_client_expunges_every_request_exactly_once(
                managed_discovery in any::<bool>(),
                count in 1..6usize,
            ) {
                let (mut h, _cleanup_rx) = make_broker(managed_discovery, managed_discovery, 10);
                let (client, _rx) = register_test_client(&mut h.broker);

                for k in 0..count {
                    h.broker.discover(client, ListenerKey::new(k as i32), "_http._tcp".to_string(), None);
                }
                let expected_managed = if managed_discovery { count } else { 0 };
                let expected_legacy = count - expected_managed;

                h.broker.unregister_client(client);

                prop_assert!(h.broker.registry.get(client).is_none());
                prop_assert!(h.broker.txindex.is_empty());
                prop_assert_eq!(h.managed.lock().unwrap().discover_unregistered.len(), expected_managed);
                prop_assert_eq!(h.legacy.lock().unwrap().stopped_ops.len(), expected_legacy);
            }
        }
    }
}
