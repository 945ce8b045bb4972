//! Legacy backend: a single shared `mdns-sd` daemon, wrapped the way the
//! teacher's `discovery.rs` wraps one for FamilyCom's peer discovery —
//! `spawn_blocking` bridges the crate's synchronous event receiver into the
//! async world, forwarding events back to the event loop over a channel.
//!
//! Browsing and registration here are keyed by `(global_id, type/fullname)`
//! rather than FamilyCom's single well-known service type, since the broker
//! multiplexes arbitrary service types for arbitrary clients.

use super::{pin_to_interface, LegacyCallback, LegacyEngine};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo as MdnsServiceInfo};
use nsd_core::error::NsdError;
use nsd_core::names::unescape_full_name;
use nsd_core::types::{NetworkHandle, ServiceInfo, TransactionId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Cached per-hostname resolution result, populated when `ServiceResolved`
/// arrives and consumed by the synthetic "stage 2" address lookup (spec
/// §4.5 two-stage resolve — `mdns-sd` hands us host+port+addresses in one
/// event, so stage 2 is answered from this cache rather than a second wire
/// round-trip; see DESIGN.md).
#[derive(Debug, Clone)]
struct ResolvedHost {
    addresses: Vec<IpAddr>,
}

pub struct MdnsLegacyEngine {
    daemon: Option<ServiceDaemon>,
    callback_tx: mpsc::UnboundedSender<LegacyCallback>,
    /// Interface this daemon should be pinned to once started, or `None` to
    /// auto-detect the default route (spec §B `network_interface` override).
    network_interface: Option<String>,
    /// global_id (discover) -> service type being browsed, for stop_operation.
    discoveries: HashMap<TransactionId, String>,
    /// global_id (register) -> full service name, for stop_operation.
    registrations: HashMap<TransactionId, String>,
    /// global_id (resolve stage 1) -> (name, type), for correlating stage 2.
    resolves: HashMap<TransactionId, (String, String)>,
    /// hostname -> cached addresses from the most recent ServiceResolved.
    /// Shared with the spawned resolve-loop task, which populates it the
    /// moment a match is found — the synthetic "stage 2" lookup below then
    /// always has its answer ready before `get_service_address` runs.
    resolved_hosts: Arc<Mutex<HashMap<String, ResolvedHost>>>,
}

impl MdnsLegacyEngine {
    pub fn new(
        callback_tx: mpsc::UnboundedSender<LegacyCallback>,
        network_interface: Option<String>,
    ) -> Self {
        Self {
            daemon: None,
            callback_tx,
            network_interface,
            discoveries: HashMap::new(),
            registrations: HashMap::new(),
            resolves: HashMap::new(),
            resolved_hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn spawn_browse_loop(&self, global_id: TransactionId, service_type: String) {
        let Some(daemon) = &self.daemon else {
            return;
        };
        let receiver = match daemon.browse(&service_type) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, service_type, "legacy browse failed to start");
                let _ = self
                    .callback_tx
                    .send(LegacyCallback::DiscoveryFailed { global_id });
                return;
            }
        };
        let tx = self.callback_tx.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(service_info) = convert_mdns_info(&info) else {
                            continue;
                        };
                        if tx
                            .send(LegacyCallback::Found {
                                global_id,
                                info: service_info,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        let info = ServiceInfo {
                            service_name: Some(fullname),
                            service_type: String::new(),
                            ..Default::default()
                        };
                        if tx
                            .send(LegacyCallback::Lost { global_id, info })
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!(?global_id, "legacy browse loop exited");
        });
    }

    fn spawn_resolve_loop(
        &mut self,
        global_id: TransactionId,
        service_name: String,
        service_type: String,
    ) {
        let Some(daemon) = &self.daemon else {
            return;
        };
        let full_type = if service_type.ends_with('.') {
            service_type.clone()
        } else {
            format!("{service_type}.local.")
        };
        let receiver = match daemon.browse(&full_type) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, service_type, "legacy resolve browse failed to start");
                let _ = self
                    .callback_tx
                    .send(LegacyCallback::ResolutionFailed { global_id });
                return;
            }
        };
        let tx = self.callback_tx.clone();
        let wanted_name = service_name;
        let resolved_hosts = Arc::clone(&self.resolved_hosts);
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                if let ServiceEvent::ServiceResolved(info) = event {
                    let Some((instance, _rest)) = unescape_full_name(info.get_fullname()) else {
                        continue;
                    };
                    if instance != wanted_name {
                        continue;
                    }
                    let hostname = info.get_hostname().to_string();
                    let port = info.get_port();
                    let txt: HashMap<String, Vec<u8>> = info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val().unwrap_or_default().to_vec()))
                        .collect();
                    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                    if let Ok(mut cache) = resolved_hosts.lock() {
                        cache.insert(hostname.clone(), ResolvedHost { addresses });
                    }
                    let _ = tx.send(LegacyCallback::Resolved {
                        global_id,
                        hostname,
                        port,
                        txt,
                    });
                    break;
                }
            }
        });
    }
}

impl LegacyEngine for MdnsLegacyEngine {
    fn start_daemon(&mut self) -> Result<(), NsdError> {
        if self.daemon.is_some() {
            return Ok(());
        }
        let daemon = ServiceDaemon::new().map_err(|e| {
            error!(error = %e, "failed to start legacy mDNS daemon");
            NsdError::Internal
        })?;
        pin_to_interface(&daemon, self.network_interface.as_deref());
        self.daemon = Some(daemon);
        Ok(())
    }

    fn stop_daemon(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Ok(rx) = daemon.shutdown() {
                let _ = rx.recv();
            }
        }
        self.discoveries.clear();
        self.registrations.clear();
        self.resolves.clear();
        if let Ok(mut cache) = self.resolved_hosts.lock() {
            cache.clear();
        }
    }

    fn discover(&mut self, global_id: TransactionId, service_type: &str, _iface_idx: i32) -> bool {
        let full_type = if service_type.ends_with('.') {
            service_type.to_string()
        } else {
            format!("{service_type}.local.")
        };
        self.discoveries.insert(global_id, full_type.clone());
        self.spawn_browse_loop(global_id, full_type);
        true
    }

    fn register(&mut self, global_id: TransactionId, info: &ServiceInfo, _iface_idx: i32) -> bool {
        let Some(daemon) = &self.daemon else {
            return false;
        };
        let Some(name) = &info.service_name else {
            return false;
        };
        let full_type = format!("{}.local.", info.service_type);
        let host = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "nsd-broker".to_string())
        );
        let properties: HashMap<String, String> = info
            .txt_records
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).to_string()))
            .collect();
        let service_info = match MdnsServiceInfo::new(
            &full_type,
            name,
            &host,
            "",
            info.port.unwrap_or(0),
            properties,
        ) {
            Ok(si) => si.enable_addr_auto(),
            Err(e) => {
                warn!(error = %e, "failed to build legacy service info");
                return false;
            }
        };
        let fullname = service_info.get_fullname().to_string();
        match daemon.register(service_info) {
            Ok(()) => {
                self.registrations.insert(global_id, fullname);
                let _ = self
                    .callback_tx
                    .send(LegacyCallback::Registered { global_id });
                true
            }
            Err(e) => {
                warn!(error = %e, "legacy registration failed");
                let _ = self
                    .callback_tx
                    .send(LegacyCallback::RegistrationFailed { global_id });
                false
            }
        }
    }

    fn resolve(
        &mut self,
        global_id: TransactionId,
        service_name: &str,
        service_type: &str,
        iface_idx: i32,
    ) -> bool {
        if self.daemon.is_none() {
            return false;
        }
        self.resolves
            .insert(global_id, (service_name.to_string(), service_type.to_string()));
        self.spawn_resolve_loop(global_id, service_name.to_string(), service_type.to_string());
        let _ = iface_idx;
        true
    }

    fn get_service_address(
        &mut self,
        global_id: TransactionId,
        hostname: &str,
        iface_idx: i32,
    ) -> bool {
        let address = self
            .resolved_hosts
            .lock()
            .ok()
            .and_then(|cache| cache.get(hostname).and_then(|r| r.addresses.first().copied()));
        match address {
            Some(address) => {
                // `0` means "no specific network" (unset); only echo back a
                // network handle when the lookup actually resolved against one.
                let network = (iface_idx != 0).then_some(NetworkHandle(iface_idx as i64));
                let _ = self.callback_tx.send(LegacyCallback::GetAddrSuccess {
                    global_id,
                    network,
                    address,
                });
                true
            }
            None => {
                let _ = self
                    .callback_tx
                    .send(LegacyCallback::GetAddrFailed { global_id });
                false
            }
        }
    }

    fn stop_operation(&mut self, global_id: TransactionId) {
        if let Some(ty) = self.discoveries.remove(&global_id) {
            if let Some(daemon) = &self.daemon {
                let _ = daemon.stop_browse(&ty);
            }
        }
        if let Some(fullname) = self.registrations.remove(&global_id) {
            if let Some(daemon) = &self.daemon {
                if let Ok(rx) = daemon.unregister(&fullname) {
                    let _ = rx.recv();
                }
            }
        }
        self.resolves.remove(&global_id);
    }
}

fn convert_mdns_info(info: &MdnsServiceInfo) -> Option<ServiceInfo> {
    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    Some(ServiceInfo {
        service_name: Some(info.get_fullname().to_string()),
        service_type: info.get_type().to_string(),
        port: Some(info.get_port()),
        txt_records: info
            .get_properties()
            .iter()
            .map(|p| (p.key().to_string(), p.val().unwrap_or_default().to_vec()))
            .collect(),
        network: None,
        interface_index: None,
        host_addresses: addresses,
    })
}
