//! Managed backend: a second, independent `mdns-sd` daemon instance.
//!
//! Modeled as a distinct engine from the legacy one (spec treats them as two
//! separate collaborators with independent lifecycles) even though both
//! adapters happen to be built on the same underlying crate here. Discover
//! and resolve are both listener registrations distinguished only by
//! `resolve_instance_name` (spec §4.5); resolve is one-shot and unregisters
//! itself on success, unlike legacy's explicit two-stage handshake.

use super::{pin_to_interface, ManagedAdvertiser, ManagedCallback, ManagedDiscoveryManager};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo as MdnsServiceInfo};
use nsd_core::error::NsdError;
use nsd_core::names::unescape_full_name;
use nsd_core::types::{NetworkHandle, ServiceInfo, TransactionId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

pub struct MdnsManagedEngine {
    daemon: ServiceDaemon,
    callback_tx: mpsc::UnboundedSender<ManagedCallback>,
    /// global_id -> browsed type, for unregister_listener.
    listeners: HashMap<TransactionId, String>,
    /// global_id -> advertised fullname, for remove_service.
    advertisements: HashMap<TransactionId, String>,
}

impl MdnsManagedEngine {
    pub fn new(
        callback_tx: mpsc::UnboundedSender<ManagedCallback>,
        network_interface: Option<&str>,
    ) -> Result<Self, NsdError> {
        let daemon = ServiceDaemon::new().map_err(|_| NsdError::Internal)?;
        pin_to_interface(&daemon, network_interface);
        Ok(Self {
            daemon,
            callback_tx,
            listeners: HashMap::new(),
            advertisements: HashMap::new(),
        })
    }
}

impl ManagedDiscoveryManager for MdnsManagedEngine {
    fn register_listener(
        &mut self,
        global_id: TransactionId,
        service_type: &str,
        _network: Option<NetworkHandle>,
        resolve_instance_name: Option<&str>,
    ) -> Result<(), NsdError> {
        let full_type = if service_type.ends_with('.') {
            service_type.to_string()
        } else {
            format!("{service_type}.local.")
        };
        let receiver = self.daemon.browse(&full_type).map_err(|e| {
            warn!(error = %e, service_type, "managed browse failed to start");
            NsdError::Internal
        })?;
        self.listeners.insert(global_id, full_type);
        let tx = self.callback_tx.clone();
        let wanted_instance = resolve_instance_name.map(|s| s.to_string());
        let one_shot = wanted_instance.is_some();
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if let Some(wanted) = &wanted_instance {
                            let matches = unescape_full_name(info.get_fullname())
                                .map(|(instance, _)| &instance == wanted)
                                .unwrap_or(false);
                            if !matches {
                                continue;
                            }
                            let service_info = convert_mdns_info(&info);
                            let _ = tx.send(ManagedCallback::ResolveSucceeded {
                                global_id,
                                info: service_info,
                            });
                            break;
                        } else {
                            let service_info = convert_mdns_info(&info);
                            if tx
                                .send(ManagedCallback::Found {
                                    global_id,
                                    info: service_info,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        if wanted_instance.is_some() {
                            continue;
                        }
                        let info = ServiceInfo {
                            service_name: Some(fullname),
                            service_type: String::new(),
                            ..Default::default()
                        };
                        if tx
                            .send(ManagedCallback::Lost { global_id, info })
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            if one_shot {
                // resolve is single-shot; nothing further to forward.
            }
        });
        Ok(())
    }

    fn unregister_listener(&mut self, global_id: TransactionId) {
        if let Some(ty) = self.listeners.remove(&global_id) {
            let _ = self.daemon.stop_browse(&ty);
        }
    }
}

impl ManagedAdvertiser for MdnsManagedEngine {
    fn add_service(&mut self, global_id: TransactionId, info: &ServiceInfo) -> Result<(), NsdError> {
        let Some(name) = &info.service_name else {
            return Err(NsdError::BadParameters);
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
        let service_info = MdnsServiceInfo::new(
            &full_type,
            name,
            &host,
            "",
            info.port.unwrap_or(0),
            properties,
        )
        .map_err(|_| NsdError::BadParameters)?
        .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info).map_err(|e| {
            warn!(error = %e, "managed registration failed");
            NsdError::Internal
        })?;
        self.advertisements.insert(global_id, fullname);
        let _ = self.callback_tx.send(ManagedCallback::RegisterSucceeded {
            global_id,
            info: info.clone(),
        });
        Ok(())
    }

    fn remove_service(&mut self, global_id: TransactionId) {
        if let Some(fullname) = self.advertisements.remove(&global_id) {
            if let Ok(rx) = self.daemon.unregister(&fullname) {
                let _ = rx.recv();
            }
        }
    }
}

fn convert_mdns_info(info: &MdnsServiceInfo) -> ServiceInfo {
    ServiceInfo {
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
        host_addresses: info.get_addresses().iter().copied().collect(),
    }
}
