//! Client registry (spec §4.3): connector handle → client record.
//!
//! `ClientId` stands in for the spec's opaque "connector handle" — in this
//! implementation it is the identity the event loop hands back to a newly
//! accepted connector socket, not a network-visible value.

use crate::backends::BackendKind;
use nsd_core::error::NsdError;
use nsd_core::ipc::ServerEvent;
use nsd_core::types::{ListenerKey, NetworkHandle, ServiceInfo};
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    #[cfg(test)]
    pub fn for_test(raw: u64) -> Self {
        Self(raw)
    }
}

/// What kind of operation a stored request represents. Mirrors the spec's
/// `LegacyRequest(op_kind)` / `ManagedDiscoveryRequest` /
/// `ManagedAdvertiserRequest` tagged variants, flattened into one struct
/// since both backends share the same bookkeeping shape here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Discover,
    Register,
    Resolve,
    /// `register_service_info_callback` — the long-lived watch mode.
    Watch,
}

/// Two-stage legacy resolve's local state machine (spec §9): both stages
/// share the client's listener key but use distinct transaction ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyResolveStage {
    ResolvePending,
    AddrPending,
}

/// One outstanding client operation (spec's `ClientRequest`).
#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub kind: RequestKind,
    pub backend: BackendKind,
    pub global_id: nsd_core::types::TransactionId,
    pub service_type: String,
    pub service_name: Option<String>,
    pub network: Option<NetworkHandle>,
    pub legacy_stage: Option<LegacyResolveStage>,
}

/// Per-client state (spec's `ClientRecord`).
pub struct ClientRecord {
    pub sink: mpsc::Sender<ServerEvent>,
    pub requests: HashMap<ListenerKey, RequestEntry>,
    pub is_legacy_client: bool,
    pub resolved_scratch: Option<ServiceInfo>,
    pub watched_scratch: Option<ServiceInfo>,
    pub watched_listener_key: Option<ListenerKey>,
}

impl ClientRecord {
    fn new(sink: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            sink,
            requests: HashMap::new(),
            is_legacy_client: false,
            resolved_scratch: None,
            watched_scratch: None,
            watched_listener_key: None,
        }
    }
}

/// Global client registry, owned solely by the event loop (spec §5).
pub struct Registry {
    clients: HashMap<ClientId, ClientRecord>,
    next_client_id: u64,
    legacy_client_count: usize,
    legacy_request_count: usize,
    managed_request_count: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            legacy_client_count: 0,
            legacy_request_count: 0,
            managed_request_count: 0,
        }
    }

    pub fn register(&mut self, sink: mpsc::Sender<ServerEvent>) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.clients.insert(id, ClientRecord::new(sink));
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    /// Removes a client record wholesale. Callers (the event loop) are
    /// responsible for walking `requests` and issuing the matching backend
    /// teardown before dropping the returned record (spec §4.3 expungement,
    /// P5).
    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        let record = self.clients.remove(&id)?;
        if record.is_legacy_client {
            self.legacy_client_count = self.legacy_client_count.saturating_sub(1);
        }
        for entry in record.requests.values() {
            match entry.backend {
                BackendKind::Managed => {
                    self.managed_request_count = self.managed_request_count.saturating_sub(1);
                }
                BackendKind::Legacy => {
                    self.legacy_request_count = self.legacy_request_count.saturating_sub(1);
                }
            }
        }
        Some(record)
    }

    pub fn mark_legacy_client(&mut self, id: ClientId) {
        if let Some(record) = self.clients.get_mut(&id) {
            if !record.is_legacy_client {
                record.is_legacy_client = true;
                self.legacy_client_count += 1;
            }
        }
    }

    pub fn legacy_client_count(&self) -> usize {
        self.legacy_client_count
    }

    pub fn any_managed_request_exists(&self) -> bool {
        self.managed_request_count > 0
    }

    pub fn any_legacy_request_exists(&self) -> bool {
        self.legacy_request_count > 0
    }

    /// Inserts a new request for `client` under `listener_key`, enforcing
    /// the per-client cap (P2) and rejecting a duplicate key
    /// (`AlreadyActive`, used by resolve/watch — spec §4.5).
    pub fn insert_request(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
        entry: RequestEntry,
        max_requests: usize,
    ) -> Result<(), NsdError> {
        let record = self.clients.get_mut(&client).ok_or(NsdError::Internal)?;
        if record.requests.contains_key(&listener_key) {
            return Err(NsdError::AlreadyActive);
        }
        if record.requests.len() >= max_requests {
            return Err(NsdError::MaxLimit);
        }
        match entry.backend {
            BackendKind::Managed => self.managed_request_count += 1,
            BackendKind::Legacy => self.legacy_request_count += 1,
        }
        record.requests.insert(listener_key, entry);
        Ok(())
    }

    pub fn remove_request(
        &mut self,
        client: ClientId,
        listener_key: ListenerKey,
    ) -> Option<RequestEntry> {
        let record = self.clients.get_mut(&client)?;
        let entry = record.requests.remove(&listener_key)?;
        match entry.backend {
            BackendKind::Managed => {
                self.managed_request_count = self.managed_request_count.saturating_sub(1);
            }
            BackendKind::Legacy => {
                self.legacy_request_count = self.legacy_request_count.saturating_sub(1);
            }
        }
        Some(entry)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsd_core::types::TransactionId;

    fn dummy_sink() -> mpsc::Sender<ServerEvent> {
        mpsc::channel(1).0
    }

    fn dummy_entry(global_id: u32) -> RequestEntry {
        RequestEntry {
            kind: RequestKind::Discover,
            backend: BackendKind::Legacy,
            global_id: TransactionId::from_raw(global_id),
            service_type: "_http._tcp".to_string(),
            service_name: None,
            network: None,
            legacy_stage: None,
        }
    }

    #[test]
    fn cap_is_enforced() {
        let mut registry = Registry::new();
        let client = registry.register(dummy_sink());
        for i in 0..10 {
            registry
                .insert_request(client, ListenerKey::new(i), dummy_entry(i as u32 + 1), 10)
                .unwrap();
        }
        let err = registry
            .insert_request(client, ListenerKey::new(10), dummy_entry(11), 10)
            .unwrap_err();
        assert_eq!(err, NsdError::MaxLimit);
    }

    #[test]
    fn duplicate_listener_key_is_already_active() {
        let mut registry = Registry::new();
        let client = registry.register(dummy_sink());
        registry
            .insert_request(client, ListenerKey::new(1), dummy_entry(1), 10)
            .unwrap();
        let err = registry
            .insert_request(client, ListenerKey::new(1), dummy_entry(2), 10)
            .unwrap_err();
        assert_eq!(err, NsdError::AlreadyActive);
    }

    #[test]
    fn legacy_client_count_tracks_flag() {
        let mut registry = Registry::new();
        let a = registry.register(dummy_sink());
        let b = registry.register(dummy_sink());
        registry.mark_legacy_client(a);
        assert_eq!(registry.legacy_client_count(), 1);
        registry.mark_legacy_client(a);
        assert_eq!(registry.legacy_client_count(), 1, "marking twice must not double-count");
        registry.remove(a);
        assert_eq!(registry.legacy_client_count(), 0);
        let _ = b;
    }

    #[test]
    fn managed_request_count_tracks_inserts_and_removes() {
        let mut registry = Registry::new();
        let client = registry.register(dummy_sink());
        let mut entry = dummy_entry(1);
        entry.backend = BackendKind::Managed;
        registry
            .insert_request(client, ListenerKey::new(1), entry, 10)
            .unwrap();
        assert!(registry.any_managed_request_exists());
        registry.remove_request(client, ListenerKey::new(1));
        assert!(!registry.any_managed_request_exists());
    }
}
