//! Transaction index: broker-global id → owning client (spec §4.1, §4.6).
//!
//! A weak, lookup-only back-reference (spec §9): it never owns a
//! `ClientRecord`, only points at one by [`ClientId`] + [`ListenerKey`].
//! Ownership runs the other way, through [`crate::registry::Registry`].
//! Keeping the two in sync on every insert/remove is what P1 (bijection)
//! requires.

use crate::registry::ClientId;
use nsd_core::types::{ListenerKey, TransactionId};
use std::collections::HashMap;

pub struct TransactionIndex {
    map: HashMap<TransactionId, (ClientId, ListenerKey)>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn insert(&mut self, global_id: TransactionId, client: ClientId, listener_key: ListenerKey) {
        self.map.insert(global_id, (client, listener_key));
    }

    pub fn remove(&mut self, global_id: TransactionId) -> Option<(ClientId, ListenerKey)> {
        self.map.remove(&global_id)
    }

    pub fn lookup(&self, global_id: TransactionId) -> Option<(ClientId, ListenerKey)> {
        self.map.get(&global_id).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for TransactionIndex {
    fn default() -> Self {
        Self::new()
    }
}
