//! Domain types for the NSD broker.
//!
//! `TransactionId` and `ListenerKey` are newtypes (see the teacher's
//! `PeerId`/`MessageId` pattern) so that a broker-global transaction id can
//! never be silently passed where a client-local listener key is expected,
//! even though both are plain integers underneath.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

// ---------------------------------------------------------------------------
// TransactionId — broker-global id used to correlate engine callbacks
// ---------------------------------------------------------------------------

/// A broker-allocated id identifying one operation across the boundary to an
/// mDNS engine. Never zero — zero is the reserved "invalid" sentinel (I8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u32);

impl TransactionId {
    /// The reserved invalid value. Never issued by the allocator.
    pub const INVALID: TransactionId = TransactionId(0);

    /// Wraps a raw id. Only the allocator (`crate::ids` in `nsd-broker`)
    /// should construct non-invalid values.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ListenerKey — client-chosen label for one of its own operations
// ---------------------------------------------------------------------------

/// A key the *client* chose to label one of its own operations. Unique only
/// within that client's connector, never compared across clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerKey(i32);

impl ListenerKey {
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// NetworkHandle — opaque numeric network identifier
// ---------------------------------------------------------------------------

/// An opaque numeric network id, as handed to the broker by a client or
/// returned by an engine callback. `0` conventionally means "no specific
/// network" (see the legacy IFACE_ANY convention in `nsd-broker::backends`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkHandle(pub i64);

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ServiceInfo — the value type passed across every broker operation
// ---------------------------------------------------------------------------

/// Describes a service: what a client asks the broker to discover, register,
/// resolve, or watch, and what the broker hands back once an engine resolves
/// or discovers one.
///
/// Not every field is meaningful for every operation — e.g. `host_addresses`
/// is empty on a `discover_services` request and populated on a
/// `service-found`/`resolve-succeeded` callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    /// Instance name. Required to register, optional to discover (only the
    /// service type matters there). Truncated to 63 UTF-8 bytes on register
    /// (see `crate::names::truncate_instance_name`).
    pub service_name: Option<String>,
    /// Service type, e.g. `_ipp._tcp`. Validated by
    /// `crate::names::validate_service_type` before use.
    pub service_type: String,
    pub port: Option<u16>,
    /// TXT attributes. Insertion order is not meaningful.
    #[serde(default)]
    pub txt_records: HashMap<String, Vec<u8>>,
    pub network: Option<NetworkHandle>,
    pub interface_index: Option<i32>,
    #[serde(default)]
    pub host_addresses: Vec<IpAddr>,
}

impl ServiceInfo {
    /// A bare service-type-only info, as used for `discover_services`.
    pub fn for_discovery(service_type: impl Into<String>, network: Option<NetworkHandle>) -> Self {
        Self {
            service_type: service_type.into(),
            network,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_invalid_is_zero() {
        assert!(!TransactionId::INVALID.is_valid());
        assert_eq!(TransactionId::INVALID.raw(), 0);
    }

    #[test]
    fn transaction_id_nonzero_is_valid() {
        assert!(TransactionId::from_raw(1).is_valid());
    }

    #[test]
    fn service_info_for_discovery_has_no_name() {
        let info = ServiceInfo::for_discovery("_http._tcp", None);
        assert_eq!(info.service_name, None);
        assert_eq!(info.service_type, "_http._tcp");
    }

    #[test]
    fn service_info_serde_json_roundtrip() {
        let mut info = ServiceInfo::for_discovery("_ipp._tcp", Some(NetworkHandle(42)));
        info.service_name = Some("Printer".to_string());
        info.port = Some(631);
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, parsed);
    }
}
