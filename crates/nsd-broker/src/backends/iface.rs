//! Network-interface resolver (spec §4.5, §6): maps an opaque
//! [`NetworkHandle`] to an OS interface index, or the `0` sentinel meaning
//! "no usable interface" (IFACE_ANY, or the network has gone away).
//!
//! Grounded in the teacher's `discovery.rs`, which already reaches for
//! `netdev` to resolve the default-route interface for mDNS; here the lookup
//! is by index rather than by default-route, since a [`NetworkHandle`] is a
//! specific network a client asked about, not "whichever one is default".

use super::InterfaceResolver;
use nsd_core::types::NetworkHandle;

/// Resolves a `NetworkHandle`'s raw value against the OS's current interface
/// list via `netdev`, treating the handle as an interface index.
pub struct NetdevInterfaceResolver;

impl InterfaceResolver for NetdevInterfaceResolver {
    fn resolve(&self, network: Option<NetworkHandle>) -> i32 {
        let Some(handle) = network else {
            return 0;
        };
        let Ok(wanted) = u32::try_from(handle.0) else {
            return 0;
        };
        netdev::get_interfaces()
            .into_iter()
            .find(|iface| iface.index == wanted)
            .map(|iface| iface.index as i32)
            .unwrap_or(0)
    }
}
