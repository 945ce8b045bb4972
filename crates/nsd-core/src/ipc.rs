//! Wire protocol between a connector (client) and the broker (spec §6.1).
//!
//! # Wire Format
//!
//! Each message is one JSON object followed by `\n` ("JSON lines"). Unlike
//! the length-prefixed MessagePack framing the daemon uses for its peer
//! protocol, this boundary is client-facing and line-oriented, so a plain
//! newline delimiter keeps it easy to inspect with `nc` or `jq` during
//! development.
//!
//! # Message Types
//!
//! - [`ClientRequest`]: an operation a connector asks the broker to perform
//!   (discover, register, resolve, watch, and their matching stop/unregister
//!   calls).
//! - [`ServerEvent`]: an engine callback or synchronous rejection the broker
//!   reports back, tagged with the [`ListenerKey`] the connector used to
//!   start the operation (spec §4.3, §5 — the broker never surfaces its own
//!   `TransactionId` across this boundary).

use crate::error::NsdError;
use crate::types::{ListenerKey, NetworkHandle, ServiceInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Maximum line length accepted from a connector. Guards against a
/// misbehaving or malicious client holding a connection open while streaming
/// an unbounded line.
const MAX_LINE_LENGTH: usize = 1_048_576;

/// Errors that can occur while framing or parsing a line on the connector
/// socket.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line too long: {len} bytes (max {MAX_LINE_LENGTH})")]
    LineTooLong { len: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// A request a connector sends to the broker, tagged with the
/// [`ListenerKey`] the connector chose to identify the resulting operation.
///
/// `DiscoverServices`/`RegisterService`/`ResolveService`/`WatchRegisteredService`
/// each start a new entry in that client's request table (spec §4.3); the
/// matching `Stop*`/`UnregisterService` ends it. The broker enforces the
/// per-client `MAX_LIMIT` and duplicate-key rejection before touching any
/// backend (spec §4.1, §7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op")]
pub enum ClientRequest {
    /// Begin browsing for instances of `service_type` on `network` (`None`
    /// meaning the legacy IFACE_ANY convention — see `nsd-broker::backends`).
    DiscoverServices {
        listener_key: ListenerKey,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    /// End a discovery started with `DiscoverServices` under the same key.
    StopServiceDiscovery { listener_key: ListenerKey },
    /// Advertise `info` on the network. `info.service_name` and
    /// `info.service_type` are required.
    RegisterService {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// Withdraw a registration started with `RegisterService` under the
    /// same key.
    UnregisterService { listener_key: ListenerKey },
    /// Resolve one instance (`service_name`/`service_type`/`network`) to its
    /// host, port, and addresses.
    ResolveService {
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    /// Cancel a resolve in flight under the same key.
    StopServiceResolution { listener_key: ListenerKey },
    /// Long-lived resolve that also reports loss, correlated against a
    /// parallel discovery stream for the same service type (spec §4.1,
    /// "watch registered service").
    WatchRegisteredService {
        listener_key: ListenerKey,
        service_name: String,
        service_type: String,
        network: Option<NetworkHandle>,
    },
    /// End a watch started with `WatchRegisteredService` under the same key.
    StopWatch { listener_key: ListenerKey },
    /// Mark this connector as a legacy client and start the legacy daemon
    /// if it isn't already running (spec §6, "legacy clients only"). No
    /// reply is sent; failures are logged broker-side.
    DaemonStartup,
}

/// An event the broker sends a connector: either the outcome of a request
/// (success or [`NsdError`]) or an unsolicited callback from an ongoing
/// operation (a service found/lost, a registration confirmed).
///
/// Every variant carries the [`ListenerKey`] of the request it answers or
/// continues, so a connector with several concurrent operations can route
/// events to the right local handler without the broker's internal
/// transaction id ever crossing this boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// A request was rejected before (or instead of) reaching a backend —
    /// bad parameters, duplicate key, or per-client limit (spec §7).
    RequestFailed {
        listener_key: ListenerKey,
        error: NsdError,
    },
    /// A discovery operation found a matching instance.
    ServiceFound {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// A previously-found instance is no longer present.
    ServiceLost {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// A discovery or watch's underlying browse ended unexpectedly (engine
    /// failure, collaborator unavailable).
    DiscoveryFailed {
        listener_key: ListenerKey,
        error: NsdError,
    },
    /// A registration was accepted and is now advertised.
    ServiceRegistered {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// A registration was rejected by the backend (e.g. name collision).
    RegistrationFailed {
        listener_key: ListenerKey,
        error: NsdError,
    },
    /// A resolve (one-shot or watch) produced a full address.
    ServiceResolved {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// A resolve failed (timeout, engine error, or no matching instance).
    ResolutionFailed {
        listener_key: ListenerKey,
        error: NsdError,
    },
    /// A watch (`WatchRegisteredService`) re-resolved its service with a
    /// fresh address (spec §6 `register_service_info_callback`'s
    /// `service-updated`). Distinct from `ServiceResolved` so a client can
    /// tell a long-lived watch update from a one-shot resolve.
    ServiceUpdated {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// A watched service was lost, correlated against a matching discovery
    /// stream (spec §6 `service-updated-lost`). Distinct from
    /// `ServiceLost`, which is a plain discovery loss.
    ServiceUpdatedLost {
        listener_key: ListenerKey,
        info: ServiceInfo,
    },
    /// `WatchRegisteredService` was rejected before reaching a backend
    /// (spec §6 `callback-registration-failed`): bad parameters or a watch
    /// already active under this listener key.
    CallbackRegistrationFailed {
        listener_key: ListenerKey,
        error: NsdError,
    },
}

/// Serializes a [`ClientRequest`] to one JSON-line frame (payload + `\n`).
pub fn encode_request(req: &ClientRequest) -> Result<Vec<u8>, IpcError> {
    let mut line = serde_json::to_vec(req)?;
    line.push(b'\n');
    Ok(line)
}

/// Deserializes a [`ClientRequest`] from a single line (without the
/// trailing newline).
pub fn decode_request(line: &[u8]) -> Result<ClientRequest, IpcError> {
    Ok(serde_json::from_slice(line)?)
}

/// Serializes a [`ServerEvent`] to one JSON-line frame (payload + `\n`).
pub fn encode_event(event: &ServerEvent) -> Result<Vec<u8>, IpcError> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

/// Deserializes a [`ServerEvent`] from a single line (without the trailing
/// newline).
pub fn decode_event(line: &[u8]) -> Result<ServerEvent, IpcError> {
    Ok(serde_json::from_slice(line)?)
}

/// Writes one [`ClientRequest`] line to an async writer and flushes it.
pub async fn write_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &ClientRequest,
) -> Result<(), IpcError> {
    let line = encode_request(req)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one [`ServerEvent`] line to an async writer and flushes it.
pub async fn write_event<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    event: &ServerEvent,
) -> Result<(), IpcError> {
    let line = encode_event(event)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one line from a buffered async reader and decodes it as a
/// [`ClientRequest`]. Returns [`IpcError::ConnectionClosed`] on a clean EOF
/// (zero bytes read before any newline).
pub async fn read_request<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> Result<ClientRequest, IpcError> {
    let line = read_line(reader).await?;
    decode_request(line.as_bytes())
}

/// Reads one line from a buffered async reader and decodes it as a
/// [`ServerEvent`]. Returns [`IpcError::ConnectionClosed`] on a clean EOF.
pub async fn read_event<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> Result<ServerEvent, IpcError> {
    let line = read_line(reader).await?;
    decode_event(line.as_bytes())
}

async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<String, IpcError> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Err(IpcError::ConnectionClosed);
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(IpcError::LineTooLong { len: line.len() });
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
