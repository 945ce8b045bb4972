//! Unix socket IPC server for connector connections (spec §6.1).
//!
//! The broker exposes a Unix domain socket that connectors dial into. Each
//! connection gets its own task: a `RegisterClient` message mints a
//! [`ClientId`] and a private `ServerEvent` sink, then the task loops reading
//! `ClientRequest` lines off the socket (translating each into a
//! [`LoopMessage`] for the event loop) while draining its sink and writing
//! `ServerEvent` lines back out. Disconnection sends `UnregisterClient`,
//! which expunges every request the client held (spec §4.3, P5).
//!
//! Multiple connectors can be attached at once; each is independent — there
//! is no broadcast channel here, unlike the teacher's shared-event-stream
//! IPC server, because every `ServerEvent` already carries the listener key
//! of the single connector that started the operation it answers.

use crate::eventloop::LoopMessage;
use crate::registry::ClientId;
use nsd_core::ipc::{self, ClientRequest, ServerEvent};
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Backlog depth for a single connector's outbound `ServerEvent` sink.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The IPC server managing the Unix socket connectors dial into.
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    /// Binds to `socket_path`, removing a stale socket file left behind by a
    /// previous crash first.
    pub async fn bind(socket_path: &Path) -> Result<Self, std::io::Error> {
        if socket_path.exists() {
            info!(path = %socket_path.display(), "removing stale socket file");
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "IPC server listening");
        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the accept loop, spawning one handler task per connection. Each
    /// handler is handed its own clone of `messages` to post `LoopMessage`s
    /// to the event loop.
    pub async fn accept_loop(self, messages: mpsc::UnboundedSender<LoopMessage>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("accepted connector connection");
                    let messages = messages.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connector(stream, messages).await {
                            debug!(error = %e, "connector disconnected");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connector connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    path = %self.socket_path.display(),
                    error = %e,
                    "failed to remove socket file on shutdown"
                );
            } else {
                debug!(path = %self.socket_path.display(), "removed socket file");
            }
        }
    }
}

/// Translates one [`ClientRequest`] into the [`LoopMessage`] the event loop
/// expects, binding it to `client`.
fn to_loop_message(client: ClientId, request: ClientRequest) -> LoopMessage {
    match request {
        ClientRequest::DiscoverServices {
            listener_key,
            service_type,
            network,
        } => LoopMessage::Discover {
            client,
            listener_key,
            service_type,
            network,
        },
        ClientRequest::StopServiceDiscovery { listener_key } => LoopMessage::StopDiscovery {
            client,
            listener_key,
        },
        ClientRequest::RegisterService { listener_key, info } => LoopMessage::Register {
            client,
            listener_key,
            info,
        },
        ClientRequest::UnregisterService { listener_key } => LoopMessage::Unregister {
            client,
            listener_key,
        },
        ClientRequest::ResolveService {
            listener_key,
            service_name,
            service_type,
            network,
        } => LoopMessage::Resolve {
            client,
            listener_key,
            service_name,
            service_type,
            network,
        },
        ClientRequest::StopServiceResolution { listener_key } => LoopMessage::StopResolution {
            client,
            listener_key,
        },
        ClientRequest::WatchRegisteredService {
            listener_key,
            service_name,
            service_type,
            network,
        } => LoopMessage::WatchRegisteredService {
            client,
            listener_key,
            service_name,
            service_type,
            network,
        },
        ClientRequest::StopWatch { listener_key } => LoopMessage::StopWatch {
            client,
            listener_key,
        },
        ClientRequest::DaemonStartup => LoopMessage::DaemonStartup { client },
    }
}

/// Handles a single connector: registers a [`ClientId`], then loops reading
/// request lines and draining the reply sink until either side closes.
async fn handle_connector(
    stream: UnixStream,
    messages: mpsc::UnboundedSender<LoopMessage>,
) -> Result<(), ipc::IpcError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (sink, mut events) = mpsc::channel::<ServerEvent>(EVENT_CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = oneshot::channel();
    if messages
        .send(LoopMessage::RegisterClient {
            sink,
            reply: reply_tx,
        })
        .is_err()
    {
        return Err(ipc::IpcError::ConnectionClosed);
    }
    let Ok(client) = reply_rx.await else {
        return Err(ipc::IpcError::ConnectionClosed);
    };

    let result = loop {
        tokio::select! {
            request = ipc::read_request(&mut reader) => {
                match request {
                    Ok(request) => {
                        if messages.send(to_loop_message(client, request)).is_err() {
                            break Ok(());
                        }
                    }
                    Err(ipc::IpcError::ConnectionClosed) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            Some(event) = events.recv() => {
                if let Err(e) = ipc::write_event(&mut write_half, &event).await {
                    break Err(e);
                }
            }
        }
    };

    let _ = messages.send(LoopMessage::UnregisterClient { client });
    result
}
