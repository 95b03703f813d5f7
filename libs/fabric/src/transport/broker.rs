use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use circuit_core::{Error, Result};

use crate::codec::BincodeCodec;
use crate::transport::frame::{read_frame, write_frame, Frame};

type ClientId = u64;

#[derive(Default)]
struct Registry {
    next_id: ClientId,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Frame>>,
    channels: HashMap<String, HashSet<ClientId>>,
}

impl Registry {
    fn remove(&mut self, id: ClientId) {
        self.clients.remove(&id);
        self.channels.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }
}

/// TCP pub/sub hub connecting circuits across processes
///
/// Each `Publish` frame is forwarded to every client subscribed to its
/// channel, the publisher included. Payloads for channels without
/// subscribers are dropped.
pub struct Broker {
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
}

impl Broker {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    /// Get the local address this broker is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Accept clients until the listener fails
    ///
    /// Client sessions belong to this future: dropping it, or the listener
    /// failing, closes every client connection.
    pub async fn run(self) -> Result<()> {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let id = {
                        let mut registry = lock(&self.registry);
                        registry.next_id += 1;
                        registry.next_id
                    };
                    debug!(client = id, %peer, "Broker accepted client");
                    clients.spawn(serve_client(id, stream, self.registry.clone()));
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }
    }

    /// Run the accept loop on a background task
    ///
    /// Aborting the returned handle shuts the broker down.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_client(id: ClientId, stream: TcpStream, registry: Arc<Mutex<Registry>>) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
    lock(&registry).clients.insert(id, outbound);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &BincodeCodec, &frame).await {
                warn!(client = id, error = %e, "Broker write failed");
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader, &BincodeCodec).await {
            Ok(Frame::Subscribe { channel }) => {
                trace!(client = id, channel = %channel, "Client subscribed");
                lock(&registry).channels.entry(channel).or_default().insert(id);
            }
            Ok(Frame::Publish { channel, payload }) => {
                let guard = lock(&registry);
                let Some(members) = guard.channels.get(&channel) else {
                    trace!(channel = %channel, "No subscribers, payload dropped");
                    continue;
                };
                for member in members {
                    if let Some(client) = guard.clients.get(member) {
                        let _ = client.send(Frame::Deliver {
                            channel: channel.clone(),
                            payload: payload.clone(),
                        });
                    }
                }
            }
            Ok(frame) => {
                warn!(client = id, ?frame, "Unexpected frame from client");
            }
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                warn!(client = id, error = %e, "Broker read failed");
                break;
            }
        }
    }

    lock(&registry).remove(id);
    writer_task.abort();
    debug!(client = id, "Broker dropped client");
}
