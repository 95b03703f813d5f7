use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use circuit_core::{Envelope, Error, Result, Serializer, Subscription, Transport};

use crate::codec::BincodeCodec;
use crate::delivery::Mailbox;
use crate::serializer::JsonSerializer;
use crate::transport::frame::{read_frame, write_frame, Frame};

type Mailboxes = Arc<Mutex<HashMap<String, Vec<Mailbox>>>>;

struct Connection {
    outbound: mpsc::UnboundedSender<Frame>,
    subscribers: Mailboxes,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    /// Cleared by the reader or writer task when the socket dies
    alive: Arc<AtomicBool>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Broker client speaking length-prefixed bincode frames
///
/// Envelopes travel as text produced by the configured [`Serializer`].
pub struct TcpTransport {
    address: SocketAddr,
    connect_timeout: Option<Duration>,
    serializer: Arc<dyn Serializer>,
    connection: Mutex<Option<Connection>>,
}

impl TcpTransport {
    /// Transport for the broker at `addr` with default settings
    pub fn new(addr: SocketAddr) -> Self {
        Self::builder().address(addr).build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let guard = self.connection();
        let connection = guard.as_ref().ok_or(Error::NotConnected)?;
        if !connection.is_alive() {
            return Err(Error::ConnectionClosed);
        }
        connection
            .outbound
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        {
            let mut guard = self.connection();
            match guard.as_ref() {
                Some(connection) if connection.is_alive() => {
                    return Err(Error::AlreadyConnected);
                }
                Some(_) => {
                    if let Some(stale) = guard.take() {
                        debug!(broker = %self.address, "Dropping dead broker connection");
                        stale.abort();
                    }
                }
                None => {}
            }
        }

        let connect_op = TcpStream::connect(self.address);
        let stream = if let Some(timeout) = self.connect_timeout {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| Error::Custom("Connect timeout exceeded".to_string()))??
        } else {
            connect_op.await?
        };

        let (reader, mut writer) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
        let subscribers: Mailboxes = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = alive.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = write_frame(&mut writer, &BincodeCodec, &frame).await {
                    warn!(error = %e, "Broker write failed");
                    writer_alive.store(false, Ordering::Release);
                    break;
                }
            }
        });
        let reader_alive = alive.clone();
        let dispatcher = dispatch(reader, subscribers.clone(), self.serializer.clone());
        let reader = tokio::spawn(async move {
            dispatcher.await;
            reader_alive.store(false, Ordering::Release);
        });

        let mut guard = self.connection();
        if guard.is_some() {
            reader.abort();
            writer.abort();
            return Err(Error::AlreadyConnected);
        }
        *guard = Some(Connection {
            outbound,
            subscribers,
            reader,
            writer,
            alive,
        });

        debug!(broker = %self.address, "TCP transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = self.connection().take().ok_or(Error::NotConnected)?;
        if !connection.is_alive() {
            connection.abort();
            return Err(Error::NotConnected);
        }

        let Connection {
            outbound,
            reader,
            writer,
            ..
        } = connection;

        // Let frames published just before disconnecting reach the broker
        drop(outbound);
        let flush = writer.abort_handle();
        if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
            warn!(broker = %self.address, "Outbound frames not flushed before disconnect");
            flush.abort();
        }
        reader.abort();

        debug!(broker = %self.address, "TCP transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection().as_ref().is_some_and(Connection::is_alive)
    }

    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<()> {
        let payload = self.serializer.serialize(&envelope)?;
        self.send_frame(Frame::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<()> {
        let guard = self.connection();
        let connection = guard.as_ref().ok_or(Error::NotConnected)?;
        if !connection.is_alive() {
            return Err(Error::ConnectionClosed);
        }

        let mut subscribers = connection
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mailboxes = subscribers.entry(channel.to_string()).or_default();

        // The broker only needs to hear about a channel once per connection
        if mailboxes.is_empty() {
            connection
                .outbound
                .send(Frame::Subscribe {
                    channel: channel.to_string(),
                })
                .map_err(|_| Error::ConnectionClosed)?;
        }
        mailboxes.push(Mailbox::spawn(subscription));

        Ok(())
    }
}

async fn dispatch(
    mut reader: OwnedReadHalf,
    subscribers: Mailboxes,
    serializer: Arc<dyn Serializer>,
) {
    loop {
        let (channel, payload) = match read_frame(&mut reader, &BincodeCodec).await {
            Ok(Frame::Deliver { channel, payload }) => (channel, payload),
            Ok(frame) => {
                warn!(?frame, "Unexpected frame from broker");
                continue;
            }
            Err(Error::ConnectionClosed) => {
                debug!("Broker closed the connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Broker read failed");
                return;
            }
        };

        let envelope = match serializer.deserialize(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Undecodable envelope dropped");
                continue;
            }
        };

        let guard = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mailboxes) = guard.get(&channel) {
            for mailbox in mailboxes {
                mailbox.post(envelope.clone());
            }
            trace!(channel = %channel, receivers = mailboxes.len(), "Envelope delivered");
        }
    }
}

/// Builder for configuring TCP transport
pub struct TcpTransportBuilder {
    address: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    serializer: Arc<dyn Serializer>,
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout: None,
            serializer: Arc::new(JsonSerializer),
        }
    }
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker address to connect to
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the envelope serializer (JSON by default)
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Build the transport; connecting happens through [`Transport::connect`]
    ///
    /// Without an address the transport targets `127.0.0.1:6380`.
    pub fn build(self) -> TcpTransport {
        TcpTransport {
            address: self
                .address
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))),
            connect_timeout: self.connect_timeout,
            serializer: self.serializer,
            connection: Mutex::new(None),
        }
    }
}

/// Port used when no broker address is configured
pub const DEFAULT_PORT: u16 = 6380;

/// Upper bound on draining queued frames during disconnect
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
