//! Tokio TCP transport
//!
//! Wraps a `TcpStream` in the non-blocking [`Transport`] contract: `read` and
//! `write` use `try_read`/`try_write` and never wait, while a reactor task
//! watches socket readiness and turns it into [`TransportEvents`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Transport, TransportEvents, TransportHandler};
use crate::error::{Error, Result};

/// State shared between the transport and its reactor task
#[derive(Default)]
struct ReactorShared {
    /// A write returned WouldBlock; report the next writable edge
    want_write: AtomicBool,
    /// A read returned 0 bytes
    eof: AtomicBool,
    /// Re-evaluate the readiness interest
    wake: Notify,
    shutdown: Notify,
}

struct Connection {
    stream: Arc<TcpStream>,
    shared: Arc<ReactorShared>,
    task: JoinHandle<()>,
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    connect_timeout: Duration,
    tcp_nodelay: bool,
    connection: Mutex<Option<Connection>>,
}

impl TcpTransport {
    /// Create a transport with a 10 second connect timeout and `TCP_NODELAY`
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            connection: Mutex::new(None),
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    fn current(&self) -> Result<(Arc<TcpStream>, Arc<ReactorShared>)> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| (c.stream.clone(), c.shared.clone()))
            .ok_or(Error::ConnectionClosed)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16, handler: Arc<dyn TransportHandler>) -> Result<()> {
        let addr = format!("{}:{}", host, port);

        let socket = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Io)?;

        if self.tcp_nodelay {
            socket.set_nodelay(true)?;
        }

        tracing::debug!(addr = %addr, "TCP connected");

        let stream = Arc::new(socket);
        let shared = Arc::new(ReactorShared::default());
        let task = tokio::spawn(run_reactor(stream.clone(), shared.clone(), handler));

        let previous = self.connection.lock().replace(Connection { stream, shared, task });
        if let Some(previous) = previous {
            shutdown(previous);
        }
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            tracing::debug!("TCP disconnect");
            shutdown(connection);
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (stream, shared) = self.current()?;
        match stream.try_read(buf) {
            Ok(0) if !buf.is_empty() => {
                shared.eof.store(true, Ordering::Release);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let (stream, shared) = self.current()?;
        match stream.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                shared.want_write.store(true, Ordering::Release);
                shared.wake.notify_one();
                Ok(0)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn shutdown(connection: Connection) {
    connection.shared.shutdown.notify_one();
    connection.task.abort();
}

/// Watch socket readiness and forward it to the handler
async fn run_reactor(stream: Arc<TcpStream>, shared: Arc<ReactorShared>, handler: Arc<dyn TransportHandler>) {
    handler.on_transport_event(TransportEvents::CONNECTED | TransportEvents::WRITABLE);

    loop {
        let mut interest = Interest::READABLE;
        if shared.want_write.load(Ordering::Acquire) {
            interest = interest.add(Interest::WRITABLE);
        }

        let ready = tokio::select! {
            ready = stream.ready(interest) => ready,
            _ = shared.wake.notified() => continue,
            _ = shared.shutdown.notified() => break,
        };

        match ready {
            Ok(ready) => {
                let mut events = TransportEvents::empty();
                if ready.is_readable() || ready.is_read_closed() {
                    events |= TransportEvents::READABLE;
                }
                if ready.is_writable() && shared.want_write.swap(false, Ordering::AcqRel) {
                    events |= TransportEvents::WRITABLE;
                }
                if !events.is_empty() {
                    handler.on_transport_event(events);
                }

                if ready.is_read_closed() || shared.eof.load(Ordering::Acquire) {
                    tracing::debug!("TCP peer closed the connection");
                    handler.on_transport_event(TransportEvents::END_OF_STREAM);
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "TCP readiness failed");
                handler.on_transport_event(TransportEvents::ERROR);
                break;
            }
        }
    }
}
