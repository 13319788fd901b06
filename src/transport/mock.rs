//! In-memory transport for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Transport, TransportEvents, TransportHandler};
use crate::error::{Error, Result};

#[derive(Default)]
pub(crate) struct MockTransport {
    written: Mutex<Vec<u8>>,
    inbound: Mutex<VecDeque<u8>>,
    /// Bytes `write` may still accept; `None` is unlimited
    write_budget: Mutex<Option<usize>>,
    fail_writes: AtomicBool,
    endpoint: Mutex<Option<(String, u16)>>,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    pub(crate) disconnects: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn endpoint(&self) -> Option<(String, u16)> {
        self.endpoint.lock().clone()
    }

    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().extend(bytes.iter().copied());
    }

    pub(crate) fn set_write_budget(&self, budget: Option<usize>) {
        *self.write_budget.lock() = budget;
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub(crate) fn written_len(&self) -> usize {
        self.written.lock().len()
    }

    pub(crate) fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Deliver events to the registered handler, as a reactor would
    pub(crate) fn fire(&self, events: TransportEvents) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_transport_event(events);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, host: &str, port: u16, handler: Arc<dyn TransportHandler>) -> Result<()> {
        *self.endpoint.lock() = Some((host.to_string(), port));
        *self.handler.lock() = Some(handler);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.handler.lock().take();
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock();
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("write failed".into()));
        }
        let mut budget = self.write_budget.lock();
        let n = match *budget {
            Some(remaining) => {
                let n = remaining.min(buf.len());
                *budget = Some(remaining - n);
                n
            }
            None => buf.len(),
        };
        self.written.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }
}
