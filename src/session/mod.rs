//! RTMP publishing session
//!
//! [`RtmpSession`] drives one connection through its lifecycle:
//! - Transport connect and the C0/C1/C2 handshake
//! - `SetChunkSize` and the `connect` command once the handshake completes
//! - Inbound protocol control and command replies
//! - Congestion-aware outbound writes and bandwidth sampling
//!
//! Inbound bytes are staged in a fixed [`RingBuffer`]. Until the handshake is
//! complete they are consumed one handshake unit at a time; afterwards they
//! go through the chunk decoder.

pub mod ring_buffer;
pub mod status;
pub mod writer;

use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{RtmpUrl, SessionConfig};
use crate::error::{Error, HandshakeError, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, Message};
use crate::protocol::constants::{CMD_ON_STATUS, CMD_RESULT, CONNECT_TRANSACTION_ID, DEFAULT_CHUNK_SIZE};
use crate::protocol::handshake::{Handshake, HandshakeUnit};
use crate::protocol::message::{Command, RtmpMessage};
use crate::stats::{BandwidthSampler, BitrateReport};
use crate::transport::{Transport, TransportEvents, TransportHandler};

pub use ring_buffer::RingBuffer;
pub use status::{HandshakeProgress, SessionState, SessionStatus};
pub use writer::{CongestionAccount, OutboundFrame, WritePath};

/// Mutable per-connection state, guarded by one lock
struct SessionCore {
    status: SessionStatus,
    url: Option<RtmpUrl>,
    handshake: Handshake,
    chunk_encoder: ChunkEncoder,
    chunk_decoder: ChunkDecoder,
    /// Bytes drained from the ring once the handshake is complete
    inbound: BytesMut,
    status_tx: mpsc::UnboundedSender<SessionStatus>,
}

impl SessionCore {
    fn notify(&self) {
        let _ = self.status_tx.send(self.status);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.status.state != state {
            self.status.state = state;
            self.notify();
        }
    }

    fn set_ready(&mut self) {
        if !self.status.ready {
            self.status.ready = true;
            self.notify();
        }
    }

    fn set_started(&mut self) {
        if self.status.ready && !self.status.started {
            self.status.started = true;
            self.notify();
        }
    }

    /// Fresh transport connection: everything starts over
    fn begin(&mut self, ring: &RingBuffer) {
        ring.clear();
        self.handshake.start();
        self.chunk_encoder.reset();
        self.chunk_decoder.reset();
        self.inbound.clear();
        self.status.ready = false;
        self.status.started = false;
        self.set_state(SessionState::Handshaking(self.handshake.progress()));
    }

    /// Emit every handshake packet that can go out now
    ///
    /// Once C2 is out, also queues `SetChunkSize` (if configured) and the
    /// `connect` command.
    fn advance_handshake(&mut self, config: &SessionConfig, out: &mut Vec<Bytes>) -> Result<()> {
        if !matches!(self.status.state, SessionState::Handshaking(_)) {
            return Ok(());
        }

        while let Some(packet) = self.handshake.next_packet() {
            out.push(packet);
            if !self.handshake.is_complete() {
                self.set_state(SessionState::Handshaking(self.handshake.progress()));
            }
        }

        if self.handshake.is_complete() {
            self.set_state(SessionState::HandshakeComplete);
            self.send_connect(config, out)?;
        }
        Ok(())
    }

    fn send_connect(&mut self, config: &SessionConfig, out: &mut Vec<Bytes>) -> Result<()> {
        let url = self.url.as_ref().ok_or(HandshakeError::InvalidState)?;
        let connect = Command::connect(&url.app, &url.tc_url(), &config.flash_ver);
        // Encode everything first so a failure leaves nothing half-queued
        let connect = RtmpMessage::Command(connect).to_message(0)?;

        let mut buf = BytesMut::new();
        if config.chunk_size != DEFAULT_CHUNK_SIZE {
            let set_chunk_size = RtmpMessage::SetChunkSize(config.chunk_size).to_message(0)?;
            self.chunk_encoder.encode(&set_chunk_size, &mut buf)?;
            self.chunk_encoder.set_chunk_size(config.chunk_size);
            tracing::debug!(chunk_size = config.chunk_size, "Sending SetChunkSize");
        }
        self.chunk_encoder.encode(&connect, &mut buf)?;
        tracing::debug!(app = %url.app, tc_url = %url.tc_url(), "Sending connect");

        out.push(buf.freeze());
        Ok(())
    }

    /// Consume whatever the ring holds; returns whether anything was consumed
    fn process_inbound(&mut self, ring: &RingBuffer, config: &SessionConfig, out: &mut Vec<Bytes>) -> Result<bool> {
        let mut progressed = false;

        loop {
            match self.status.state {
                SessionState::Handshaking(_) => match self.handshake.process(ring)? {
                    Some(unit) => {
                        progressed = true;
                        self.set_state(SessionState::Handshaking(self.handshake.progress()));
                        if matches!(unit, HandshakeUnit::S2) {
                            self.advance_handshake(config, out)?;
                        }
                    }
                    None => return Ok(progressed),
                },
                SessionState::HandshakeComplete => {
                    let available = ring.bytes_available();
                    if available > 0 {
                        let start = self.inbound.len();
                        self.inbound.resize(start + available, 0);
                        let read = ring.get(&mut self.inbound[start..]);
                        self.inbound.truncate(start + read);
                        progressed |= read > 0;
                    }

                    while let Some(msg) = self.chunk_decoder.decode(&mut self.inbound)? {
                        self.handle_message(&msg)?;
                    }
                    return Ok(progressed);
                }
                // Nothing to interpret outside a live connection
                _ => return Ok(progressed),
            }
        }
    }

    fn handle_message(&mut self, msg: &Message) -> Result<()> {
        match RtmpMessage::from_message(msg)? {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(size = size, "Peer chunk size");
                self.chunk_decoder.set_chunk_size(size);
            }
            RtmpMessage::Abort { csid } => {
                self.chunk_decoder.abort(csid);
            }
            RtmpMessage::WindowAckSize(size) => {
                tracing::debug!(size = size, "Window acknowledgement size");
            }
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                tracing::debug!(size = size, limit_type = limit_type, "Peer bandwidth");
            }
            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(sequence = sequence, "Acknowledgement");
            }
            RtmpMessage::Command(cmd) => self.handle_command(&cmd)?,
            RtmpMessage::Unknown { type_id, data } => {
                tracing::trace!(type_id = type_id, len = data.len(), "Ignoring message");
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &Command) -> Result<()> {
        if cmd.is_response_to(CONNECT_TRANSACTION_ID) {
            if cmd.name == CMD_RESULT {
                tracing::info!(code = ?cmd.status_code(), "Connect accepted");
                self.set_ready();
            } else {
                let reason = cmd
                    .description()
                    .or(cmd.status_code())
                    .unwrap_or("connect rejected")
                    .to_string();
                return Err(Error::Rejected(reason));
            }
        } else if cmd.name == CMD_ON_STATUS {
            tracing::debug!(code = ?cmd.status_code(), "onStatus");
        } else {
            tracing::debug!(name = %cmd.name, transaction_id = cmd.transaction_id, "Unhandled command");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.url = None;
        self.handshake.reset();
        self.chunk_encoder.reset();
        self.chunk_decoder.reset();
        self.inbound.clear();
        self.status = SessionStatus::default();
        self.notify();
    }
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    ring: RingBuffer,
    sampler: Arc<BandwidthSampler>,
    write_path: WritePath,
    core: Mutex<SessionCore>,
}

impl SessionInner {
    fn on_transport_event(&self, events: TransportEvents) {
        tracing::trace!(events = ?events, "Transport event");

        if events.contains(TransportEvents::CONNECTED) {
            self.on_connected();
        }
        if events.contains(TransportEvents::READABLE) {
            self.on_readable();
        }
        if events.contains(TransportEvents::WRITABLE) {
            self.write_path.notify_writable();
            self.drive_handshake();
        }
        if events.contains(TransportEvents::END_OF_STREAM) {
            tracing::info!("Server closed the connection");
            let mut core = self.core.lock();
            if !core.status.state.is_terminal() {
                core.set_state(SessionState::Disconnected);
            }
        }
        if events.contains(TransportEvents::ERROR) {
            self.fail(Error::Transport("transport reported an error".into()));
        }
    }

    fn on_connected(&self) {
        tracing::debug!("Transport connected, starting handshake");
        let mut core = self.core.lock();
        core.begin(&self.ring);
        // Frames from an earlier connection must not reach this one
        self.write_path.account().reset();
        let mut out = Vec::new();
        let result = core.advance_handshake(&self.config, &mut out);
        self.submit_all(out);
        drop(core);
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn drive_handshake(&self) {
        let mut core = self.core.lock();
        let mut out = Vec::new();
        let result = core.advance_handshake(&self.config, &mut out);
        self.submit_all(out);
        drop(core);
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn on_readable(&self) {
        let mut buf = vec![0u8; self.ring.capacity()];

        loop {
            let space = self.ring.spaces_available();
            let read = if space > 0 {
                match self.transport.read(&mut buf[..space]) {
                    Ok(n) => n,
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            } else {
                0
            };
            if read > 0 {
                self.ring.put(&buf[..read]);
            }

            let mut core = self.core.lock();
            let mut out = Vec::new();
            let result = core.process_inbound(&self.ring, &self.config, &mut out);
            self.submit_all(out);
            drop(core);

            match result {
                Ok(progressed) => {
                    if read == 0 && !progressed {
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    /// Queue protocol packets; callers hold the core lock so wire order
    /// matches encoder state
    fn submit_all(&self, packets: Vec<Bytes>) {
        for packet in packets {
            self.write_path.submit(packet, false, Instant::now());
        }
    }

    /// Move to `Error` and drop the connection
    fn fail(&self, err: Error) {
        {
            let mut core = self.core.lock();
            if !core.status.state.is_active() {
                tracing::debug!(error = %err, "Ignoring error outside an active connection");
                return;
            }
            tracing::error!(error = %err, "Session failed");
            core.set_state(SessionState::Error);
        }
        self.transport.disconnect();
    }
}

/// Forwards transport events without keeping the session alive
struct SessionHandler {
    inner: Weak<SessionInner>,
}

impl TransportHandler for SessionHandler {
    fn on_transport_event(&self, events: TransportEvents) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_transport_event(events);
        }
    }
}

/// RTMP publishing session
///
/// Cheap to clone; all clones share one connection.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use rtmp_publish::{RtmpSession, SessionConfig, TcpTransport};
///
/// let (session, mut status) = RtmpSession::new(Arc::new(TcpTransport::new()), SessionConfig::default())?;
/// session.connect("rtmp://localhost/live/stream").await?;
/// while let Some(status) = status.recv().await {
///     if status.ready {
///         break;
///     }
/// }
/// ```
#[derive(Clone)]
pub struct RtmpSession {
    inner: Arc<SessionInner>,
}

impl RtmpSession {
    /// Create a session over `transport`
    ///
    /// Returns the session and the receiving end of its status channel.
    /// Must be called within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionStatus>)> {
        config.validate()?;

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let sampler = Arc::new(BandwidthSampler::new());
        let account = Arc::new(CongestionAccount::new(config.max_congestion_bytes));

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let weak = weak.clone();
            let write_path = WritePath::spawn(
                transport.clone(),
                account,
                sampler.clone(),
                config.write_retry_timeout,
                Arc::new(move |err: Error| {
                    if let Some(inner) = weak.upgrade() {
                        inner.fail(err);
                    }
                }),
            );

            SessionInner {
                ring: RingBuffer::new(config.ring_buffer_capacity),
                core: Mutex::new(SessionCore {
                    status: SessionStatus::default(),
                    url: None,
                    handshake: Handshake::new(config.strict_handshake, config.verify_handshake_echo),
                    chunk_encoder: ChunkEncoder::new(),
                    chunk_decoder: ChunkDecoder::new(),
                    inbound: BytesMut::new(),
                    status_tx,
                }),
                config,
                transport,
                sampler,
                write_path,
            }
        });

        Ok((Self { inner }, status_rx))
    }

    /// Connect to `rtmp://host[:port]/app[/playpath]`
    ///
    /// The URL is validated before the transport is touched. An active
    /// session is reset first. Handshake progress is reported through the
    /// status channel.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let url = RtmpUrl::parse(url)?;

        let state = self.status().state;
        if !matches!(state, SessionState::Unconnected | SessionState::Disconnected) {
            self.reset();
        }

        tracing::info!(host = %url.host, port = url.port, app = %url.app, "Connecting");
        let (host, port) = (url.host.clone(), url.port);
        self.inner.core.lock().url = Some(url);

        let handler: Arc<dyn TransportHandler> = Arc::new(SessionHandler {
            inner: Arc::downgrade(&self.inner),
        });
        if let Err(e) = self.inner.transport.connect(&host, port, handler).await {
            tracing::error!(error = %e, "Transport connect failed");
            self.inner.core.lock().set_state(SessionState::Error);
            return Err(e);
        }
        Ok(())
    }

    /// Queue raw bytes for the writer
    ///
    /// `timestamp` is the capture time; frames stamped before the last
    /// [`reset`](Self::reset) are discarded. Returns whether the frame was
    /// queued.
    pub fn write(&self, data: Bytes, is_keyframe: bool, timestamp: Instant) -> bool {
        self.inner.write_path.submit(data, is_keyframe, timestamp)
    }

    /// Chunk `msg` and queue it
    ///
    /// Fails until the handshake is complete, and for payloads longer than
    /// the chunk header can describe.
    pub fn send_message(&self, msg: &Message, is_keyframe: bool) -> Result<bool> {
        let mut core = self.inner.core.lock();
        if core.status.state != SessionState::HandshakeComplete {
            return Err(HandshakeError::InvalidState.into());
        }

        let mut buf = BytesMut::new();
        core.chunk_encoder.encode(msg, &mut buf)?;
        let queued = self.inner.write_path.submit(buf.freeze(), is_keyframe, Instant::now());
        if queued && msg.is_media() {
            core.set_started();
        }
        Ok(queued)
    }

    /// Feed transport events in directly
    pub fn on_transport_event(&self, events: TransportEvents) {
        self.inner.on_transport_event(events);
    }

    /// Start bandwidth sampling, delivering a report every tick
    pub fn detect_byte_rate<F>(&self, callback: F)
    where
        F: Fn(BitrateReport) + Send + Sync + 'static,
    {
        self.inner.sampler.clear();
        self.inner.sampler.spawn(self.inner.config.sample_interval, callback);
    }

    /// Back to `Unconnected`
    ///
    /// Drops the connection, staged inbound bytes and handshake state, and
    /// stops bandwidth sampling. Frames queued before now, including one the
    /// writer is part way through, are discarded without touching the new
    /// accounting.
    pub fn reset(&self) {
        tracing::debug!("Resetting session");
        self.inner.core.lock().reset();
        self.inner.ring.clear();
        self.inner.sampler.stop();
        self.inner.sampler.clear();
        self.inner.write_path.account().reset();
        // Wake a writer parked on a stale frame so it lets go of it
        self.inner.write_path.notify_writable();
        self.inner.transport.disconnect();
    }

    /// Tear down: stop the writer and sampler and drop the connection
    pub fn close(&self) {
        tracing::debug!("Closing session");
        self.inner.write_path.close();
        self.inner.sampler.stop();
        self.inner.transport.disconnect();
        let mut core = self.inner.core.lock();
        if core.status.state.is_active() {
            core.set_state(SessionState::Disconnected);
        }
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.inner.core.lock().status
    }

    /// URL of the current connection attempt
    pub fn url(&self) -> Option<RtmpUrl> {
        self.inner.core.lock().url.clone()
    }

    /// Bytes accepted by `write` but not yet sent
    pub fn queued_bytes(&self) -> usize {
        self.inner.write_path.account().queued()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::{amf0, AmfValue};
    use crate::error::ProtocolError;
    use crate::protocol::constants::*;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const C0C1_LEN: usize = 1 + HANDSHAKE_SIZE;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionStatus>) -> Vec<SessionStatus> {
        let mut all = Vec::new();
        while let Ok(status) = rx.try_recv() {
            all.push(status);
        }
        all
    }

    fn s1_packet() -> Vec<u8> {
        (0..HANDSHAKE_SIZE).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn server_command(cmd: Command) -> Vec<u8> {
        let msg = RtmpMessage::Command(cmd).to_message(0).unwrap();
        let mut buf = BytesMut::new();
        ChunkEncoder::new().encode(&msg, &mut buf).unwrap();
        buf.to_vec()
    }

    fn connect_reply(name: &str, code: &str, description: &str) -> Vec<u8> {
        server_command(Command {
            name: name.to_string(),
            transaction_id: CONNECT_TRANSACTION_ID,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::object([
                ("level", if name == CMD_RESULT { "status" } else { "error" }),
                ("code", code),
                ("description", description),
            ])],
            stream_id: 0,
        })
    }

    async fn connected(
        config: SessionConfig,
    ) -> (RtmpSession, Arc<MockTransport>, mpsc::UnboundedReceiver<SessionStatus>) {
        let transport = MockTransport::new();
        let (session, rx) = RtmpSession::new(transport.clone(), config).unwrap();
        session.connect("rtmp://media.example.com/live/123").await.unwrap();
        transport.fire(TransportEvents::CONNECTED | TransportEvents::WRITABLE);
        wait_for(|| transport.written_len() == C0C1_LEN).await;
        (session, transport, rx)
    }

    /// Run S0/S1/S2 through the session; returns S1
    async fn complete_handshake(session: &RtmpSession, transport: &MockTransport) -> Vec<u8> {
        let s1 = s1_packet();
        transport.push_inbound(&[RTMP_VERSION]);
        transport.push_inbound(&s1);
        transport.push_inbound(&[0u8; HANDSHAKE_SIZE]);
        transport.fire(TransportEvents::READABLE);
        assert_eq!(session.status().state, SessionState::HandshakeComplete);
        s1
    }

    #[tokio::test]
    async fn test_bad_url_rejected_before_transport() {
        let transport = MockTransport::new();
        let (session, _rx) = RtmpSession::new(transport.clone(), SessionConfig::default()).unwrap();

        let err = session.connect("http://host/live").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnsupportedScheme(_))));
        assert!(session.connect("rtmp://").await.is_err());
        assert!(transport.endpoint().is_none());
        assert_eq!(session.status().state, SessionState::Unconnected);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SessionConfig::default().ring_buffer_capacity(16);
        assert!(RtmpSession::new(MockTransport::new(), config).is_err());
    }

    #[tokio::test]
    async fn test_connect_sends_c0_c1() {
        let (session, transport, mut rx) = connected(SessionConfig::default()).await;

        assert_eq!(transport.endpoint(), Some(("media.example.com".to_string(), 1935)));
        assert_eq!(session.url().unwrap().app, "live");
        assert_eq!(session.url().unwrap().play_path.as_deref(), Some("123"));

        let written = transport.written();
        assert_eq!(written[0], RTMP_VERSION);
        assert_eq!(&written[1..9], &[0u8; 8]);

        let statuses = drain(&mut rx);
        assert_eq!(
            statuses[0].state,
            SessionState::Handshaking(HandshakeProgress::all_pending())
        );
        match session.status().state {
            SessionState::Handshaking(progress) => {
                assert!(!progress.c0);
                assert!(!progress.c1);
                assert!(progress.c2 && progress.s0 && progress.s1 && progress.s2);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_c2_waits_for_s2() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;

        transport.push_inbound(&[RTMP_VERSION]);
        transport.push_inbound(&s1_packet());
        transport.fire(TransportEvents::READABLE);
        transport.fire(TransportEvents::WRITABLE);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.written_len(), C0C1_LEN);
        match session.status().state {
            SessionState::Handshaking(progress) => {
                assert!(!progress.s0 && !progress.s1);
                assert!(progress.s2 && progress.c2);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_split_across_reads() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        let s1 = s1_packet();

        transport.push_inbound(&[RTMP_VERSION]);
        transport.push_inbound(&s1[..700]);
        transport.fire(TransportEvents::READABLE);
        assert!(matches!(session.status().state, SessionState::Handshaking(_)));

        transport.push_inbound(&s1[700..]);
        transport.push_inbound(&[0u8; 100]);
        transport.fire(TransportEvents::READABLE);
        assert!(matches!(session.status().state, SessionState::Handshaking(_)));

        transport.push_inbound(&[0u8; HANDSHAKE_SIZE - 100]);
        transport.fire(TransportEvents::READABLE);
        assert_eq!(session.status().state, SessionState::HandshakeComplete);
    }

    #[tokio::test]
    async fn test_handshake_then_connect_command() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        let s1 = complete_handshake(&session, &transport).await;

        wait_for(|| transport.written_len() > C0C1_LEN + HANDSHAKE_SIZE).await;
        let written = transport.written();

        // C2 echoes S1 with the ack field zeroed
        let c2 = &written[C0C1_LEN..C0C1_LEN + HANDSHAKE_SIZE];
        assert_eq!(&c2[..4], &s1[..4]);
        assert_eq!(&c2[4..8], &[0u8; 4]);
        assert_eq!(&c2[8..], &s1[8..]);

        // connect follows on csid 3
        let mut wire = BytesMut::from(&written[C0C1_LEN + HANDSHAKE_SIZE..]);
        let mut decoder = ChunkDecoder::new();
        let mut msg = decoder.decode(&mut wire).unwrap();
        while msg.is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
            wire = BytesMut::from(&transport.written()[C0C1_LEN + HANDSHAKE_SIZE..]);
            decoder = ChunkDecoder::new();
            msg = decoder.decode(&mut wire).unwrap();
        }
        let msg = msg.unwrap();
        assert_eq!(msg.csid, CSID_COMMAND);
        assert_eq!(msg.type_id, MSG_COMMAND_AMF0);

        let values = amf0::decode_all(&msg.payload).unwrap();
        assert_eq!(values[0].as_str(), Some(CMD_CONNECT));
        assert_eq!(values[1].as_number(), Some(CONNECT_TRANSACTION_ID));
        assert_eq!(values[2].get_string("app"), Some("live"));
        assert_eq!(values[2].get_string("tcUrl"), Some("rtmp://media.example.com:1935/live"));
        assert_eq!(values[2].get_string("flashVer"), Some(DEFAULT_FLASH_VER));
    }

    #[tokio::test]
    async fn test_custom_chunk_size_announced_first() {
        let (session, transport, _rx) = connected(SessionConfig::default().chunk_size(4096)).await;
        complete_handshake(&session, &transport).await;

        let offset = C0C1_LEN + HANDSHAKE_SIZE;
        wait_for(|| transport.written_len() > offset).await;
        let mut wire = BytesMut::from(&transport.written()[offset..]);
        let mut decoder = ChunkDecoder::new();

        let first = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first.csid, CSID_PROTOCOL_CONTROL);
        assert_eq!(RtmpMessage::from_message(&first).unwrap(), RtmpMessage::SetChunkSize(4096));

        decoder.set_chunk_size(4096);
        let second = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(second.type_id, MSG_COMMAND_AMF0);
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_strict_s0_mismatch_fails_connection() {
        let (session, transport, mut rx) = connected(SessionConfig::default()).await;
        transport.push_inbound(&[0x04]);
        transport.fire(TransportEvents::READABLE);

        assert_eq!(session.status().state, SessionState::Error);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        let statuses = drain(&mut rx);
        assert_eq!(statuses.last().unwrap().state, SessionState::Error);
    }

    #[tokio::test]
    async fn test_lenient_s0_mismatch_continues() {
        let config = SessionConfig::default().strict_handshake(false);
        let (session, transport, _rx) = connected(config).await;

        transport.push_inbound(&[0x04]);
        transport.fire(TransportEvents::READABLE);
        match session.status().state {
            SessionState::Handshaking(progress) => assert!(progress.s0),
            other => panic!("unexpected state {:?}", other),
        }

        transport.push_inbound(&s1_packet());
        transport.push_inbound(&[0u8; HANDSHAKE_SIZE]);
        transport.fire(TransportEvents::READABLE);
        assert_eq!(session.status().state, SessionState::HandshakeComplete);
    }

    #[tokio::test]
    async fn test_connect_result_sets_ready_then_media_sets_started() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        complete_handshake(&session, &transport).await;

        let video = Message::new(CSID_VIDEO, 0, MSG_VIDEO, 1, Bytes::from_static(b"\x17\x01"));
        session.send_message(&video, true).unwrap();
        assert!(!session.status().started);

        transport.push_inbound(&connect_reply(CMD_RESULT, NC_CONNECT_SUCCESS, "Connection succeeded."));
        transport.fire(TransportEvents::READABLE);
        assert!(session.status().ready);
        assert!(!session.status().started);

        session.send_message(&video, true).unwrap();
        assert!(session.status().started);
    }

    #[tokio::test]
    async fn test_connect_error_fails_session() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        complete_handshake(&session, &transport).await;

        transport.push_inbound(&connect_reply(CMD_ERROR, "NetConnection.Connect.Rejected", "bad app"));
        transport.fire(TransportEvents::READABLE);
        assert_eq!(session.status().state, SessionState::Error);
        assert!(!session.status().ready);
    }

    #[tokio::test]
    async fn test_peer_chunk_size_applied() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        complete_handshake(&session, &transport).await;

        // SetChunkSize then a reply larger than 128 bytes in one chunk
        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&RtmpMessage::SetChunkSize(4096).to_message(0).unwrap(), &mut wire).unwrap();
        encoder.set_chunk_size(4096);
        let long = "x".repeat(300);
        let reply = RtmpMessage::Command(Command {
            name: CMD_RESULT.to_string(),
            transaction_id: CONNECT_TRANSACTION_ID,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::object([("code", NC_CONNECT_SUCCESS), ("description", long.as_str())])],
            stream_id: 0,
        });
        encoder.encode(&reply.to_message(0).unwrap(), &mut wire).unwrap();

        transport.push_inbound(&wire);
        transport.fire(TransportEvents::READABLE);
        assert!(session.status().ready);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_before_queueing() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        complete_handshake(&session, &transport).await;
        let offset = C0C1_LEN + HANDSHAKE_SIZE;
        wait_for(|| transport.written_len() > offset).await;
        let before = transport.written_len();

        let payload = Bytes::from(vec![0u8; MAX_MESSAGE_LENGTH as usize + 2]);
        let msg = Message::new(CSID_VIDEO, 0, MSG_VIDEO, 1, payload);
        assert!(matches!(
            session.send_message(&msg, true),
            Err(Error::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.status().state, SessionState::HandshakeComplete);

        // The chunk stream is still usable and opens with a full header
        let small = Message::new(CSID_VIDEO, 0, MSG_VIDEO, 1, Bytes::from_static(b"\x17\x01"));
        assert!(session.send_message(&small, true).unwrap());
        wait_for(|| transport.written_len() > before).await;
        let mut wire = BytesMut::from(&transport.written()[before..]);
        let decoded = ChunkDecoder::new().decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, small);
    }

    #[tokio::test]
    async fn test_send_message_requires_handshake() {
        let (session, _transport, _rx) = connected(SessionConfig::default()).await;
        let msg = Message::new(CSID_VIDEO, 0, MSG_VIDEO, 1, Bytes::from_static(b"x"));
        assert!(matches!(
            session.send_message(&msg, false),
            Err(Error::Handshake(HandshakeError::InvalidState))
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_disconnects() {
        let (session, transport, mut rx) = connected(SessionConfig::default()).await;
        drain(&mut rx);
        transport.fire(TransportEvents::END_OF_STREAM);
        assert_eq!(session.status().state, SessionState::Disconnected);
        assert_eq!(drain(&mut rx).last().unwrap().state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_error_event() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        transport.fire(TransportEvents::ERROR);
        assert_eq!(session.status().state, SessionState::Error);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_failure_fails_session() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        transport.fail_writes(true);
        assert!(session.write(Bytes::from_static(b"frame"), false, Instant::now()));
        wait_for(|| session.status().state == SessionState::Error).await;
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_accounting() {
        let (session, transport, mut rx) = connected(SessionConfig::default()).await;
        session.detect_byte_rate(|_| {});
        transport.set_write_budget(Some(0));

        let before = Instant::now();
        session.write(Bytes::from(vec![1u8; 1000]), true, before);
        assert!(session.queued_bytes() >= 1000);

        tokio::time::sleep(Duration::from_millis(2)).await;
        session.reset();
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.status(), SessionStatus::default());
        assert_eq!(drain(&mut rx).last().unwrap().state, SessionState::Unconnected);
        assert!(transport.disconnects.load(Ordering::SeqCst) >= 1);
        assert!(!session.inner.sampler.is_running());

        // A frame stamped before the reset is refused
        assert!(!session.write(Bytes::from_static(b"late"), false, before));

        // The stuck frame is dropped, not drained
        transport.take_written();
        transport.set_write_budget(None);
        session.on_transport_event(TransportEvents::WRITABLE);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.written().is_empty());
        assert_eq!(session.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_c0_after_partial_frame() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        transport.take_written();

        // Half-send a frame, then reconnect while it is still in flight
        transport.set_write_budget(Some(10));
        assert!(session.write(Bytes::from(vec![0xEE; 1000]), false, Instant::now()));
        wait_for(|| transport.written_len() == 10).await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        session.connect("rtmp://media.example.com/live/123").await.unwrap();
        assert_eq!(transport.take_written(), vec![0xEE; 10]);

        transport.set_write_budget(None);
        transport.fire(TransportEvents::CONNECTED | TransportEvents::WRITABLE);
        wait_for(|| transport.written_len() >= C0C1_LEN).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second_connection = transport.written();
        assert_eq!(second_connection[0], RTMP_VERSION);
        assert_eq!(second_connection.len(), C0C1_LEN);
        assert_eq!(&second_connection[1..9], &[0u8; 8]);
    }

    #[tokio::test]
    async fn test_reconnect_resets_active_session() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        session.connect("rtmp://other.example.com:1940/app2").await.unwrap();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.endpoint(), Some(("other.example.com".to_string(), 1940)));
        assert_eq!(session.status().state, SessionState::Unconnected);
        assert_eq!(session.url().unwrap().app, "app2");
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let (session, transport, _rx) = connected(SessionConfig::default()).await;
        session.detect_byte_rate(|_| {});
        session.close();
        assert_eq!(session.status().state, SessionState::Disconnected);
        assert!(!session.write(Bytes::from_static(b"x"), false, Instant::now()));
        assert!(transport.disconnects.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_byte_rate_reports_sent_bytes() {
        let config = SessionConfig::default().sample_interval(Duration::from_millis(30));
        let (session, _transport, _rx) = connected(config).await;

        let (tx, mut reports) = mpsc::unbounded_channel();
        session.detect_byte_rate(move |report| {
            let _ = tx.send(report);
        });
        session.write(Bytes::from(vec![0u8; 4096]), true, Instant::now());

        let mut total = 0.0;
        for _ in 0..5 {
            let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
                .await
                .unwrap()
                .unwrap();
            total += report.detected_bytes_per_sec;
            if total > 0.0 {
                break;
            }
        }
        assert!(total > 0.0);
    }

    #[tokio::test]
    async fn test_publish_handshake_over_tcp() {
        use crate::transport::TcpTransport;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut c0c1 = vec![0u8; C0C1_LEN];
            socket.read_exact(&mut c0c1).await.unwrap();
            assert_eq!(c0c1[0], RTMP_VERSION);

            let s1 = s1_packet();
            socket.write_all(&[RTMP_VERSION]).await.unwrap();
            socket.write_all(&s1).await.unwrap();
            socket.write_all(&c0c1[1..]).await.unwrap();

            let mut c2 = vec![0u8; HANDSHAKE_SIZE];
            socket.read_exact(&mut c2).await.unwrap();
            assert_eq!(&c2[8..], &s1[8..]);

            let mut decoder = ChunkDecoder::new();
            let mut inbound = BytesMut::new();
            let connect = loop {
                if let Some(msg) = decoder.decode(&mut inbound).unwrap() {
                    break msg;
                }
                let mut buf = [0u8; 512];
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before connect");
                inbound.extend_from_slice(&buf[..n]);
            };
            let values = amf0::decode_all(&connect.payload).unwrap();
            assert_eq!(values[0].as_str(), Some(CMD_CONNECT));
            assert_eq!(values[2].get_string("tcUrl"), Some(format!("rtmp://127.0.0.1:{}/live", port).as_str()));

            socket
                .write_all(&connect_reply(CMD_RESULT, NC_CONNECT_SUCCESS, "Connection succeeded."))
                .await
                .unwrap();

            // Hold the socket until the client hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let config = SessionConfig::default().verify_handshake_echo(true);
        let (session, mut rx) = RtmpSession::new(Arc::new(TcpTransport::new()), config).unwrap();
        session.connect(&format!("rtmp://127.0.0.1:{}/live/key", port)).await.unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = rx.recv().await {
                if status.ready {
                    return status;
                }
                assert_ne!(status.state, SessionState::Error);
            }
            panic!("status channel closed");
        })
        .await
        .unwrap();
        assert_eq!(ready.state, SessionState::HandshakeComplete);

        session.close();
        server.await.unwrap();
    }
}
