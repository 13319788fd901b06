//! RTMP handshake implementation (client side)
//!
//! The RTMP handshake consists of three phases:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: zero+random) ->|
//!   |                                        |
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |                                        |
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |                                        |
//!   |          [Handshake Complete]          |
//! ```
//!
//! Sends and receives are tracked by independent pending flags. Every call to
//! [`Handshake::next_packet`] emits at most one of C0, C1, C2; every call to
//! [`Handshake::process`] consumes at most one of S0, S1, S2 from the inbound
//! ring buffer.
//!
//! This implementation uses the "simple" handshake (no HMAC digest).
//!
//! Reference: RTMP Specification Section 5.2

use bytes::Bytes;
use rand::RngCore;

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_HEADER_SIZE, HANDSHAKE_SIZE, RTMP_VERSION};
use crate::session::ring_buffer::RingBuffer;

/// Pending handshake steps; `true` means the step has not happened yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeProgress {
    pub c0: bool,
    pub c1: bool,
    pub c2: bool,
    pub s0: bool,
    pub s1: bool,
    pub s2: bool,
}

impl HandshakeProgress {
    /// Every step pending, as on a fresh connection
    pub fn all_pending() -> Self {
        Self {
            c0: true,
            c1: true,
            c2: true,
            s0: true,
            s1: true,
            s2: true,
        }
    }
}

/// A unit consumed from the inbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeUnit {
    /// S0 with the version byte the server sent
    S0(u8),
    S1,
    S2,
}

/// Next inbound unit the machine expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    S0,
    S1,
    S2,
    Done,
}

/// Client handshake state machine
#[derive(Debug)]
pub struct Handshake {
    started: bool,
    complete: bool,
    progress: HandshakeProgress,
    inbound: Inbound,
    /// C1 as sent, kept for S2 verification
    c1: Option<Box<[u8; HANDSHAKE_SIZE]>>,
    /// S1 as received, released once C2 is sent
    s1: Option<Box<[u8; HANDSHAKE_SIZE]>>,
    /// Fail on a bad S0 version instead of logging it
    strict: bool,
    /// Require S2 to echo the random part of C1
    verify_echo: bool,
}

impl Handshake {
    /// Create a handshake that has not started yet
    pub fn new(strict: bool, verify_echo: bool) -> Self {
        Self {
            started: false,
            complete: false,
            progress: HandshakeProgress::default(),
            inbound: Inbound::S0,
            c1: None,
            s1: None,
            strict,
            verify_echo,
        }
    }

    /// Transport connected: mark every step pending
    pub fn start(&mut self) {
        self.reset();
        self.started = true;
        self.progress = HandshakeProgress::all_pending();
        tracing::debug!("Handshake started");
    }

    /// Back to the unstarted state, dropping retained packets
    pub fn reset(&mut self) {
        self.started = false;
        self.complete = false;
        self.progress = HandshakeProgress::default();
        self.inbound = Inbound::S0;
        self.c1 = None;
        self.s1 = None;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Check if handshake is complete
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Snapshot of the pending flags
    pub fn progress(&self) -> HandshakeProgress {
        self.progress
    }

    /// Whether S1 is currently retained
    pub fn has_retained_s1(&self) -> bool {
        self.s1.is_some()
    }

    /// Produce the next outbound packet, at most one per call
    ///
    /// Order is C0, C1, then C2 once S2 has arrived. Returns `None` when
    /// nothing can be sent right now.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        if !self.started || self.complete {
            return None;
        }

        if self.progress.c0 {
            self.progress.c0 = false;
            tracing::debug!("Sending C0");
            return Some(Bytes::from_static(&[RTMP_VERSION]));
        }

        if self.progress.c1 {
            let c1 = generate_c1();
            let packet = Bytes::copy_from_slice(&c1[..]);
            self.c1 = Some(c1);
            self.progress.c1 = false;
            tracing::debug!("Sending C1");
            return Some(packet);
        }

        if self.progress.c2 && !self.progress.s2 {
            let s1 = self.s1.take()?;
            let c2 = generate_c2(&s1);
            self.progress.c2 = false;
            self.complete = true;
            self.c1 = None;
            tracing::debug!("Sending C2, handshake complete");
            return Some(Bytes::copy_from_slice(&c2[..]));
        }

        None
    }

    /// Consume the next server unit from `ring`
    ///
    /// Returns `Ok(None)` without consuming anything when the ring holds less
    /// than a whole unit, or when every unit has already been received.
    pub fn process(&mut self, ring: &RingBuffer) -> Result<Option<HandshakeUnit>> {
        if !self.started {
            return Err(HandshakeError::InvalidState.into());
        }

        match self.inbound {
            Inbound::S0 => {
                let mut s0 = [0u8; 1];
                if !ring.get_exact(&mut s0) {
                    return Ok(None);
                }
                let version = s0[0];
                if version == RTMP_VERSION {
                    self.progress.s0 = false;
                } else if self.strict {
                    tracing::debug!(version = version, "Rejecting S0");
                    return Err(HandshakeError::InvalidVersion(version).into());
                } else {
                    tracing::warn!(version = version, "Unexpected S0 version, continuing");
                }
                self.inbound = Inbound::S1;
                tracing::debug!(version = version, "Received S0");
                Ok(Some(HandshakeUnit::S0(version)))
            }
            Inbound::S1 => {
                let mut s1 = Box::new([0u8; HANDSHAKE_SIZE]);
                if !ring.get_exact(&mut s1[..]) {
                    return Ok(None);
                }
                self.s1 = Some(s1);
                self.progress.s1 = false;
                self.inbound = Inbound::S2;
                tracing::debug!("Received S1");
                Ok(Some(HandshakeUnit::S1))
            }
            Inbound::S2 => {
                let mut s2 = Box::new([0u8; HANDSHAKE_SIZE]);
                if !ring.get_exact(&mut s2[..]) {
                    return Ok(None);
                }
                if self.verify_echo {
                    let echoed = self
                        .c1
                        .as_ref()
                        .is_some_and(|c1| c1[HANDSHAKE_HEADER_SIZE..] == s2[HANDSHAKE_HEADER_SIZE..]);
                    if !echoed {
                        return Err(HandshakeError::ResponseMismatch.into());
                    }
                }
                self.progress.s2 = false;
                self.inbound = Inbound::Done;
                tracing::debug!("Received S2");
                Ok(Some(HandshakeUnit::S2))
            }
            Inbound::Done => Ok(None),
        }
    }
}

/// C1: zeroed time and zero fields, then random bytes
fn generate_c1() -> Box<[u8; HANDSHAKE_SIZE]> {
    let mut packet = Box::new([0u8; HANDSHAKE_SIZE]);
    rand::rng().fill_bytes(&mut packet[HANDSHAKE_HEADER_SIZE..]);
    packet
}

/// C2: S1 echoed back with bytes 4..8 zeroed
fn generate_c2(s1: &[u8; HANDSHAKE_SIZE]) -> Box<[u8; HANDSHAKE_SIZE]> {
    let mut echo = Box::new(*s1);
    echo[4..HANDSHAKE_HEADER_SIZE].fill(0);
    echo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn started(strict: bool, verify_echo: bool) -> Handshake {
        let mut handshake = Handshake::new(strict, verify_echo);
        handshake.start();
        handshake
    }

    fn s1_packet() -> Vec<u8> {
        (0..HANDSHAKE_SIZE).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_start_marks_everything_pending() {
        let handshake = started(true, false);
        assert!(handshake.is_started());
        assert!(!handshake.is_complete());
        assert_eq!(handshake.progress(), HandshakeProgress::all_pending());
    }

    #[test]
    fn test_nothing_sent_before_start() {
        let mut handshake = Handshake::new(true, false);
        assert!(handshake.next_packet().is_none());
        let ring = RingBuffer::new(16);
        assert!(handshake.process(&ring).is_err());
    }

    #[test]
    fn test_c0_then_c1_one_per_call() {
        let mut handshake = started(true, false);

        let c0 = handshake.next_packet().unwrap();
        assert_eq!(&c0[..], &[0x03]);
        assert!(!handshake.progress().c0);
        assert!(handshake.progress().c1);

        let c1 = handshake.next_packet().unwrap();
        assert_eq!(c1.len(), HANDSHAKE_SIZE);
        assert_eq!(&c1[..8], &[0u8; 8]);
        assert!(!handshake.progress().c1);

        // C2 waits for S2
        assert!(handshake.next_packet().is_none());
        assert!(handshake.progress().c2);
    }

    #[test]
    fn test_s0_match_clears_flag() {
        let mut handshake = started(true, false);
        let ring = RingBuffer::new(16);
        ring.put(&[0x03]);
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S0(3)));
        assert!(!handshake.progress().s0);
    }

    #[test]
    fn test_s0_mismatch_strict_fails() {
        let mut handshake = started(true, false);
        let ring = RingBuffer::new(16);
        ring.put(&[0x04]);
        match handshake.process(&ring) {
            Err(Error::Handshake(HandshakeError::InvalidVersion(4))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(handshake.progress().s0);
    }

    #[test]
    fn test_s0_mismatch_lenient_keeps_flag_and_moves_on() {
        let mut handshake = started(false, false);
        let ring = RingBuffer::new(4096);
        ring.put(&[0x04]);
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S0(4)));
        assert!(handshake.progress().s0);
        assert_eq!(ring.bytes_available(), 0);

        ring.put(&s1_packet());
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S1));
    }

    #[test]
    fn test_partial_unit_is_not_consumed() {
        let mut handshake = started(true, false);
        let ring = RingBuffer::new(4096);
        ring.put(&[0x03]);
        handshake.process(&ring).unwrap();

        ring.put(&s1_packet()[..1000]);
        assert_eq!(handshake.process(&ring).unwrap(), None);
        assert_eq!(ring.bytes_available(), 1000);
        assert!(handshake.progress().s1);
    }

    #[test]
    fn test_one_unit_per_pass() {
        let mut handshake = started(true, false);
        let ring = RingBuffer::new(4096);
        ring.put(&[0x03]);
        ring.put(&s1_packet());

        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S0(3)));
        assert_eq!(ring.bytes_available(), HANDSHAKE_SIZE);
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S1));
        assert_eq!(ring.bytes_available(), 0);
    }

    #[test]
    fn test_c2_echoes_s1_with_zeroed_ack_field() {
        let mut handshake = started(true, false);
        handshake.next_packet();
        handshake.next_packet();

        let ring = RingBuffer::new(4096);
        let s1 = s1_packet();
        ring.put(&[0x03]);
        ring.put(&s1);
        handshake.process(&ring).unwrap();
        handshake.process(&ring).unwrap();
        assert!(handshake.has_retained_s1());
        assert!(handshake.next_packet().is_none());

        ring.put(&[0u8; HANDSHAKE_SIZE]);
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S2));

        let c2 = handshake.next_packet().unwrap();
        assert_eq!(&c2[..4], &s1[..4]);
        assert_eq!(&c2[4..8], &[0u8; 4]);
        assert_eq!(&c2[8..], &s1[8..]);

        assert!(handshake.is_complete());
        assert!(!handshake.has_retained_s1());
        assert!(handshake.next_packet().is_none());
        assert_eq!(handshake.process(&ring).unwrap(), None);
    }

    #[test]
    fn test_echo_verification() {
        let mut handshake = started(true, true);
        handshake.next_packet();
        let c1 = handshake.next_packet().unwrap();

        let ring = RingBuffer::new(4096);
        ring.put(&[0x03]);
        ring.put(&s1_packet());
        handshake.process(&ring).unwrap();
        handshake.process(&ring).unwrap();

        // Wrong echo
        ring.put(&[0u8; HANDSHAKE_SIZE]);
        match handshake.process(&ring) {
            Err(Error::Handshake(HandshakeError::ResponseMismatch)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        // Correct echo, time fields may differ
        let mut handshake = started(true, true);
        handshake.next_packet();
        let c1_again = handshake.next_packet().unwrap();
        ring.clear();
        ring.put(&[0x03]);
        ring.put(&s1_packet());
        handshake.process(&ring).unwrap();
        handshake.process(&ring).unwrap();
        let mut s2 = c1_again.to_vec();
        s2[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        ring.put(&s2);
        assert_eq!(handshake.process(&ring).unwrap(), Some(HandshakeUnit::S2));
        assert_ne!(c1, c1_again);
    }

    #[test]
    fn test_reset_drops_state() {
        let mut handshake = started(true, false);
        handshake.next_packet();
        handshake.reset();
        assert!(!handshake.is_started());
        assert_eq!(handshake.progress(), HandshakeProgress::default());
        assert!(handshake.next_packet().is_none());
    }
}
