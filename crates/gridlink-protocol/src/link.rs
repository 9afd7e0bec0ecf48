//! # Link Layer
//!
//! The DNP3 link state machine. One instance owns both halves of a link
//! session:
//!
//! - the **primary** half drives outbound transactions (reset handshake,
//!   confirmed/unconfirmed user data, link-status keepalives) with a retry
//!   budget and an ACK deadline;
//! - the **secondary** half answers the remote's primary frames (ACK/NACK,
//!   FCB-based duplicate rejection, user-data delivery).
//!
//! Pure logic — no I/O. The owner feeds raw received bytes in, drains
//! [`LinkEvent`]s out, and reports deadline expirations via
//! [`LinkLayer::poll_timeout`]. Framing errors are absorbed here: the frame
//! is dropped and counted, the stack keeps running.

use bytes::Bytes;
use quanta::Instant;
use serde::Serialize;

use crate::config::LinkConfig;
use crate::error::{FramingError, LinkError};
use crate::frame::{parse_frame, ControlField, LinkFunction, LinkHeader, write_frame};

// ─── Events ──────────────────────────────────────────────────────────────────

/// Events the link layer generates for its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete frame ready for the physical layer.
    Transmit(Bytes),
    /// Received user data going up to the transport function.
    UserData(Bytes),
    /// The outbound transaction completed.
    SendSuccess,
    /// The outbound transaction failed.
    SendFailure(LinkError),
    /// The remote answered a REQUEST_LINK_STATUS keepalive.
    LinkStatusReceived,
    /// A REQUEST_LINK_STATUS keepalive went unanswered.
    KeepaliveTimeout,
}

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Link-layer counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStats {
    pub frames_tx: u64,
    pub frames_rx: u64,
    /// Frames dropped with CRC/format errors.
    pub framing_errors: u64,
    /// Frames addressed to someone else.
    pub wrong_address: u64,
    /// Confirmed frames rejected as FCB duplicates.
    pub duplicates: u64,
    /// Retransmissions of the in-flight primary frame.
    pub retries: u64,
    /// Frames with functions we did not expect in the current state.
    pub unexpected_functions: u64,
}

// ─── States ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckStage {
    Reset,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriState {
    NotReset,
    Reset,
    WaitAck {
        stage: AckStage,
        retries_left: u8,
        deadline: Instant,
    },
    WaitLinkStatus {
        was_reset: bool,
        deadline: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecState {
    NotReset,
    Reset { expected_fcb: bool },
}

// ─── Link Layer ──────────────────────────────────────────────────────────────

/// The link-layer state machine.
pub struct LinkLayer {
    config: LinkConfig,
    pri: PriState,
    sec: SecState,
    /// FCB for the next outbound confirmed transaction.
    next_fcb: bool,
    /// User payload held while the reset handshake completes.
    pending: Option<Bytes>,
    /// Last transmitted primary frame, retained for retransmission.
    last_tx: Option<Bytes>,
    events: Vec<LinkEvent>,
    stats: LinkStats,
}

impl LinkLayer {
    pub fn new(config: LinkConfig) -> Self {
        LinkLayer {
            config,
            pri: PriState::NotReset,
            sec: SecState::NotReset,
            next_fcb: true,
            pending: None,
            last_tx: None,
            events: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// Whether the primary half holds a reset link session.
    pub fn is_reset(&self) -> bool {
        matches!(self.pri, PriState::Reset)
    }

    /// Submit user data for transmission.
    ///
    /// Unconfirmed sends complete immediately. Confirmed sends run the
    /// RESET/ACK handshake first when the link is not reset, then the
    /// CONFIRMED_USER_DATA/ACK exchange; the outcome arrives later as a
    /// [`LinkEvent::SendSuccess`] or [`LinkEvent::SendFailure`].
    pub fn transmit(&mut self, payload: Bytes, confirmed: bool, now: Instant) -> Result<(), LinkError> {
        if !matches!(self.pri, PriState::NotReset | PriState::Reset) {
            return Err(LinkError::Busy);
        }

        if !confirmed {
            let ctrl = ControlField::new(
                self.config.is_master,
                false,
                false,
                LinkFunction::UnconfirmedUserData,
            );
            self.transmit_frame(ctrl, &payload);
            self.events.push(LinkEvent::SendSuccess);
            return Ok(());
        }

        self.pending = Some(payload);
        match self.pri {
            PriState::NotReset => self.send_reset(now),
            PriState::Reset => self.send_confirmed_data(now),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Send a REQUEST_LINK_STATUS keepalive.
    pub fn request_link_status(&mut self, now: Instant) -> Result<(), LinkError> {
        let was_reset = match self.pri {
            PriState::NotReset => false,
            PriState::Reset => true,
            _ => return Err(LinkError::Busy),
        };
        let ctrl = ControlField::new(
            self.config.is_master,
            false,
            false,
            LinkFunction::RequestLinkStatus,
        );
        self.transmit_frame(ctrl, &[]);
        self.pri = PriState::WaitLinkStatus {
            was_reset,
            deadline: now + self.config.ack_timeout,
        };
        Ok(())
    }

    /// Process raw bytes received from the physical layer. Must contain one
    /// complete frame; framing failures are absorbed.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) {
        let (header, payload) = match parse_frame(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                self.absorb_framing_error(err);
                return;
            }
        };
        self.stats.frames_rx += 1;

        if header.destination != self.config.local_address
            || header.source != self.config.remote_address
        {
            self.stats.wrong_address += 1;
            tracing::debug!(
                dst = header.destination,
                src = header.source,
                "frame for another station dropped"
            );
            return;
        }

        match header.control.function() {
            Some(function) if function.is_primary() => {
                self.secondary_on_frame(function, &header, payload)
            }
            Some(function) => self.primary_on_frame(function, now),
            None => {
                self.stats.unexpected_functions += 1;
                tracing::warn!(func = header.control.func, "unknown link function");
                if header.control.prm {
                    self.send_secondary(LinkFunction::NotSupported);
                }
            }
        }
    }

    /// Check the ACK / link-status deadline. Call on every timer tick.
    pub fn poll_timeout(&mut self, now: Instant) {
        match self.pri {
            PriState::WaitAck {
                stage,
                retries_left,
                deadline,
            } if now >= deadline => {
                if retries_left > 0 {
                    let frame = self.last_tx.clone().expect("in-flight frame retained");
                    self.stats.retries += 1;
                    tracing::debug!(retries_left, "link ACK timeout, retransmitting");
                    self.events.push(LinkEvent::Transmit(frame));
                    self.stats.frames_tx += 1;
                    self.pri = PriState::WaitAck {
                        stage,
                        retries_left: retries_left - 1,
                        deadline: now + self.config.ack_timeout,
                    };
                } else {
                    tracing::warn!("link retry budget exhausted");
                    self.fail_transaction(LinkError::RetryExhausted);
                }
            }
            PriState::WaitLinkStatus { was_reset, deadline } if now >= deadline => {
                self.pri = if was_reset {
                    PriState::Reset
                } else {
                    PriState::NotReset
                };
                self.events.push(LinkEvent::KeepaliveTimeout);
            }
            _ => {}
        }
    }

    /// Forget all session state. Called when the physical layer drops.
    pub fn reset(&mut self) {
        if matches!(self.pri, PriState::WaitAck { .. }) {
            self.events.push(LinkEvent::SendFailure(LinkError::RetryExhausted));
        }
        self.pri = PriState::NotReset;
        self.sec = SecState::NotReset;
        self.next_fcb = true;
        self.pending = None;
        self.last_tx = None;
    }

    /// Drain all pending link events.
    pub fn drain_events(&mut self) -> impl Iterator<Item = LinkEvent> + '_ {
        self.events.drain(..)
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    // ─── Primary half ───────────────────────────────────────────────────

    fn send_reset(&mut self, now: Instant) {
        let ctrl = ControlField::new(
            self.config.is_master,
            false,
            false,
            LinkFunction::ResetLinkStates,
        );
        let frame = self.transmit_frame(ctrl, &[]);
        self.last_tx = Some(frame);
        self.pri = PriState::WaitAck {
            stage: AckStage::Reset,
            retries_left: self.config.num_retry,
            deadline: now + self.config.ack_timeout,
        };
    }

    fn send_confirmed_data(&mut self, now: Instant) {
        let payload = self.pending.clone().expect("payload staged for confirmed send");
        let ctrl = ControlField::new(
            self.config.is_master,
            self.next_fcb,
            true,
            LinkFunction::ConfirmedUserData,
        );
        let frame = self.transmit_frame(ctrl, &payload);
        self.last_tx = Some(frame);
        self.pri = PriState::WaitAck {
            stage: AckStage::Data,
            retries_left: self.config.num_retry,
            deadline: now + self.config.ack_timeout,
        };
    }

    fn primary_on_frame(&mut self, function: LinkFunction, now: Instant) {
        match (self.pri, function) {
            (PriState::WaitAck { stage: AckStage::Reset, .. }, LinkFunction::Ack) => {
                self.send_confirmed_data(now);
            }
            (PriState::WaitAck { stage: AckStage::Data, .. }, LinkFunction::Ack) => {
                self.pri = PriState::Reset;
                self.next_fcb = !self.next_fcb;
                self.pending = None;
                self.last_tx = None;
                self.events.push(LinkEvent::SendSuccess);
            }
            (
                PriState::WaitAck { .. },
                LinkFunction::Nack | LinkFunction::NotSupported,
            ) => {
                tracing::warn!(function = ?function, "link transaction rejected");
                self.fail_transaction(LinkError::Rejected);
            }
            (PriState::WaitLinkStatus { was_reset, .. }, LinkFunction::LinkStatus) => {
                self.pri = if was_reset {
                    PriState::Reset
                } else {
                    PriState::NotReset
                };
                self.events.push(LinkEvent::LinkStatusReceived);
            }
            _ => {
                self.stats.unexpected_functions += 1;
                tracing::debug!(function = ?function, "unexpected secondary frame");
            }
        }
    }

    fn fail_transaction(&mut self, error: LinkError) {
        self.pri = PriState::NotReset;
        self.pending = None;
        self.last_tx = None;
        self.events.push(LinkEvent::SendFailure(error));
    }

    // ─── Secondary half ─────────────────────────────────────────────────

    fn secondary_on_frame(&mut self, function: LinkFunction, header: &LinkHeader, payload: Bytes) {
        match function {
            LinkFunction::ResetLinkStates => {
                self.sec = SecState::Reset { expected_fcb: true };
                self.send_secondary(LinkFunction::Ack);
            }
            LinkFunction::ConfirmedUserData => match self.sec {
                SecState::NotReset => {
                    self.send_secondary(LinkFunction::Nack);
                }
                SecState::Reset { expected_fcb } => {
                    if header.control.fcb == expected_fcb {
                        self.sec = SecState::Reset {
                            expected_fcb: !expected_fcb,
                        };
                        self.send_secondary(LinkFunction::Ack);
                        self.events.push(LinkEvent::UserData(payload));
                    } else if header.control.fcv {
                        // FCB mismatch with FCV set: a retransmission of data
                        // we already delivered. Re-ACK without redelivery.
                        self.stats.duplicates += 1;
                        self.send_secondary(LinkFunction::Ack);
                    }
                }
            },
            LinkFunction::UnconfirmedUserData => {
                self.events.push(LinkEvent::UserData(payload));
            }
            LinkFunction::TestLink => match self.sec {
                SecState::Reset { expected_fcb } if header.control.fcb == expected_fcb => {
                    self.sec = SecState::Reset {
                        expected_fcb: !expected_fcb,
                    };
                    self.send_secondary(LinkFunction::Ack);
                }
                _ => self.send_secondary(LinkFunction::Nack),
            },
            LinkFunction::RequestLinkStatus => {
                self.send_secondary(LinkFunction::LinkStatus);
            }
            _ => unreachable!("secondary half only sees primary functions"),
        }
    }

    fn send_secondary(&mut self, function: LinkFunction) {
        let ctrl = ControlField::new(self.config.is_master, false, false, function);
        self.transmit_frame(ctrl, &[]);
    }

    // ─── Shared ─────────────────────────────────────────────────────────

    fn transmit_frame(&mut self, control: ControlField, payload: &[u8]) -> Bytes {
        let frame = write_frame(
            control,
            self.config.remote_address,
            self.config.local_address,
            payload,
        )
        .freeze();
        self.stats.frames_tx += 1;
        self.events.push(LinkEvent::Transmit(frame.clone()));
        frame
    }

    fn absorb_framing_error(&mut self, err: FramingError) {
        self.stats.framing_errors += 1;
        tracing::warn!(error = %err, "link frame dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn master_link() -> LinkLayer {
        LinkLayer::new(LinkConfig {
            local_address: 1024,
            remote_address: 1,
            is_master: true,
            num_retry: 2,
            ack_timeout: Duration::from_millis(500),
        })
    }

    fn outstation_link() -> LinkLayer {
        LinkLayer::new(LinkConfig {
            local_address: 1,
            remote_address: 1024,
            is_master: false,
            num_retry: 2,
            ack_timeout: Duration::from_millis(500),
        })
    }

    /// A secondary frame as the outstation (addr 1) would send it to the
    /// master (addr 1024).
    fn secondary_frame(function: LinkFunction) -> Bytes {
        write_frame(ControlField::new(false, false, false, function), 1024, 1, &[]).freeze()
    }

    fn transmits(link: &mut LinkLayer) -> Vec<Bytes> {
        link.drain_events()
            .filter_map(|e| match e {
                LinkEvent::Transmit(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn tx_function(frame: &[u8]) -> LinkFunction {
        let (header, _) = parse_frame(frame).unwrap();
        header.control.function().unwrap()
    }

    // ─── Unconfirmed path ───────────────────────────────────────────────

    #[test]
    fn unconfirmed_send_completes_immediately() {
        let mut link = master_link();
        link.transmit(Bytes::from_static(b"abc"), false, Instant::now())
            .unwrap();

        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events.len(), 2);
        match &events[0] {
            LinkEvent::Transmit(frame) => {
                assert_eq!(tx_function(frame), LinkFunction::UnconfirmedUserData)
            }
            other => panic!("expected Transmit, got {other:?}"),
        }
        assert_eq!(events[1], LinkEvent::SendSuccess);
    }

    // ─── Confirmed handshake ────────────────────────────────────────────

    #[test]
    fn confirmed_send_runs_reset_handshake_and_toggles_fcb() {
        let mut link = master_link();
        let now = Instant::now();

        link.transmit(Bytes::from_static(b"abc"), true, now).unwrap();
        let frames = transmits(&mut link);
        assert_eq!(frames.len(), 1);
        assert_eq!(tx_function(&frames[0]), LinkFunction::ResetLinkStates);

        // ACK for the reset releases the data frame with FCB = true.
        link.receive(&secondary_frame(LinkFunction::Ack), now);
        let frames = transmits(&mut link);
        assert_eq!(frames.len(), 1);
        let (header, payload) = parse_frame(&frames[0]).unwrap();
        assert_eq!(header.control.function(), Some(LinkFunction::ConfirmedUserData));
        assert!(header.control.fcb && header.control.fcv);
        assert_eq!(&payload[..], b"abc");

        // ACK for the data completes the transaction.
        link.receive(&secondary_frame(LinkFunction::Ack), now);
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events, vec![LinkEvent::SendSuccess]);
        assert!(link.is_reset());

        // Next confirmed send skips the reset and carries a toggled FCB.
        link.transmit(Bytes::from_static(b"def"), true, now).unwrap();
        let frames = transmits(&mut link);
        assert_eq!(frames.len(), 1);
        let (header, _) = parse_frame(&frames[0]).unwrap();
        assert_eq!(header.control.function(), Some(LinkFunction::ConfirmedUserData));
        assert!(!header.control.fcb);
    }

    #[test]
    fn transmit_while_busy_is_rejected() {
        let mut link = master_link();
        let now = Instant::now();
        link.transmit(Bytes::from_static(b"abc"), true, now).unwrap();
        assert_eq!(
            link.transmit(Bytes::from_static(b"def"), true, now),
            Err(LinkError::Busy)
        );
    }

    #[test]
    fn nack_fails_the_transaction() {
        let mut link = master_link();
        let now = Instant::now();
        link.transmit(Bytes::from_static(b"abc"), true, now).unwrap();
        link.drain_events().for_each(drop);

        link.receive(&secondary_frame(LinkFunction::Nack), now);
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events, vec![LinkEvent::SendFailure(LinkError::Rejected)]);
        assert!(!link.is_reset());
    }

    // ─── Retry and timeout ──────────────────────────────────────────────

    #[test]
    fn ack_timeout_retries_then_fails() {
        let mut link = master_link();
        let t0 = Instant::now();
        link.transmit(Bytes::from_static(b"abc"), true, t0).unwrap();
        let original = transmits(&mut link);

        // First expiry: retransmission of the identical frame.
        let t1 = t0 + Duration::from_millis(600);
        link.poll_timeout(t1);
        let retry = transmits(&mut link);
        assert_eq!(retry, original);

        // Second expiry: second retry.
        let t2 = t1 + Duration::from_millis(600);
        link.poll_timeout(t2);
        assert_eq!(transmits(&mut link).len(), 1);
        assert_eq!(link.stats().retries, 2);

        // Third expiry: budget exhausted.
        let t3 = t2 + Duration::from_millis(600);
        link.poll_timeout(t3);
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(
            events,
            vec![LinkEvent::SendFailure(LinkError::RetryExhausted)]
        );
    }

    #[test]
    fn timeout_before_deadline_does_nothing() {
        let mut link = master_link();
        let t0 = Instant::now();
        link.transmit(Bytes::from_static(b"abc"), true, t0).unwrap();
        link.drain_events().for_each(drop);

        link.poll_timeout(t0 + Duration::from_millis(100));
        assert_eq!(link.drain_events().count(), 0);
    }

    // ─── Secondary half ─────────────────────────────────────────────────

    fn primary_frame(function: LinkFunction, fcb: bool, fcv: bool, payload: &[u8]) -> Bytes {
        // Master (addr 1024) → outstation (addr 1).
        write_frame(ControlField::new(true, fcb, fcv, function), 1, 1024, payload).freeze()
    }

    #[test]
    fn secondary_acks_reset_and_delivers_confirmed_data() {
        let mut link = outstation_link();
        let now = Instant::now();

        link.receive(&primary_frame(LinkFunction::ResetLinkStates, false, false, &[]), now);
        let frames = transmits(&mut link);
        assert_eq!(frames.len(), 1);
        assert_eq!(tx_function(&frames[0]), LinkFunction::Ack);

        link.receive(
            &primary_frame(LinkFunction::ConfirmedUserData, true, true, b"xyz"),
            now,
        );
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LinkEvent::Transmit(f) if tx_function(f) == LinkFunction::Ack));
        assert_eq!(events[1], LinkEvent::UserData(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn duplicate_fcb_reacked_without_redelivery() {
        let mut link = outstation_link();
        let now = Instant::now();
        link.receive(&primary_frame(LinkFunction::ResetLinkStates, false, false, &[]), now);
        link.receive(
            &primary_frame(LinkFunction::ConfirmedUserData, true, true, b"xyz"),
            now,
        );
        link.drain_events().for_each(drop);

        // Same FCB again: the remote missed our ACK and retransmitted.
        link.receive(
            &primary_frame(LinkFunction::ConfirmedUserData, true, true, b"xyz"),
            now,
        );
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events.len(), 1, "no redelivery expected");
        assert!(matches!(&events[0], LinkEvent::Transmit(f) if tx_function(f) == LinkFunction::Ack));
        assert_eq!(link.stats().duplicates, 1);
    }

    #[test]
    fn confirmed_data_before_reset_is_nacked() {
        let mut link = outstation_link();
        link.receive(
            &primary_frame(LinkFunction::ConfirmedUserData, true, true, b"xyz"),
            Instant::now(),
        );
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LinkEvent::Transmit(f) if tx_function(f) == LinkFunction::Nack));
    }

    #[test]
    fn unconfirmed_data_delivered_without_ack() {
        let mut link = outstation_link();
        link.receive(
            &primary_frame(LinkFunction::UnconfirmedUserData, false, false, b"q"),
            Instant::now(),
        );
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events, vec![LinkEvent::UserData(Bytes::from_static(b"q"))]);
    }

    #[test]
    fn link_status_request_answered() {
        let mut link = outstation_link();
        link.receive(
            &primary_frame(LinkFunction::RequestLinkStatus, false, false, &[]),
            Instant::now(),
        );
        let frames = transmits(&mut link);
        assert_eq!(frames.len(), 1);
        assert_eq!(tx_function(&frames[0]), LinkFunction::LinkStatus);
    }

    // ─── Filtering and absorption ───────────────────────────────────────

    #[test]
    fn frames_for_other_stations_dropped() {
        let mut link = outstation_link();
        // Addressed to station 7, not us.
        let frame = write_frame(
            ControlField::new(true, false, false, LinkFunction::UnconfirmedUserData),
            7,
            1024,
            b"x",
        );
        link.receive(&frame, Instant::now());
        assert_eq!(link.drain_events().count(), 0);
        assert_eq!(link.stats().wrong_address, 1);
    }

    #[test]
    fn framing_errors_absorbed() {
        let mut link = outstation_link();
        let mut frame =
            primary_frame(LinkFunction::UnconfirmedUserData, false, false, b"x").to_vec();
        frame[8] ^= 0xFF;
        link.receive(&frame, Instant::now());
        assert_eq!(link.drain_events().count(), 0);
        assert_eq!(link.stats().framing_errors, 1);
    }

    #[test]
    fn keepalive_roundtrip_and_timeout() {
        let mut link = master_link();
        let t0 = Instant::now();
        link.request_link_status(t0).unwrap();
        let frames = transmits(&mut link);
        assert_eq!(tx_function(&frames[0]), LinkFunction::RequestLinkStatus);

        link.receive(&secondary_frame(LinkFunction::LinkStatus), t0);
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events, vec![LinkEvent::LinkStatusReceived]);

        // Unanswered keepalive reports a timeout and restores the state.
        link.request_link_status(t0).unwrap();
        link.drain_events().for_each(drop);
        link.poll_timeout(t0 + Duration::from_secs(1));
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(events, vec![LinkEvent::KeepaliveTimeout]);
        assert!(!link.is_reset());
    }

    #[test]
    fn layer_reset_fails_inflight_transaction() {
        let mut link = master_link();
        link.transmit(Bytes::from_static(b"abc"), true, Instant::now())
            .unwrap();
        link.drain_events().for_each(drop);

        link.reset();
        let events: Vec<_> = link.drain_events().collect();
        assert_eq!(
            events,
            vec![LinkEvent::SendFailure(LinkError::RetryExhausted)]
        );
    }
}
