//! # Application Channel
//!
//! The per-direction application-layer state machine: classifies outgoing
//! fragments, tracks the send → confirm/response lifecycle, validates
//! sequences, and guarantees that every initiated operation terminates with
//! exactly one of success / failure / canceled.
//!
//! ```text
//!          Send ───────────────┐
//!            │                 │
//!  Idle ─▶ SendConfirmed ─▶ WaitForConfirm ──▶ Idle
//!            │                                  ▲
//!          SendExpectResponse ─▶ WaitForFirstResponse ─▶ WaitForFinalResponse
//!            │                                  │ FIN            │ FIN
//!          SendCanceled ─▶ Idle                 └────────────────┘
//! ```
//!
//! The channel does not serialize bytes itself; the owner hands fragments to
//! the transport function and reports send completions back in.

use quanta::Instant;
use std::time::Duration;

use crate::apdu::{Apdu, AppControl, FunctionCode};
use crate::config::AppConfig;
use crate::error::AppError;

// ─── States ──────────────────────────────────────────────────────────────────

/// Application channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    /// Sending a fragment with no reply expected.
    Send,
    /// Sending a response that the peer must confirm.
    SendConfirmed,
    /// Sending a request that expects a solicited response.
    SendExpectResponse,
    /// A cancel arrived while a send was in flight.
    SendCanceled,
    WaitForConfirm,
    WaitForFirstResponse,
    WaitForFinalResponse,
}

// ─── Notices ─────────────────────────────────────────────────────────────────

/// Terminal and intermediate notifications to the operation initiator.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// The operation completed (sent, confirmed, or final response received).
    Success,
    Failure(AppError),
    Canceled,
    /// A response fragment arrived (possibly non-final).
    Response(Apdu),
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// One direction of the application layer.
pub struct AppChannel {
    confirm_timeout: Duration,
    response_timeout: Duration,
    state: ChannelState,
    /// Sequence of the in-flight fragment.
    seq: u8,
    deadline: Option<Instant>,
    notices: Vec<ChannelNotice>,
}

impl AppChannel {
    pub fn new(config: &AppConfig) -> Self {
        AppChannel {
            confirm_timeout: config.confirm_timeout,
            response_timeout: config.response_timeout,
            state: ChannelState::Idle,
            seq: 0,
            deadline: None,
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether an operation is outstanding.
    pub fn is_busy(&self) -> bool {
        self.state != ChannelState::Idle
    }

    /// Begin an outbound operation. The fragment classification decides which
    /// completion the channel will wait for:
    ///
    /// - CONFIRM and unconfirmed unsolicited fragments complete on send;
    /// - responses with CON set wait for the peer's CONFIRM;
    /// - requests that expect a response wait for the response.
    pub fn send(&mut self, function: FunctionCode, control: AppControl) -> Result<(), AppError> {
        if self.state != ChannelState::Idle {
            return Err(AppError::Busy);
        }
        self.seq = control.seq;
        self.state = if function.is_response() {
            if control.con {
                ChannelState::SendConfirmed
            } else {
                ChannelState::Send
            }
        } else if function.expects_response() {
            ChannelState::SendExpectResponse
        } else {
            ChannelState::Send
        };
        Ok(())
    }

    /// The lower layers finished emitting the fragment.
    pub fn on_send_success(&mut self, now: Instant) {
        match self.state {
            ChannelState::Send => {
                self.state = ChannelState::Idle;
                self.notices.push(ChannelNotice::Success);
            }
            ChannelState::SendConfirmed => {
                self.state = ChannelState::WaitForConfirm;
                self.deadline = Some(now + self.confirm_timeout);
            }
            ChannelState::SendExpectResponse => {
                self.state = ChannelState::WaitForFirstResponse;
                self.deadline = Some(now + self.response_timeout);
            }
            ChannelState::SendCanceled => {
                self.state = ChannelState::Idle;
                self.notices.push(ChannelNotice::Canceled);
            }
            _ => tracing::debug!(state = ?self.state, "spurious send success"),
        }
    }

    /// The lower layers failed to emit the fragment.
    pub fn on_send_failure(&mut self) {
        match self.state {
            ChannelState::Send
            | ChannelState::SendConfirmed
            | ChannelState::SendExpectResponse => {
                self.state = ChannelState::Idle;
                self.notices.push(ChannelNotice::Failure(AppError::SendFailed));
            }
            ChannelState::SendCanceled => {
                self.state = ChannelState::Idle;
                self.notices.push(ChannelNotice::Canceled);
            }
            _ => tracing::debug!(state = ?self.state, "spurious send failure"),
        }
    }

    /// A CONFIRM fragment arrived from the peer.
    pub fn on_confirm(&mut self, seq: u8) {
        if self.state != ChannelState::WaitForConfirm {
            tracing::debug!(seq, "confirm outside WaitForConfirm dropped");
            return;
        }
        if seq != self.seq {
            tracing::warn!(expected = self.seq, got = seq, "confirm sequence mismatch");
            return;
        }
        self.state = ChannelState::Idle;
        self.deadline = None;
        self.notices.push(ChannelNotice::Success);
    }

    /// A RESPONSE fragment arrived from the peer.
    pub fn on_response(&mut self, apdu: Apdu, now: Instant) {
        let first = match self.state {
            ChannelState::WaitForFirstResponse => true,
            ChannelState::WaitForFinalResponse => false,
            _ => {
                tracing::debug!("response outside response wait dropped");
                return;
            }
        };

        if apdu.control.seq != self.seq {
            self.finish(ChannelNotice::Failure(AppError::SequenceMismatch {
                expected: self.seq,
                got: apdu.control.seq,
            }));
            return;
        }
        // FIR is validated only on the first fragment of a multi-part reply.
        if first && !apdu.control.fir {
            self.finish(ChannelNotice::Failure(AppError::BadResponse));
            return;
        }

        let fin = apdu.control.fin;
        self.notices.push(ChannelNotice::Response(apdu));
        if fin {
            self.finish(ChannelNotice::Success);
        } else {
            self.state = ChannelState::WaitForFinalResponse;
            self.deadline = Some(now + self.response_timeout);
        }
    }

    /// Check the confirm/response deadline. Call on every timer tick.
    pub fn poll_timeout(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        match self.state {
            ChannelState::WaitForConfirm
            | ChannelState::WaitForFirstResponse
            | ChannelState::WaitForFinalResponse => {
                tracing::warn!(state = ?self.state, "application timeout");
                self.finish(ChannelNotice::Failure(AppError::Timeout));
            }
            _ => self.deadline = None,
        }
    }

    /// Cancel the outstanding operation. During an in-flight send the
    /// cancellation is acknowledged on the next send completion; in a wait
    /// state it takes effect immediately.
    pub fn cancel(&mut self) {
        match self.state {
            ChannelState::Idle | ChannelState::SendCanceled => {}
            ChannelState::Send
            | ChannelState::SendConfirmed
            | ChannelState::SendExpectResponse => {
                self.state = ChannelState::SendCanceled;
            }
            ChannelState::WaitForConfirm
            | ChannelState::WaitForFirstResponse
            | ChannelState::WaitForFinalResponse => {
                self.finish(ChannelNotice::Canceled);
            }
        }
    }

    /// The layer below went down; the outstanding operation fails.
    pub fn on_layer_down(&mut self) {
        if self.state != ChannelState::Idle {
            self.finish(ChannelNotice::Failure(AppError::LayerDown));
        }
    }

    pub fn drain_notices(&mut self) -> impl Iterator<Item = ChannelNotice> + '_ {
        self.notices.drain(..)
    }

    fn finish(&mut self, notice: ChannelNotice) {
        self.state = ChannelState::Idle;
        self.deadline = None;
        self.notices.push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::{ApduBuilder, IinField};

    fn channel() -> AppChannel {
        AppChannel::new(&AppConfig {
            confirm_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn response(seq: u8, fir: bool, fin: bool) -> Apdu {
        let control = AppControl {
            fir,
            fin,
            con: false,
            uns: false,
            seq,
        };
        let mut builder = ApduBuilder::response(FunctionCode::Response, control, 2048);
        builder.set_iin(IinField::empty());
        Apdu::parse(builder.freeze()).unwrap()
    }

    fn notices(ch: &mut AppChannel) -> Vec<ChannelNotice> {
        ch.drain_notices().collect()
    }

    // ─── Classification ─────────────────────────────────────────────────

    #[test]
    fn confirm_fragment_completes_on_send() {
        let mut ch = channel();
        ch.send(FunctionCode::Confirm, AppControl::single(0)).unwrap();
        assert_eq!(ch.state(), ChannelState::Send);
        ch.on_send_success(Instant::now());
        assert_eq!(notices(&mut ch), vec![ChannelNotice::Success]);
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn unconfirmed_unsolicited_completes_on_send() {
        let mut ch = channel();
        ch.send(
            FunctionCode::UnsolicitedResponse,
            AppControl::single(1).with_uns(),
        )
        .unwrap();
        assert_eq!(ch.state(), ChannelState::Send);
    }

    #[test]
    fn confirmed_response_waits_for_confirm() {
        let mut ch = channel();
        ch.send(
            FunctionCode::Response,
            AppControl::single(4).with_con(),
        )
        .unwrap();
        assert_eq!(ch.state(), ChannelState::SendConfirmed);
        ch.on_send_success(Instant::now());
        assert_eq!(ch.state(), ChannelState::WaitForConfirm);

        ch.on_confirm(4);
        assert_eq!(notices(&mut ch), vec![ChannelNotice::Success]);
    }

    #[test]
    fn request_waits_for_response() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(2)).unwrap();
        assert_eq!(ch.state(), ChannelState::SendExpectResponse);
        ch.on_send_success(Instant::now());
        assert_eq!(ch.state(), ChannelState::WaitForFirstResponse);
    }

    #[test]
    fn second_send_is_rejected() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(2)).unwrap();
        assert_eq!(
            ch.send(FunctionCode::Read, AppControl::single(3)),
            Err(AppError::Busy)
        );
    }

    // ─── Responses ──────────────────────────────────────────────────────

    #[test]
    fn single_fragment_response_completes() {
        let mut ch = channel();
        let now = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(2)).unwrap();
        ch.on_send_success(now);

        ch.on_response(response(2, true, true), now);
        let got = notices(&mut ch);
        assert_eq!(got.len(), 2);
        assert!(matches!(got[0], ChannelNotice::Response(_)));
        assert_eq!(got[1], ChannelNotice::Success);
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn multi_fragment_response_validates_fir_only_on_first() {
        let mut ch = channel();
        let now = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(5)).unwrap();
        ch.on_send_success(now);

        ch.on_response(response(5, true, false), now);
        assert_eq!(ch.state(), ChannelState::WaitForFinalResponse);

        // Middle fragment without FIR is fine now.
        ch.on_response(response(5, false, false), now);
        assert_eq!(ch.state(), ChannelState::WaitForFinalResponse);

        ch.on_response(response(5, false, true), now);
        let got = notices(&mut ch);
        assert_eq!(got.len(), 4);
        assert_eq!(got[3], ChannelNotice::Success);
    }

    #[test]
    fn missing_fir_on_first_fragment_fails() {
        let mut ch = channel();
        let now = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(5)).unwrap();
        ch.on_send_success(now);

        ch.on_response(response(5, false, true), now);
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::BadResponse)]
        );
    }

    #[test]
    fn sequence_mismatch_fails_operation() {
        let mut ch = channel();
        let now = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(2)).unwrap();
        ch.on_send_success(now);

        ch.on_response(response(9, true, true), now);
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::SequenceMismatch {
                expected: 2,
                got: 9
            })]
        );
    }

    // ─── Timeouts ───────────────────────────────────────────────────────

    #[test]
    fn confirm_timeout_reports_failure() {
        let mut ch = channel();
        let t0 = Instant::now();
        ch.send(FunctionCode::Response, AppControl::single(0).with_con())
            .unwrap();
        ch.on_send_success(t0);

        ch.poll_timeout(t0 + Duration::from_millis(500));
        assert_eq!(notices(&mut ch), vec![]);

        ch.poll_timeout(t0 + Duration::from_millis(1500));
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::Timeout)]
        );
    }

    #[test]
    fn response_timer_restarts_per_fragment() {
        let mut ch = channel();
        let t0 = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(1)).unwrap();
        ch.on_send_success(t0);

        // A non-final fragment at t+1.5s re-arms the 2s response timer.
        let t1 = t0 + Duration::from_millis(1500);
        ch.on_response(response(1, true, false), t1);
        ch.poll_timeout(t0 + Duration::from_millis(2500));
        let got = notices(&mut ch);
        assert_eq!(got.len(), 1, "only the fragment so far: {got:?}");

        ch.poll_timeout(t1 + Duration::from_millis(2500));
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::Timeout)]
        );
    }

    // ─── Cancellation ───────────────────────────────────────────────────

    #[test]
    fn cancel_during_send_acknowledged_on_completion() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(0)).unwrap();
        ch.cancel();
        assert_eq!(ch.state(), ChannelState::SendCanceled);
        // A second cancel is a no-op.
        ch.cancel();

        ch.on_send_success(Instant::now());
        assert_eq!(notices(&mut ch), vec![ChannelNotice::Canceled]);
        assert_eq!(ch.state(), ChannelState::Idle);
    }

    #[test]
    fn cancel_during_send_acknowledged_on_failure_too() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(0)).unwrap();
        ch.cancel();
        ch.on_send_failure();
        assert_eq!(notices(&mut ch), vec![ChannelNotice::Canceled]);
    }

    #[test]
    fn cancel_while_waiting_is_immediate() {
        let mut ch = channel();
        let now = Instant::now();
        ch.send(FunctionCode::Read, AppControl::single(0)).unwrap();
        ch.on_send_success(now);
        ch.cancel();
        assert_eq!(notices(&mut ch), vec![ChannelNotice::Canceled]);
        assert!(!ch.is_busy());
    }

    // ─── Failure paths ──────────────────────────────────────────────────

    #[test]
    fn send_failure_reports_once() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(0)).unwrap();
        ch.on_send_failure();
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::SendFailed)]
        );
    }

    #[test]
    fn layer_down_fails_outstanding_operation() {
        let mut ch = channel();
        ch.send(FunctionCode::Read, AppControl::single(0)).unwrap();
        ch.on_send_success(Instant::now());
        ch.on_layer_down();
        assert_eq!(
            notices(&mut ch),
            vec![ChannelNotice::Failure(AppError::LayerDown)]
        );
    }

    #[test]
    fn stale_confirm_ignored() {
        let mut ch = channel();
        ch.on_confirm(3);
        assert!(notices(&mut ch).is_empty());
    }
}
