//! Peer (location) liveness state machine.
//!
//! One instance per remote location. The local location is pinned to
//! `Active` at startup and never steps.
//!
//! NULL -> CONNECTING -> INIT -> ACTIVE -> FAILING -> FAILED. The record
//! is never deleted: FAILED absorbs late frames cleanly, and a fresh INIT
//! can resurrect the peer.

use smallvec::SmallVec;
use tracing::warn;

use crate::error::{HwmError, Result};

/// Peer FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Null,
    /// Outbound connect in flight.
    Connecting,
    /// INIT request sent, waiting for the response.
    Init,
    Active,
    /// Failure propagation in progress.
    Failing,
    Failed,
}

/// Inputs into the peer FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInput {
    /// Beacon from an unknown location; outbound connect initiated.
    Connect,
    /// The non-blocking connect completed (socket became writable).
    ConnectComplete,
    /// A peer INIT request or INIT-OK response arrived.
    InitRcvd,
    /// Local cluster tick.
    TimerPop,
    /// Keepalive threshold crossed.
    Timeout,
    /// Transport closed by the peer.
    Close,
    /// The peer's final replay chunk arrived.
    ReplayDone,
    /// Explicit failure (kickout).
    Fail,
}

/// Side effects for the engine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    /// Send our peer INIT request on the now-writable transport.
    SendInitRequest,
    /// Replay our full local inventory to this peer.
    StartReplay,
    /// Location became active: add/refresh the global row, notify.
    PublishLocationActive,
    /// Location went down: mark its nodes and processes inactive (each
    /// with its own notifications), then notify LOCATION_INACTIVE.
    FailAllNodes,
    PublishLocationInactive,
    /// Clear `replay_in_progress` for this peer.
    ClearReplayInProgress,
    /// Send the multicast beacon (local tick).
    SendBeacon,
    /// Tear down the peer transport.
    CloseTransport,
}

pub type PeerActions = SmallVec<[PeerAction; 4]>;

/// The per-location state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFsm {
    state: PeerState,
}

impl PeerFsm {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: PeerState::Null }
    }

    #[must_use]
    pub const fn in_state(state: PeerState) -> Self {
        Self { state }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, PeerState::Active)
    }

    /// Run one input through the machine.
    pub fn step(&mut self, input: PeerInput) -> Result<PeerActions> {
        use PeerInput as I;
        use PeerState as S;

        let mut actions = PeerActions::new();

        let next = match (input, self.state) {
            // FAILED may reconnect: a fresh beacon restarts discovery.
            (I::Connect, S::Null | S::Failed) => S::Connecting,

            (I::ConnectComplete, S::Connecting) => {
                actions.push(PeerAction::SendInitRequest);
                S::Init
            }

            // First contact, either direction: respond (engine side),
            // replay everything we have, go active.
            (I::InitRcvd, S::Null | S::Connecting | S::Init | S::Failed) => {
                actions.push(PeerAction::StartReplay);
                actions.push(PeerAction::PublishLocationActive);
                S::Active
            }

            // Duplicate INIT on a live session: the peer lost track of us,
            // re-sync it.
            (I::InitRcvd, S::Active) => {
                actions.push(PeerAction::StartReplay);
                S::Active
            }

            (I::TimerPop, S::Active) => {
                actions.push(PeerAction::SendBeacon);
                S::Active
            }

            (I::ReplayDone, S::Active) => {
                actions.push(PeerAction::ClearReplayInProgress);
                S::Active
            }

            // Kickout or EOF on a live peer: propagate, then tear down.
            (I::Timeout | I::Fail | I::Close, S::Active) => {
                actions.push(PeerAction::FailAllNodes);
                actions.push(PeerAction::PublishLocationInactive);
                actions.push(PeerAction::CloseTransport);
                S::Failed
            }

            // Connection lost before the session was up.
            (I::Timeout | I::Fail | I::Close, S::Connecting | S::Init) => {
                actions.push(PeerAction::CloseTransport);
                S::Failed
            }

            // Late events on a dead peer are discarded quietly.
            (I::Close | I::Fail | I::Timeout | I::ReplayDone, S::Failed) => S::Failed,

            (input, state) => {
                warn!(?input, ?state, "peer fsm: invalid transition");
                return Err(HwmError::InvalidTransition {
                    fsm: "peer",
                    input: input_name(input),
                    state: state_name(state),
                });
            }
        };

        self.state = next;
        Ok(actions)
    }
}

const fn input_name(i: PeerInput) -> &'static str {
    match i {
        PeerInput::Connect => "CONNECT",
        PeerInput::ConnectComplete => "CONNECT_COMPLETE",
        PeerInput::InitRcvd => "INIT_RCVD",
        PeerInput::TimerPop => "TIMER_POP",
        PeerInput::Timeout => "TIMEOUT",
        PeerInput::Close => "CLOSE",
        PeerInput::ReplayDone => "REPLAY_DONE",
        PeerInput::Fail => "FAIL",
    }
}

const fn state_name(s: PeerState) -> &'static str {
    match s {
        PeerState::Null => "NULL",
        PeerState::Connecting => "CONNECTING",
        PeerState::Init => "INIT",
        PeerState::Active => "ACTIVE",
        PeerState::Failing => "FAILING",
        PeerState::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_discovery_path() {
        let mut fsm = PeerFsm::new();

        fsm.step(PeerInput::Connect).unwrap();
        assert_eq!(fsm.state(), PeerState::Connecting);

        let a = fsm.step(PeerInput::ConnectComplete).unwrap();
        assert_eq!(a.as_slice(), &[PeerAction::SendInitRequest]);
        assert_eq!(fsm.state(), PeerState::Init);

        let a = fsm.step(PeerInput::InitRcvd).unwrap();
        assert_eq!(fsm.state(), PeerState::Active);
        assert!(a.contains(&PeerAction::StartReplay));
        assert!(a.contains(&PeerAction::PublishLocationActive));
    }

    #[test]
    fn inbound_init_goes_straight_active() {
        let mut fsm = PeerFsm::new();
        let a = fsm.step(PeerInput::InitRcvd).unwrap();
        assert_eq!(fsm.state(), PeerState::Active);
        assert!(a.contains(&PeerAction::StartReplay));
    }

    #[test]
    fn kickout_fails_everything_once() {
        let mut fsm = PeerFsm::in_state(PeerState::Active);
        let a = fsm.step(PeerInput::Fail).unwrap();
        assert_eq!(fsm.state(), PeerState::Failed);
        assert_eq!(
            a.as_slice(),
            &[
                PeerAction::FailAllNodes,
                PeerAction::PublishLocationInactive,
                PeerAction::CloseTransport,
            ]
        );

        // A late close on the dead peer is a no-op.
        let a = fsm.step(PeerInput::Close).unwrap();
        assert!(a.is_empty());
    }

    #[test]
    fn init_resurrects_failed_peer() {
        let mut fsm = PeerFsm::in_state(PeerState::Failed);
        let a = fsm.step(PeerInput::InitRcvd).unwrap();
        assert_eq!(fsm.state(), PeerState::Active);
        assert!(a.contains(&PeerAction::PublishLocationActive));
    }
}
