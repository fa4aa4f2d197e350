//! Node liveness state machine.
//!
//! Sans-IO: `step` consumes an input, chains any internally generated
//! follow-up signals, and returns the ordered list of side effects for the
//! engine to execute. The machine itself never touches sockets, timers or
//! tables.
//!
//! States: NULL -> WAITING -> ACTIVE -> FAILING -> FAILED, with FAILED
//! re-arming to WAITING so a restarted node can connect again.

use smallvec::SmallVec;
use tracing::warn;

use crate::error::{HwmError, Result};

/// Node FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Null,
    /// Node record exists, waiting for its INIT request.
    Waiting,
    Active,
    /// Going down; updates are being propagated.
    Failing,
    Failed,
}

/// Inputs into the node FSM. `Active` and `Failed` are internal follow-up
/// signals; the engine feeds the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInput {
    Create,
    Init,
    Data,
    Term,
    Close,
    TimerPop,
    Timeout,
    Failed,
    Active,
}

/// Side effects the engine must perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    /// Re-arm the per-node timer with the configured keepalive period and
    /// start it as the INIT timeout window.
    ArmInitTimer,
    /// Stop the per-node timer.
    StopTimer,
    /// Send the INIT response on the node transport (priority).
    SendInitResponse,
    /// Start keepalive duty: send the first keepalive, bump the missed
    /// counter, start the timer.
    StartKeepalive,
    /// Parent location gains an active node.
    IncrementActiveNodes,
    /// Parent location loses an active node.
    DecrementActiveNodes,
    /// Route the frame to the application dispatcher.
    DispatchData,
    /// Mark every child process not running (each emits its own process
    /// notification).
    MarkProcessesDown,
    /// Keepalive tick: transmit a keepalive, account a miss, let the
    /// engine escalate to `Timeout` past the threshold.
    KeepaliveTick,
    /// Propagate the run-status transition through the global tables
    /// (notifications plus cluster NODE_UPDATE).
    PublishRunStatus,
    /// Tear down the node transport. Only meaningful for local nodes; a
    /// remote node shares its location's peer transport, which stays.
    CloseTransport,
}

pub type NodeActions = SmallVec<[NodeAction; 6]>;

/// The per-node state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeFsm {
    state: NodeState,
}

impl NodeFsm {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: NodeState::Null }
    }

    /// A machine already in a given state, for mirrors of remote nodes.
    #[must_use]
    pub const fn in_state(state: NodeState) -> Self {
        Self { state }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, NodeState::Active)
    }

    /// Force a state, bypassing the transition table. Used when applying
    /// remote updates that already encode the resulting state.
    pub fn force(&mut self, state: NodeState) {
        self.state = state;
    }

    /// Run one input (plus any internally chained signals) through the
    /// machine. On an invalid (state, input) pair the state is left
    /// untouched and an error is returned.
    pub fn step(&mut self, input: NodeInput) -> Result<NodeActions> {
        let mut actions = NodeActions::new();
        let mut next = Some(input);

        while let Some(signal) = next.take() {
            let (new_state, follow_up) = self.apply(signal, &mut actions)?;
            self.state = new_state;
            next = follow_up;
        }

        Ok(actions)
    }

    fn apply(
        &self,
        input: NodeInput,
        actions: &mut NodeActions,
    ) -> Result<(NodeState, Option<NodeInput>)> {
        use NodeInput as I;
        use NodeState as S;

        let out = match (input, self.state) {
            // A local node was configured. Arm the INIT window.
            (I::Create, S::Null) => {
                actions.push(NodeAction::ArmInitTimer);
                (S::Waiting, None)
            }

            // INIT request arrived on the accepted socket.
            (I::Init, S::Waiting) => {
                actions.push(NodeAction::StopTimer);
                actions.push(NodeAction::SendInitResponse);
                actions.push(NodeAction::StartKeepalive);
                actions.push(NodeAction::IncrementActiveNodes);
                (S::Active, Some(I::Active))
            }

            (I::Data, S::Active) => {
                actions.push(NodeAction::DispatchData);
                (S::Active, None)
            }

            // Connection lost or shutdown requested while up.
            (I::Term, S::Active) | (I::Term, S::Waiting) => {
                actions.push(NodeAction::StopTimer);
                actions.push(NodeAction::MarkProcessesDown);
                if self.state == S::Active {
                    actions.push(NodeAction::DecrementActiveNodes);
                }
                (S::Failing, Some(I::Term))
            }
            // Second TERM leg: propagate, then release.
            (I::Term, S::Failing) => {
                actions.push(NodeAction::PublishRunStatus);
                (S::Failing, Some(I::Failed))
            }
            (I::Term, S::Failed) => (S::Failed, None),

            (I::Close, S::Failed) => (S::Waiting, None),

            // INIT window expired without an INIT.
            (I::TimerPop, S::Waiting) => {
                actions.push(NodeAction::StopTimer);
                (S::Failing, Some(I::Term))
            }
            (I::TimerPop, S::Active) => {
                actions.push(NodeAction::KeepaliveTick);
                (S::Active, None)
            }

            // Keepalive threshold crossed; same teardown as TERM.
            (I::Timeout, S::Active) => {
                actions.push(NodeAction::StopTimer);
                actions.push(NodeAction::MarkProcessesDown);
                actions.push(NodeAction::DecrementActiveNodes);
                (S::Failing, Some(I::Term))
            }

            (I::Failed, S::Failing) => {
                actions.push(NodeAction::CloseTransport);
                (S::Failed, Some(I::Close))
            }

            // Internal signal: run-status changed, notify subscribers.
            (I::Active, S::Active) => {
                actions.push(NodeAction::PublishRunStatus);
                (S::Active, None)
            }

            (input, state) => {
                warn!(?input, ?state, "node fsm: invalid transition");
                return Err(HwmError::InvalidTransition {
                    fsm: "node",
                    input: input_name(input),
                    state: state_name(state),
                });
            }
        };

        Ok(out)
    }
}

const fn input_name(i: NodeInput) -> &'static str {
    match i {
        NodeInput::Create => "CREATE",
        NodeInput::Init => "INIT",
        NodeInput::Data => "DATA",
        NodeInput::Term => "TERM",
        NodeInput::Close => "CLOSE",
        NodeInput::TimerPop => "TIMER_POP",
        NodeInput::Timeout => "TIMEOUT",
        NodeInput::Failed => "FAILED",
        NodeInput::Active => "ACTIVE",
    }
}

const fn state_name(s: NodeState) -> &'static str {
    match s {
        NodeState::Null => "NULL",
        NodeState::Waiting => "WAITING",
        NodeState::Active => "ACTIVE",
        NodeState::Failing => "FAILING",
        NodeState::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_init_reaches_active() {
        let mut fsm = NodeFsm::new();

        let a = fsm.step(NodeInput::Create).unwrap();
        assert_eq!(fsm.state(), NodeState::Waiting);
        assert_eq!(a.as_slice(), &[NodeAction::ArmInitTimer]);

        let a = fsm.step(NodeInput::Init).unwrap();
        assert_eq!(fsm.state(), NodeState::Active);
        assert_eq!(
            a.as_slice(),
            &[
                NodeAction::StopTimer,
                NodeAction::SendInitResponse,
                NodeAction::StartKeepalive,
                NodeAction::IncrementActiveNodes,
                NodeAction::PublishRunStatus,
            ]
        );
    }

    #[test]
    fn term_on_active_tears_down_and_rearms_waiting() {
        let mut fsm = NodeFsm::in_state(NodeState::Active);
        let a = fsm.step(NodeInput::Term).unwrap();

        // Full teardown chain ends back in WAITING, ready for a restart.
        assert_eq!(fsm.state(), NodeState::Waiting);
        assert_eq!(
            a.as_slice(),
            &[
                NodeAction::StopTimer,
                NodeAction::MarkProcessesDown,
                NodeAction::DecrementActiveNodes,
                NodeAction::PublishRunStatus,
                NodeAction::CloseTransport,
            ]
        );
    }

    #[test]
    fn init_timeout_fails_without_decrement() {
        let mut fsm = NodeFsm::in_state(NodeState::Waiting);
        let a = fsm.step(NodeInput::TimerPop).unwrap();
        assert_eq!(fsm.state(), NodeState::Waiting); // via FAILED -> CLOSE
        assert!(a.contains(&NodeAction::PublishRunStatus));
        // Never went active, so the active-node counter is untouched.
        assert!(!a.contains(&NodeAction::DecrementActiveNodes));
    }

    #[test]
    fn keepalive_timeout_equals_term() {
        let mut fsm = NodeFsm::in_state(NodeState::Active);
        let a = fsm.step(NodeInput::Timeout).unwrap();
        assert_eq!(fsm.state(), NodeState::Waiting);
        assert!(a.contains(&NodeAction::DecrementActiveNodes));
        assert!(a.contains(&NodeAction::CloseTransport));
    }

    #[test]
    fn invalid_input_leaves_state_untouched() {
        let mut fsm = NodeFsm::new();
        let err = fsm.step(NodeInput::Init).unwrap_err();
        assert!(matches!(err, HwmError::InvalidTransition { .. }));
        assert_eq!(fsm.state(), NodeState::Null);
    }

    #[test]
    fn timer_pop_in_active_is_a_keepalive_tick() {
        let mut fsm = NodeFsm::in_state(NodeState::Active);
        let a = fsm.step(NodeInput::TimerPop).unwrap();
        assert_eq!(a.as_slice(), &[NodeAction::KeepaliveTick]);
        assert_eq!(fsm.state(), NodeState::Active);
    }
}
