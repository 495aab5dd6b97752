//! Run lifecycle: the concrete state graph every Run moves through.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::fsm::{FsmState, StateMachine, StateMachineFactory};
use crate::model::Runnable;

/// Lifecycle states of a Run, shared with runnables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Created,
    Built,
    Ready,
    Running,
    Stop,
    Stopped,
    Resume,
    Completed,
    Error,
    Deleting,
    Deleted,
}

impl RunState {
    pub const ALL: [RunState; 11] = [
        RunState::Created,
        RunState::Built,
        RunState::Ready,
        RunState::Running,
        RunState::Stop,
        RunState::Stopped,
        RunState::Resume,
        RunState::Completed,
        RunState::Error,
        RunState::Deleting,
        RunState::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::Built => "BUILT",
            RunState::Ready => "READY",
            RunState::Running => "RUNNING",
            RunState::Stop => "STOP",
            RunState::Stopped => "STOPPED",
            RunState::Resume => "RESUME",
            RunState::Completed => "COMPLETED",
            RunState::Error => "ERROR",
            RunState::Deleting => "DELETING",
            RunState::Deleted => "DELETED",
        }
    }

    /// No transitions leave this state.
    pub fn is_terminal(self) -> bool {
        self == RunState::Deleted
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown run state: {s}"))
    }
}

/// Events that drive the run graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    Build,
    Run,
    Execute,
    Pending,
    Loop,
    Complete,
    Error,
    Stop,
    Resume,
    Deleting,
}

impl RunEvent {
    pub const ALL: [RunEvent; 10] = [
        RunEvent::Build,
        RunEvent::Run,
        RunEvent::Execute,
        RunEvent::Pending,
        RunEvent::Loop,
        RunEvent::Complete,
        RunEvent::Error,
        RunEvent::Stop,
        RunEvent::Resume,
        RunEvent::Deleting,
    ];
}

/// Per-invocation key-value bag threaded through the run machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub values: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            values: BTreeMap::new(),
        }
    }

    /// Failure message recorded when the machine entered ERROR.
    pub fn error_message(&self) -> Option<&str> {
        self.values.get("error").and_then(Value::as_str)
    }
}

pub type RunStateMachine = StateMachine<RunState, RunEvent, RunContext, Runnable>;
pub type RunStateMachineFactory = StateMachineFactory<RunState, RunEvent, RunContext, Runnable>;

/// The run graph. All guards pass; the table is the policy.
pub fn run_state_machine() -> RunStateMachineFactory {
    use RunEvent as E;
    use RunState as S;

    StateMachineFactory::builder()
        .state(
            FsmState::new(S::Created)
                .with_transaction(E::Build, S::Built)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Built)
                .with_transaction(E::Run, S::Ready)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Ready)
                .with_transaction(E::Execute, S::Running)
                .with_transaction(E::Pending, S::Ready)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Running)
                .with_transaction(E::Loop, S::Running)
                .with_transaction(E::Complete, S::Completed)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Stop, S::Stop)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Stop)
                .with_transaction(E::Stop, S::Stopped)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Stopped)
                .with_transaction(E::Resume, S::Resume)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Resume)
                .with_transaction(E::Execute, S::Running)
                .with_transaction(E::Error, S::Error)
                .with_transaction(E::Deleting, S::Deleting),
        )
        .state(
            FsmState::new(S::Completed)
                .with_transaction(E::Deleting, S::Deleting)
                .with_transaction(E::Deleting, S::Deleted),
        )
        .state(
            FsmState::new(S::Error)
                .with_transaction(E::Deleting, S::Deleting)
                .with_transaction(E::Deleting, S::Deleted)
                .with_internal_logic(|ctx: &mut RunContext, input: Option<&Runnable>| {
                    let message = input
                        .and_then(|r| r.error.clone().or_else(|| r.message.clone()))
                        .unwrap_or_else(|| "run failed".to_string());
                    ctx.values.insert("error".to_string(), Value::String(message));
                }),
        )
        .state(FsmState::new(S::Deleting).with_transaction(E::Deleting, S::Deleted))
        .state(FsmState::new(S::Deleted))
        .error_state(S::Error, E::Error)
        .on_state_change(|state, ctx: &RunContext| {
            debug!(run_id = %ctx.run_id, state = %state, "run state changed");
        })
        .build()
}
