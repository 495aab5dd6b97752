//! # Generic state machine
//!
//! A table-driven finite state machine over closed state and event enums.
//! The table (states, transactions, hooks and listeners) is assembled once
//! into a [`StateMachineFactory`]; each invocation builds its own
//! [`StateMachine`] positioned at an initial state with a private context.
//!
//! A successful transition runs, in order: exit action of the current state,
//! the state change, entry action of the target, internal logic of the
//! target, state-change listeners, then listeners registered for the fired
//! event. A refused transition leaves the machine untouched.

mod state;

pub use state::{Action, FsmState, Guard, InternalLogic, Transaction};

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

/// Listener notified with the new state after every transition.
pub type StateListener<S, C> = Arc<dyn Fn(&S, &C) + Send + Sync>;

/// Listener notified when a transaction for its event fires.
pub type EventListener<E, C> = Arc<dyn Fn(&E, &C) + Send + Sync>;

/// Raised when no transaction leads from the current state to the requested one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {current:?} to {target:?} (available: {available:?})")]
pub struct InvalidTransitionError<S: fmt::Debug> {
    pub current: S,
    pub target: S,
    pub available: Vec<S>,
}

struct Definition<S, E, C, I> {
    states: HashMap<S, FsmState<S, E, C, I>>,
    error: Option<(S, E)>,
    state_listeners: Vec<StateListener<S, C>>,
    event_listeners: HashMap<E, Vec<EventListener<E, C>>>,
}

/// Immutable machine definition; cheap to clone and share across tasks.
pub struct StateMachineFactory<S, E, C, I> {
    definition: Arc<Definition<S, E, C, I>>,
}

impl<S, E, C, I> Clone for StateMachineFactory<S, E, C, I> {
    fn clone(&self) -> Self {
        Self {
            definition: Arc::clone(&self.definition),
        }
    }
}

impl<S, E, C, I> StateMachineFactory<S, E, C, I>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    #[must_use]
    pub fn builder() -> StateMachineFactoryBuilder<S, E, C, I> {
        StateMachineFactoryBuilder {
            states: HashMap::new(),
            error: None,
            state_listeners: Vec::new(),
            event_listeners: HashMap::new(),
        }
    }

    /// Construct a machine positioned at `initial` with its own context.
    pub fn build(&self, initial: S, context: C) -> StateMachine<S, E, C, I> {
        StateMachine {
            current: initial,
            context,
            definition: Arc::clone(&self.definition),
        }
    }

    /// State definition, if the state declares anything.
    pub fn state(&self, state: S) -> Option<&FsmState<S, E, C, I>> {
        self.definition.states.get(&state)
    }

    /// Designated error state and the event that reaches it.
    pub fn error_state(&self) -> Option<(S, E)> {
        self.definition.error
    }
}

pub struct StateMachineFactoryBuilder<S, E, C, I> {
    states: HashMap<S, FsmState<S, E, C, I>>,
    error: Option<(S, E)>,
    state_listeners: Vec<StateListener<S, C>>,
    event_listeners: HashMap<E, Vec<EventListener<E, C>>>,
}

impl<S, E, C, I> StateMachineFactoryBuilder<S, E, C, I>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    /// Register a state definition. A later definition for the same state replaces the earlier one.
    #[must_use]
    pub fn state(mut self, definition: FsmState<S, E, C, I>) -> Self {
        self.states.insert(definition.state, definition);
        self
    }

    #[must_use]
    pub fn error_state(mut self, state: S, event: E) -> Self {
        self.error = Some((state, event));
        self
    }

    #[must_use]
    pub fn on_state_change<L>(mut self, listener: L) -> Self
    where
        L: Fn(&S, &C) + Send + Sync + 'static,
    {
        self.state_listeners.push(Arc::new(listener));
        self
    }

    #[must_use]
    pub fn on_event<L>(mut self, event: E, listener: L) -> Self
    where
        L: Fn(&E, &C) + Send + Sync + 'static,
    {
        self.event_listeners
            .entry(event)
            .or_default()
            .push(Arc::new(listener));
        self
    }

    #[must_use]
    pub fn build(self) -> StateMachineFactory<S, E, C, I> {
        StateMachineFactory {
            definition: Arc::new(Definition {
                states: self.states,
                error: self.error,
                state_listeners: self.state_listeners,
                event_listeners: self.event_listeners,
            }),
        }
    }
}

/// A single machine instance. Not shared across runs.
pub struct StateMachine<S, E, C, I> {
    current: S,
    context: C,
    definition: Arc<Definition<S, E, C, I>>,
}

impl<S, E, C, I> StateMachine<S, E, C, I>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    /// Target states reachable from the current state.
    pub fn available(&self) -> Vec<S> {
        self.definition
            .states
            .get(&self.current)
            .map(FsmState::targets)
            .unwrap_or_default()
    }

    /// Move to `target` through the first transaction that leads there and whose guard holds.
    ///
    /// Returns the event that fired.
    pub fn go_to_state(
        &mut self,
        target: S,
        input: Option<&I>,
    ) -> Result<E, InvalidTransitionError<S>> {
        let transaction = self
            .definition
            .states
            .get(&self.current)
            .and_then(|state| {
                state
                    .transactions
                    .iter()
                    .find(|t| t.target == target && t.allows(&self.context, input))
            })
            .cloned();

        match transaction {
            Some(transaction) => {
                self.apply(&transaction, input);
                Ok(transaction.event)
            }
            None => Err(self.refusal(target)),
        }
    }

    /// Fire `event` from the current state through the first matching transaction.
    ///
    /// Returns the state reached.
    pub fn fire(&mut self, event: E, input: Option<&I>) -> Result<S, InvalidTransitionError<S>> {
        let transaction = self
            .definition
            .states
            .get(&self.current)
            .and_then(|state| {
                state
                    .transactions
                    .iter()
                    .find(|t| t.event == event && t.allows(&self.context, input))
            })
            .cloned();

        match transaction {
            Some(transaction) => {
                self.apply(&transaction, input);
                Ok(transaction.target)
            }
            None => Err(self.refusal(self.current)),
        }
    }

    /// Move to the designated error state, if one is configured and reachable.
    pub fn fail(&mut self, input: Option<&I>) -> Result<S, InvalidTransitionError<S>> {
        match self.definition.error {
            Some((state, _)) => self.go_to_state(state, input).map(|_| state),
            None => Err(self.refusal(self.current)),
        }
    }

    fn refusal(&self, target: S) -> InvalidTransitionError<S> {
        InvalidTransitionError {
            current: self.current,
            target,
            available: self.available(),
        }
    }

    fn apply(&mut self, transaction: &Transaction<S, E, C, I>, input: Option<&I>) {
        let definition = Arc::clone(&self.definition);
        let from = self.current;

        if let Some(exit) = definition.states.get(&from).and_then(|s| s.exit.as_ref()) {
            exit(&mut self.context);
        }

        self.current = transaction.target;
        trace!(from = ?from, to = ?self.current, event = ?transaction.event, "state transition");

        if let Some(target) = definition.states.get(&self.current) {
            if let Some(entry) = target.entry.as_ref() {
                entry(&mut self.context);
            }
            if let Some(logic) = target.internal_logic.as_ref() {
                logic(&mut self.context, input);
            }
        }

        for listener in &definition.state_listeners {
            listener(&self.current, &self.context);
        }

        if let Some(listeners) = definition.event_listeners.get(&transaction.event) {
            for listener in listeners {
                listener(&transaction.event, &self.context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
        Broken,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Signal {
        Go,
        Slow,
        Halt,
        Fault,
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn factory(log: &Log) -> StateMachineFactory<Light, Signal, Vec<String>, u32> {
        let exit_log = log.clone();
        let entry_log = log.clone();
        let logic_log = log.clone();
        let state_log = log.clone();
        let event_log = log.clone();

        StateMachineFactory::builder()
            .state(
                FsmState::new(Light::Red)
                    .with_transaction(Signal::Go, Light::Green)
                    .with_transaction(Signal::Fault, Light::Broken)
                    .on_exit(move |_| record(&exit_log, "exit:red")),
            )
            .state(
                FsmState::new(Light::Green)
                    .with(Transaction::guarded(Signal::Slow, Light::Yellow, |_: &Vec<String>, input: Option<&u32>| {
                        input.is_some_and(|speed| *speed < 50)
                    }))
                    .with_transaction(Signal::Fault, Light::Broken)
                    .on_entry(move |_| record(&entry_log, "entry:green"))
                    .with_internal_logic(move |ctx, _| {
                        ctx.push("green".to_string());
                        record(&logic_log, "logic:green");
                    }),
            )
            .state(FsmState::new(Light::Yellow).with_transaction(Signal::Halt, Light::Red))
            .state(FsmState::new(Light::Broken))
            .error_state(Light::Broken, Signal::Fault)
            .on_state_change(move |state, _| record(&state_log, &format!("state:{state:?}")))
            .on_event(Signal::Go, move |event, _| {
                record(&event_log, &format!("event:{event:?}"));
            })
            .build()
    }

    #[test]
    fn transition_runs_hooks_in_order() {
        let log: Log = Arc::default();
        let mut fsm = factory(&log).build(Light::Red, Vec::new());

        let event = fsm.go_to_state(Light::Green, None).unwrap();

        assert_eq!(event, Signal::Go);
        assert_eq!(fsm.current_state(), Light::Green);
        assert_eq!(fsm.context(), &vec!["green".to_string()]);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "exit:red",
                "entry:green",
                "logic:green",
                "state:Green",
                "event:Go"
            ]
        );
    }

    #[test]
    fn unknown_target_is_refused_without_side_effects() {
        let log: Log = Arc::default();
        let mut fsm = factory(&log).build(Light::Red, Vec::new());

        let err = fsm.go_to_state(Light::Yellow, None).unwrap_err();

        assert_eq!(err.current, Light::Red);
        assert_eq!(err.target, Light::Yellow);
        assert_eq!(err.available, vec![Light::Green, Light::Broken]);
        assert_eq!(fsm.current_state(), Light::Red);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_guard_refuses_transition() {
        let log: Log = Arc::default();
        let mut fsm = factory(&log).build(Light::Green, Vec::new());

        assert!(fsm.go_to_state(Light::Yellow, Some(&80)).is_err());
        assert!(fsm.go_to_state(Light::Yellow, None).is_err());
        assert_eq!(fsm.current_state(), Light::Green);

        assert_eq!(fsm.go_to_state(Light::Yellow, Some(&30)), Ok(Signal::Slow));
    }

    #[test]
    fn fire_selects_transaction_by_event() {
        let log: Log = Arc::default();
        let mut fsm = factory(&log).build(Light::Yellow, Vec::new());

        assert_eq!(fsm.fire(Signal::Halt, None), Ok(Light::Red));
        assert!(fsm.fire(Signal::Halt, None).is_err());
        assert_eq!(fsm.current_state(), Light::Red);
    }

    #[test]
    fn fail_moves_to_error_state() {
        let log: Log = Arc::default();
        let factory = factory(&log);
        let mut fsm = factory.build(Light::Green, Vec::new());

        assert_eq!(fsm.fail(None), Ok(Light::Broken));
        // no outgoing transitions from the error state in this table
        assert!(fsm.fail(None).is_err());
        assert_eq!(factory.error_state(), Some((Light::Broken, Signal::Fault)));
    }

    #[test]
    fn machines_do_not_share_context() {
        let log: Log = Arc::default();
        let factory = factory(&log);
        let mut first = factory.build(Light::Red, Vec::new());
        let second = factory.build(Light::Red, Vec::new());

        first.go_to_state(Light::Green, None).unwrap();

        assert_eq!(first.context().len(), 1);
        assert!(second.context().is_empty());
        assert_eq!(second.current_state(), Light::Red);
    }
}
