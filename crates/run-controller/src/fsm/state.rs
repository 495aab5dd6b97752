//! State and transaction definitions for the generic state machine.

use std::fmt;
use std::sync::Arc;

/// Guard deciding whether a transaction may fire. Must be free of side effects.
pub type Guard<C, I> = Arc<dyn Fn(&C, Option<&I>) -> bool + Send + Sync>;

/// Entry or exit action run against the machine context.
pub type Action<C> = Arc<dyn Fn(&mut C) + Send + Sync>;

/// Internal logic executed after entering a state; receives the transition input.
pub type InternalLogic<C, I> = Arc<dyn Fn(&mut C, Option<&I>) + Send + Sync>;

/// An outgoing edge: `event` moves the machine to `target` when `guard` holds.
pub struct Transaction<S, E, C, I> {
    pub event: E,
    pub target: S,
    pub(crate) guard: Guard<C, I>,
}

impl<S: Copy, E: Copy, C, I> Transaction<S, E, C, I> {
    /// Transaction whose guard always passes.
    pub fn new(event: E, target: S) -> Self {
        Self {
            event,
            target,
            guard: Arc::new(|_, _| true),
        }
    }

    /// Transaction with an explicit guard predicate.
    pub fn guarded<G>(event: E, target: S, guard: G) -> Self
    where
        G: Fn(&C, Option<&I>) -> bool + Send + Sync + 'static,
    {
        Self {
            event,
            target,
            guard: Arc::new(guard),
        }
    }

    pub(crate) fn allows(&self, context: &C, input: Option<&I>) -> bool {
        (self.guard)(context, input)
    }
}

impl<S: Copy, E: Copy, C, I> Clone for Transaction<S, E, C, I> {
    fn clone(&self) -> Self {
        Self {
            event: self.event,
            target: self.target,
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<S: fmt::Debug, E: fmt::Debug, C, I> fmt::Debug for Transaction<S, E, C, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("event", &self.event)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A state with its outgoing transactions and optional hooks.
///
/// Transactions keep their declaration order; lookups take the first match.
pub struct FsmState<S, E, C, I> {
    pub state: S,
    pub(crate) transactions: Vec<Transaction<S, E, C, I>>,
    pub(crate) entry: Option<Action<C>>,
    pub(crate) exit: Option<Action<C>>,
    pub(crate) internal_logic: Option<InternalLogic<C, I>>,
}

impl<S: Copy, E: Copy, C, I> FsmState<S, E, C, I> {
    #[must_use]
    pub fn new(state: S) -> Self {
        Self {
            state,
            transactions: Vec::new(),
            entry: None,
            exit: None,
            internal_logic: None,
        }
    }

    /// Add an unconditional transaction.
    #[must_use]
    pub fn with_transaction(mut self, event: E, target: S) -> Self {
        self.transactions.push(Transaction::new(event, target));
        self
    }

    /// Add a fully specified transaction.
    #[must_use]
    pub fn with(mut self, transaction: Transaction<S, E, C, I>) -> Self {
        self.transactions.push(transaction);
        self
    }

    #[must_use]
    pub fn on_entry<A>(mut self, action: A) -> Self
    where
        A: Fn(&mut C) + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(action));
        self
    }

    #[must_use]
    pub fn on_exit<A>(mut self, action: A) -> Self
    where
        A: Fn(&mut C) + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(action));
        self
    }

    #[must_use]
    pub fn with_internal_logic<L>(mut self, logic: L) -> Self
    where
        L: Fn(&mut C, Option<&I>) + Send + Sync + 'static,
    {
        self.internal_logic = Some(Arc::new(logic));
        self
    }

    pub fn transactions(&self) -> &[Transaction<S, E, C, I>] {
        &self.transactions
    }

    /// Target states reachable from here, in declaration order.
    pub fn targets(&self) -> Vec<S> {
        self.transactions.iter().map(|t| t.target).collect()
    }
}
