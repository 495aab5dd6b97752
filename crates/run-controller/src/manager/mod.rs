//! Asynchronous coordination between runs, runnables and frameworks.
//!
//! Framework verbs go through the [`RunnableDispatcher`], which persists the
//! outcome and publishes a runnable change on an [`EventBus`]. The
//! [`RunManager`] consumes those changes and advances the run state graph.
//! Work on a single id is serialized with [`KeyedLocks`].

mod bus;
mod dispatcher;
mod locks;
mod runs;

pub use bus::{EventBus, EventHandler, EventReceiver};
pub use dispatcher::RunnableDispatcher;
pub use locks::KeyedLocks;
pub use runs::{InMemoryRunRepository, RunManager, RunRepository};
