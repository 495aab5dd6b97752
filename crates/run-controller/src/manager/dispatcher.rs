use std::sync::Arc;

use tracing::{error, info, instrument};

use super::{EventBus, KeyedLocks};
use crate::error::Result;
use crate::frameworks::FrameworkRegistry;
use crate::lifecycle::RunState;
use crate::model::{Runnable, RunnableChangedEvent};
use crate::store::RunnableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Run,
    Stop,
    Resume,
    Destroy,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Run => "run",
            Verb::Stop => "stop",
            Verb::Resume => "resume",
            Verb::Destroy => "destroy",
        }
    }
}

/// Applies framework verbs to runnables.
///
/// Each verb runs under the runnable's id lock, the outcome is persisted
/// (deleted runnables are removed) and then published as a
/// [`RunnableChangedEvent`]. A failing verb leaves the runnable in `ERROR`
/// with the backend message before the error is returned.
#[derive(Clone)]
pub struct RunnableDispatcher {
    frameworks: FrameworkRegistry,
    store: Arc<dyn RunnableStore>,
    locks: KeyedLocks,
    events: EventBus<RunnableChangedEvent>,
}

impl RunnableDispatcher {
    pub fn new(
        frameworks: FrameworkRegistry,
        store: Arc<dyn RunnableStore>,
        locks: KeyedLocks,
        events: EventBus<RunnableChangedEvent>,
    ) -> Self {
        Self {
            frameworks,
            store,
            locks,
            events,
        }
    }

    pub async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        self.dispatch(Verb::Run, runnable).await
    }

    pub async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        self.dispatch(Verb::Stop, runnable).await
    }

    pub async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        self.dispatch(Verb::Resume, runnable).await
    }

    pub async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        self.dispatch(Verb::Destroy, runnable).await
    }

    /// Latest stored snapshot of a runnable.
    pub async fn find(&self, framework: &str, id: &str) -> Result<Option<Runnable>> {
        Ok(self.store.find(framework, id).await?)
    }

    #[instrument(skip_all, fields(run_id = %runnable.id, framework = runnable.framework(), verb = verb.as_str()))]
    async fn dispatch(&self, verb: Verb, runnable: &Runnable) -> Result<Runnable> {
        let guard = self.locks.lock(&runnable.id).await;
        let framework = self.frameworks.get(runnable.framework())?;

        let outcome = match verb {
            Verb::Run => framework.run(runnable).await,
            Verb::Stop => framework.stop(runnable).await,
            Verb::Resume => framework.resume(runnable).await,
            Verb::Destroy => framework.destroy(runnable).await,
        };

        match outcome {
            Ok(updated) => {
                self.persist(&updated).await?;
                info!(state = %updated.state, "runnable updated");
                self.events
                    .publish(RunnableChangedEvent::from_runnable(updated.clone()))
                    .await;
                drop(guard);
                if updated.state == RunState::Deleted {
                    self.locks.forget(&runnable.id);
                }
                Ok(updated)
            }
            Err(e) => {
                error!(error = %e, "framework verb failed");
                let mut failed = runnable.clone();
                failed.credentials.erase();
                failed.fail(e.to_string());
                if let Err(store_error) = self.persist(&failed).await {
                    error!(error = %store_error, "failed to persist runnable failure");
                }
                self.events
                    .publish(RunnableChangedEvent::from_runnable(failed))
                    .await;
                Err(e)
            }
        }
    }

    async fn persist(&self, runnable: &Runnable) -> Result<()> {
        let kind = runnable.framework();
        if runnable.state == RunState::Deleted {
            self.store.remove(kind, &runnable.id).await?;
        } else {
            self.store.store(kind, runnable).await?;
        }
        Ok(())
    }
}
