use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::{EventHandler, KeyedLocks, RunnableDispatcher};
use crate::error::{Error, Result};
use crate::lifecycle::{run_state_machine, RunContext, RunState, RunStateMachineFactory};
use crate::model::{Run, RunChangedEvent, Runnable, RunnableChangedEvent};
use crate::runtime::{EntityService, RuntimeRegistry};

const CHANGES_CAPACITY: usize = 256;

/// Persistence of runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save(&self, run: &Run) -> Result<()>;

    async fn find(&self, id: &str) -> Result<Option<Run>>;

    async fn find_all(&self) -> Result<Vec<Run>>;

    /// Removing a missing run is not an error.
    async fn remove(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<String, Run>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.runs.get(id).map(|run| run.clone()))
    }

    async fn find_all(&self) -> Result<Vec<Run>> {
        Ok(self.runs.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.runs.remove(id);
        Ok(())
    }
}

/// Drives runs through the run state graph.
///
/// Every state change goes through a fresh machine positioned at the stored
/// state, under the run's id lock. Framework verbs happen outside that lock;
/// their outcome comes back as a [`RunnableChangedEvent`] handled by
/// [`RunManager::on_runnable_changed`].
pub struct RunManager {
    repository: Arc<dyn RunRepository>,
    runtimes: RuntimeRegistry,
    entities: Arc<dyn EntityService>,
    dispatcher: RunnableDispatcher,
    machines: RunStateMachineFactory,
    locks: KeyedLocks,
    changes: broadcast::Sender<RunChangedEvent>,
}

impl RunManager {
    pub fn new(
        repository: Arc<dyn RunRepository>,
        runtimes: RuntimeRegistry,
        entities: Arc<dyn EntityService>,
        dispatcher: RunnableDispatcher,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            repository,
            runtimes,
            entities,
            dispatcher,
            machines: run_state_machine(),
            locks: KeyedLocks::new(),
            changes,
        }
    }

    /// Listen to applied run transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RunChangedEvent> {
        self.changes.subscribe()
    }

    pub async fn get(&self, id: &str) -> Result<Run> {
        self.repository
            .find(id)
            .await?
            .ok_or_else(|| Error::NotFound("run", id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Run>> {
        self.repository.find_all().await
    }

    /// Register a new run in `CREATED`.
    pub async fn create(&self, mut run: Run) -> Result<Run> {
        self.runtimes.for_run(&run)?;
        run.task_ref()?;
        run.state = RunState::Created;
        run.touch();
        self.repository.save(&run).await?;
        info!(run_id = %run.id, kind = %run.kind, task = %run.task, "run created");
        let _ = self.changes.send(RunChangedEvent {
            run: run.clone(),
            previous: RunState::Created,
        });
        Ok(run)
    }

    /// Resolve the effective spec and move to `BUILT`.
    #[instrument(skip(self))]
    pub async fn build(&self, id: &str) -> Result<Run> {
        let run = self.get(id).await?;
        let runtime = self.runtimes.for_run(&run)?;
        let task = run.task_ref()?;

        let resolved = async {
            let function = self.entities.function(&task).await?;
            let task = self.entities.task(&task).await?;
            runtime.build(&function, &task, &run)
        }
        .await;

        match resolved {
            Ok(spec) => {
                self.transition(id, RunState::Built, None, move |run| run.spec = spec)
                    .await
            }
            Err(e) => Err(self.fail(id, e).await),
        }
    }

    /// Produce the runnable, move to `READY` and submit it.
    #[instrument(skip(self))]
    pub async fn run(&self, id: &str) -> Result<Run> {
        let run = self.get(id).await?;
        let runtime = self.runtimes.for_run(&run)?;
        let runnable = match runtime.run(&run).await {
            Ok(runnable) => runnable,
            Err(e) => return Err(self.fail(id, e).await),
        };

        let framework = runnable.framework();
        let run = self
            .transition(id, RunState::Ready, Some(&runnable), move |run| {
                run.status
                    .insert("framework".to_string(), Value::String(framework.to_string()));
            })
            .await?;

        self.dispatcher.run(&runnable).await?;
        Ok(run)
    }

    /// Move to `STOP` and ask the framework to stop.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<Run> {
        let runnable = self.stored_runnable(id).await?;
        let run = self.transition(id, RunState::Stop, None, |_| {}).await?;
        self.dispatcher.stop(&runnable).await?;
        Ok(run)
    }

    /// Move to `RESUME` and ask the framework to resume.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: &str) -> Result<Run> {
        let runnable = self.stored_runnable(id).await?;
        let run = self.transition(id, RunState::Resume, None, |_| {}).await?;
        self.dispatcher.resume(&runnable).await?;
        Ok(run)
    }

    /// Move to `DELETING` and tear down backend objects. Runs that never
    /// reached a framework go straight to `DELETED`. Calling it again on a
    /// run left in `DELETING` retries the teardown.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<Run> {
        let current = self.get(id).await?;
        let run = if current.state == RunState::Deleting {
            info!(run_id = %id, "retrying teardown of deleting run");
            current
        } else {
            self.transition(id, RunState::Deleting, None, |_| {}).await?
        };
        let runnable = match run.framework() {
            Some(framework) => self.dispatcher.find(framework, id).await?,
            None => None,
        };
        match runnable {
            Some(runnable) => {
                self.dispatcher.destroy(&runnable).await?;
                Ok(run)
            }
            None => self.transition(id, RunState::Deleted, None, |_| {}).await,
        }
    }

    /// Apply a runnable change to its run. Unreachable targets are logged and
    /// dropped. Returns the run as stored afterwards, if it still exists.
    #[instrument(skip_all, fields(run_id = %event.run_id(), state = %event.state()))]
    pub async fn on_runnable_changed(&self, event: RunnableChangedEvent) -> Result<Option<Run>> {
        let id = event.run_id().to_string();
        let target = event.state();
        let runnable = event.runnable;

        let guard = self.locks.lock(&id).await;
        let Some(mut run) = self.repository.find(&id).await? else {
            debug!("run no longer exists, ignoring runnable change");
            drop(guard);
            self.locks.forget(&id);
            return Ok(None);
        };
        let previous = run.state;

        let mut machine = self.machines.build(previous, RunContext::new(&id));
        if let Err(refused) = machine.go_to_state(target, runnable.as_ref()) {
            if previous != target {
                warn!(current = %previous, available = ?refused.available, "transition not allowed, dropping change");
                return Ok(Some(run));
            }
        }
        run.state = machine.current_state();
        if let Some(message) = machine.context().error_message() {
            run.status
                .insert("message".to_string(), Value::String(message.to_string()));
        }
        if let Some(runnable) = &runnable {
            record_status(&mut run, runnable);
        }
        run.touch();

        if run.state == RunState::Deleted {
            self.repository.remove(&id).await?;
        } else {
            self.repository.save(&run).await?;
        }
        drop(guard);
        if run.state == RunState::Deleted {
            self.locks.forget(&id);
        }

        if run.state != previous {
            info!(from = %previous, to = %run.state, "run state changed");
        }
        if run.state == RunState::Completed && previous != RunState::Completed {
            if let Some(runnable) = &runnable {
                self.complete(&run, runnable).await;
            }
        }
        let _ = self.changes.send(RunChangedEvent {
            run: run.clone(),
            previous,
        });
        Ok(Some(run))
    }

    async fn complete(&self, run: &Run, runnable: &Runnable) {
        let outcome = match self.runtimes.for_run(run) {
            Ok(runtime) => runtime.on_complete(run, runnable).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            error!(run_id = %run.id, error = %e, "completion hook failed");
        }
    }

    async fn stored_runnable(&self, id: &str) -> Result<Runnable> {
        let run = self.get(id).await?;
        let framework = run.framework().ok_or_else(|| {
            Error::InvalidArgument(format!("run {id} was never submitted to a framework"))
        })?;
        self.dispatcher
            .find(framework, id)
            .await?
            .ok_or_else(|| Error::NotFound("runnable", id.to_string()))
    }

    /// Move the stored run to `target` under its lock, then persist and
    /// announce it.
    async fn transition<F>(
        &self,
        id: &str,
        target: RunState,
        input: Option<&Runnable>,
        update: F,
    ) -> Result<Run>
    where
        F: FnOnce(&mut Run) + Send,
    {
        let guard = self.locks.lock(id).await;
        let mut run = self.get(id).await?;
        let previous = run.state;

        let mut machine = self.machines.build(previous, RunContext::new(id));
        machine.go_to_state(target, input)?;
        run.state = machine.current_state();
        if let Some(message) = machine.context().error_message() {
            run.status
                .insert("message".to_string(), Value::String(message.to_string()));
        }
        update(&mut run);
        run.touch();

        if run.state == RunState::Deleted {
            self.repository.remove(id).await?;
        } else {
            self.repository.save(&run).await?;
        }
        drop(guard);
        if run.state == RunState::Deleted {
            self.locks.forget(id);
        }

        debug!(run_id = %id, from = %previous, to = %run.state, "run transitioned");
        let _ = self.changes.send(RunChangedEvent {
            run: run.clone(),
            previous,
        });
        Ok(run)
    }

    /// Record `err` on the run by moving it to `ERROR`, returning `err`.
    async fn fail(&self, id: &str, err: Error) -> Error {
        let input = Runnable {
            id: id.to_string(),
            error: Some(err.to_string()),
            ..Runnable::default()
        };
        if let Err(e) = self.transition(id, RunState::Error, Some(&input), |_| {}).await {
            warn!(run_id = %id, error = %e, "could not move run to error");
        }
        err
    }
}

fn record_status(run: &mut Run, runnable: &Runnable) {
    let status = &mut run.status;
    status.insert("framework".to_string(), json!(runnable.framework()));
    if let Some(message) = &runnable.message {
        status.insert("message".to_string(), json!(message));
    }
    match &runnable.error {
        Some(error) => {
            status.insert("error".to_string(), json!(error));
        }
        None => {
            status.remove("error");
        }
    }
    if !runnable.results.is_empty() {
        status.insert("results".to_string(), json!(runnable.results));
    }
}

#[async_trait]
impl EventHandler<RunnableChangedEvent> for RunManager {
    async fn handle(&self, event: RunnableChangedEvent) {
        let run_id = event.run_id().to_string();
        if let Err(e) = self.on_runnable_changed(event).await {
            error!(run_id = %run_id, error = %e, "failed to apply runnable change");
        }
    }
}
