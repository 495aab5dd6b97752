use serde::{Deserialize, Serialize};

use super::{Run, Runnable};
use crate::lifecycle::RunState;

/// Correlation data attached to every runnable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableMonitorObject {
    pub run_id: String,
    pub state_id: RunState,
    pub project: String,
    pub framework: String,
    pub task: String,
}

/// Published whenever a framework or monitor mutates a runnable.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnableChangedEvent {
    /// Latest snapshot; absent when the runnable was already gone.
    pub runnable: Option<Runnable>,
    pub monitor: RunnableMonitorObject,
}

impl RunnableChangedEvent {
    pub fn from_runnable(runnable: Runnable) -> Self {
        let monitor = RunnableMonitorObject {
            run_id: runnable.id.clone(),
            state_id: runnable.state,
            project: runnable.project.clone(),
            framework: runnable.framework().to_string(),
            task: runnable.task.clone(),
        };
        Self {
            runnable: Some(runnable),
            monitor,
        }
    }

    pub fn state(&self) -> RunState {
        self.monitor.state_id
    }

    pub fn run_id(&self) -> &str {
        &self.monitor.run_id
    }
}

/// Re-published to listeners after the run manager applied a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunChangedEvent {
    pub run: Run,
    pub previous: RunState,
}
