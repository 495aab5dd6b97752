//! Domain objects: runs, the functions and tasks they execute, and runnables.

mod credentials;
mod events;
mod runnable;

pub use credentials::Credentials;
pub use events::{RunChangedEvent, RunnableChangedEvent, RunnableMonitorObject};
pub use runnable::{
    ContainerTemplate, ContextRef, ContextSource, CoreEnv, CoreResource, CoreVolume,
    CronJobWorkload, CustomResourceWorkload, DeploymentWorkload, BuildWorkload, JobWorkload,
    PodLog, PodMetric, ResourceQuantity, Runnable, ServePort, ServeWorkload, ServiceType,
    VolumeType, Workload,
};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lifecycle::RunState;

/// Opaque key-value document carried by functions, tasks and runs.
pub type SpecMap = Map<String, Value>;

/// A persisted request to execute a task against a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub project: String,
    /// Selects the runtime, e.g. `container+run`.
    pub kind: String,
    /// Task reference, e.g. `container+job://project/function:version`.
    pub task: String,
    #[serde(default)]
    pub spec: SpecMap,
    #[serde(default)]
    pub status: SpecMap,
    #[serde(default)]
    pub state: RunState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl Run {
    pub fn new(
        project: impl Into<String>,
        kind: impl Into<String>,
        task: impl Into<String>,
        spec: SpecMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            project: project.into(),
            kind: kind.into(),
            task: task.into(),
            spec,
            status: SpecMap::new(),
            state: RunState::Created,
            created: now,
            updated: now,
            owner: None,
        }
    }

    pub fn task_ref(&self) -> Result<TaskRef, crate::Error> {
        self.task.parse()
    }

    /// Framework that realizes this run, once a runnable was produced.
    pub fn framework(&self) -> Option<&str> {
        self.status.get("framework").and_then(Value::as_str)
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

/// The logical unit of code or image being executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: String,
    pub project: String,
    pub name: String,
    /// Runtime name, e.g. `container`.
    pub kind: String,
    #[serde(default)]
    pub spec: SpecMap,
}

/// A named execution mode of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project: String,
    /// Full task kind, e.g. `container+job`.
    pub kind: String,
    #[serde(default)]
    pub spec: SpecMap,
}

/// Parsed task reference: `<runtime>+<task>://<project>/<function>[:<version>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub runtime: String,
    pub task: String,
    pub project: String,
    pub function: String,
    pub version: Option<String>,
}

impl TaskRef {
    /// Full task kind, e.g. `container+job`.
    pub fn kind(&self) -> String {
        format!("{}+{}", self.runtime, self.task)
    }
}

impl FromStr for TaskRef {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::InvalidArgument(format!("invalid task reference: {s}"));

        let (kind, path) = s.split_once("://").ok_or_else(invalid)?;
        let (runtime, task) = kind.split_once('+').ok_or_else(invalid)?;
        let (project, function) = path.split_once('/').ok_or_else(invalid)?;
        let (function, version) = match function.split_once(':') {
            Some((name, version)) => (name, Some(version.to_string())),
            None => (function, None),
        };

        if [runtime, task, project, function].iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }

        Ok(Self {
            runtime: runtime.to_string(),
            task: task.to_string(),
            project: project.to_string(),
            function: function.to_string(),
            version,
        })
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}://{}/{}",
            self.runtime, self.task, self.project, self.function
        )?;
        if let Some(version) = &self.version {
            write!(f, ":{version}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_reference() {
        let task: TaskRef = "container+job://demo/hello:abc123".parse().unwrap();
        assert_eq!(task.runtime, "container");
        assert_eq!(task.task, "job");
        assert_eq!(task.kind(), "container+job");
        assert_eq!(task.project, "demo");
        assert_eq!(task.function, "hello");
        assert_eq!(task.version.as_deref(), Some("abc123"));
        assert_eq!(task.to_string(), "container+job://demo/hello:abc123");
    }

    #[test]
    fn task_reference_without_version() {
        let task: TaskRef = "container+serve://demo/api".parse().unwrap();
        assert_eq!(task.version, None);
        assert_eq!(task.to_string(), "container+serve://demo/api");
    }

    #[test]
    fn rejects_malformed_task_reference() {
        for bad in ["", "container://demo/x", "container+job:/demo/x", "container+job://demo"] {
            assert!(bad.parse::<TaskRef>().is_err(), "{bad}");
        }
    }

    #[test]
    fn new_run_starts_created() {
        let run = Run::new("demo", "container+run", "container+job://demo/hello", SpecMap::new());
        assert_eq!(run.state, RunState::Created);
        assert!(!run.id.is_empty());
        assert_eq!(run.framework(), None);
    }
}
