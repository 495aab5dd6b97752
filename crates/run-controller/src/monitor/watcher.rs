//! Push triggers for monitor refreshes.
//!
//! One watch stream per resource kind, filtered to the objects of one
//! framework. Every applied object carrying a run label triggers a refresh of
//! that run. Stream failures are logged and retried with exponential backoff;
//! polling keeps running regardless.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RunnableMonitor;
use crate::config::WatcherConfig;

/// Exponential backoff between failed watch attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_millis),
            Duration::from_secs(config.backoff_max_seconds),
        )
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Run id carried by an object's labels.
pub fn run_id_of<K: Resource>(object: &K, run_label: &str) -> Option<String> {
    object
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(run_label))
        .filter(|id| !id.is_empty())
        .cloned()
}

/// Watch objects matching `selector` and refresh their runs through
/// `monitor` until cancelled.
pub fn spawn_watcher<K>(
    api: Api<K>,
    selector: String,
    run_label: String,
    monitor: Arc<dyn RunnableMonitor>,
    config: &WatcherConfig,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let mut backoff = Backoff::from_config(config);
    tokio::spawn(async move {
        let framework = monitor.framework();
        info!(framework, selector = %selector, "watcher started");

        let mut stream = Box::pin(
            watcher(api, watcher::Config::default().labels(&selector)).applied_objects(),
        );
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = stream.try_next() => next,
            };
            match next {
                Ok(Some(object)) => {
                    backoff.reset();
                    let Some(run_id) = run_id_of(&object, &run_label) else {
                        continue;
                    };
                    match monitor.refresh_id(&run_id).await {
                        Ok(Some(runnable)) => {
                            debug!(framework, run_id = %run_id, state = %runnable.state, "watch triggered refresh");
                        }
                        Ok(None) => debug!(framework, run_id = %run_id, "no stored runnable for watched object"),
                        Err(e) => warn!(framework, run_id = %run_id, error = %e, "watch triggered refresh failed"),
                    }
                }
                Ok(None) => {
                    warn!(framework, "watch stream ended");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(framework, error = %e, retry_in_ms = delay.as_millis() as u64, "watch stream failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(framework, "watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::batch::v1::Job;
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(2));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 2000, 2000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn run_id_comes_from_the_run_label() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("j-containerjob-r1".into()),
                labels: Some(BTreeMap::from([(
                    "runs.5dlabs.ai/run".to_string(),
                    "r1".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Job::default()
        };
        assert_eq!(run_id_of(&job, "runs.5dlabs.ai/run").as_deref(), Some("r1"));
        assert_eq!(run_id_of(&Job::default(), "runs.5dlabs.ai/run"), None);
    }

    #[test]
    fn backoff_reads_config() {
        let mut backoff = Backoff::from_config(&WatcherConfig::default());
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
