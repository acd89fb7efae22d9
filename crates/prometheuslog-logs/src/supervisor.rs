use std::num::NonZeroU32;
use std::path::PathBuf;

use futures::Stream;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use prometheuslog_types::ApplicationConfig;

use crate::error::MonitorError;
use crate::monitor::{ApplicationMonitor, METRICS_LOG_INTERVAL};
use crate::tail::{LogFollower, Whence};

/// A registered monitor and the watchers of the tasks driving it
struct Slot {
    monitor: ApplicationMonitor,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns every application monitor.
///
/// Monitors are appended in registration order and keep their index for the
/// lifetime of the supervisor. The lock guards the sequence only; each sink is
/// written by its own ingestion task.
pub struct Supervisor {
    applications: Mutex<Vec<Slot>>,

    /// Parent of every monitor's cancellation token
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self {
            applications: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Start following `log_path` and register the new monitor.
    ///
    /// Fails without registering anything if the path does not exist or is
    /// not a regular file. Must be called inside a tokio runtime.
    pub fn add_application(
        &self,
        id: usize,
        name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        max_rate: u32,
        debug_enabled: bool,
    ) -> Result<ApplicationMonitor, MonitorError> {
        let config = ApplicationConfig::new(id, name, log_path);
        let max_rate = NonZeroU32::new(max_rate).ok_or(MonitorError::InvalidRate)?;
        let follower = LogFollower::open(&config.log_path, Whence::End)?;
        info!(app = %config.name, path = %follower.path().display(), "attaching to log");
        Ok(self.add_with_source(config, follower.into_lines(), max_rate, debug_enabled))
    }

    /// Register a monitor fed by an arbitrary line source
    pub fn add_with_source<S>(
        &self,
        config: ApplicationConfig,
        lines: S,
        max_rate: NonZeroU32,
        debug_enabled: bool,
    ) -> ApplicationMonitor
    where
        S: Stream<Item = std::io::Result<String>> + Send + 'static,
    {
        let monitor =
            ApplicationMonitor::with_cancel(config, debug_enabled, self.cancel.child_token());

        let mut tasks = Vec::with_capacity(2);
        let ingest = monitor.clone();
        tasks.push(spawn_watched(&monitor, "ingest", async move {
            ingest.ingest(lines, max_rate).await;
        }));
        if debug_enabled {
            let dump = monitor.clone();
            tasks.push(spawn_watched(&monitor, "metrics-log", async move {
                dump.log_metrics(METRICS_LOG_INTERVAL).await;
            }));
        }

        self.applications.lock().push(Slot {
            monitor: monitor.clone(),
            tasks,
        });
        monitor
    }

    /// Monitor at `index`, in registration order
    pub fn get_application(&self, index: usize) -> Result<ApplicationMonitor, MonitorError> {
        let applications = self.applications.lock();
        applications
            .get(index)
            .map(|slot| slot.monitor.clone())
            .ok_or(MonitorError::IndexOutOfRange {
                index,
                len: applications.len(),
            })
    }

    /// Handles to every monitor, in registration order
    pub fn applications(&self) -> Vec<ApplicationMonitor> {
        self.applications
            .lock()
            .iter()
            .map(|slot| slot.monitor.clone())
            .collect()
    }

    /// Number of registered monitors
    pub fn len(&self) -> usize {
        self.applications.lock().len()
    }

    /// True when no monitor has been registered
    pub fn is_empty(&self) -> bool {
        self.applications.lock().is_empty()
    }

    /// Lines classified across all monitors
    pub fn total_lines_read(&self) -> u64 {
        self.applications
            .lock()
            .iter()
            .map(|slot| slot.monitor.lines_read())
            .sum()
    }

    /// Stop every monitor and wait for its tasks to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .applications
            .lock()
            .iter_mut()
            .flat_map(|slot| slot.tasks.drain(..))
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Spawn a monitor task and a watcher that reports if it panics.
///
/// A panicked task stops its monitor so [`ApplicationMonitor::is_stopped`]
/// reflects that nothing is ingesting anymore.
fn spawn_watched<F>(
    monitor: &ApplicationMonitor,
    task: &'static str,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(future);
    let monitor = monitor.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(app = monitor.name(), task, error = %e, "monitor task panicked");
                monitor.stop();
            }
        }
    })
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheuslog_types::{MetricKey, MetricValue};
    use std::io::Write;
    use std::time::Duration;

    async fn wait_for_lines(monitor: &ApplicationMonitor, expected: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while monitor.lines_read() < expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("lines processed in time");
    }

    #[tokio::test]
    async fn test_missing_log_path_is_not_registered() {
        let supervisor = Supervisor::new();
        let result = supervisor.add_application(0, "app", "/nonexistent/app.log", 100, false);
        assert!(matches!(result, Err(MonitorError::LogPathMissing(_))));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_zero_rate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let supervisor = Supervisor::new();
        let result = supervisor.add_application(0, "app", &path, 0, false);
        assert!(matches!(result, Err(MonitorError::InvalidRate)));
    }

    #[tokio::test]
    async fn test_get_application_by_index() {
        let supervisor = Supervisor::new();
        let config = |id, name: &str| ApplicationConfig::new(id, name, format!("/logs/{name}"));
        let rate = NonZeroU32::new(100).unwrap();
        supervisor.add_with_source(config(0, "first"), futures::stream::empty(), rate, false);
        supervisor.add_with_source(config(3, "second"), futures::stream::empty(), rate, false);

        assert_eq!(supervisor.len(), 2);
        assert_eq!(supervisor.get_application(0).unwrap().name(), "first");
        assert_eq!(supervisor.get_application(1).unwrap().id(), 3);
        assert!(matches!(
            supervisor.get_application(2),
            Err(MonitorError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[tokio::test]
    async fn test_tails_new_lines_into_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "ERROR before start is ignored\n").unwrap();

        let supervisor = Supervisor::new();
        let monitor = supervisor
            .add_application(0, "app1", &path, 1000, false)
            .unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(file, "2019-12-28 00:44:45,714 WARN slow").unwrap();
        writeln!(file, "scrapeExecuteFinished: completed=true,duration=769ms").unwrap();

        wait_for_lines(&monitor, 2).await;
        let sink = monitor.sink();
        assert_eq!(sink.get(MetricKey::ErrorMessages), None);
        assert_eq!(
            sink.get(MetricKey::WarnMessages),
            Some(MetricValue::Counter(1))
        );
        assert_eq!(
            sink.get(MetricKey::WebHarvestExitDuration),
            Some(MetricValue::Gauge(769.0))
        );
        assert_eq!(supervisor.total_lines_read(), 2);

        supervisor.shutdown().await;
        assert!(monitor.is_stopped());
    }

    #[tokio::test]
    async fn test_sinks_are_isolated() {
        let supervisor = Supervisor::new();
        let rate = NonZeroU32::new(1000).unwrap();
        let lines = |text: &str| futures::stream::iter(vec![Ok(text.to_string())]);

        let a = supervisor.add_with_source(
            ApplicationConfig::new(0, "a", "/logs/a"),
            lines("FATAL a"),
            rate,
            false,
        );
        let b = supervisor.add_with_source(
            ApplicationConfig::new(1, "b", "/logs/b"),
            lines("postPayloadStarted"),
            rate,
            false,
        );
        wait_for_lines(&a, 1).await;
        wait_for_lines(&b, 1).await;

        assert_eq!(a.sink().get(MetricKey::AlertCreated), None);
        assert_eq!(b.sink().get(MetricKey::FatalMessages), None);
        assert_eq!(
            b.sink().get(MetricKey::AlertCreated),
            Some(MetricValue::Counter(1))
        );
    }

    #[tokio::test]
    async fn test_panicking_source_stops_only_its_monitor() {
        let supervisor = Supervisor::new();
        let rate = NonZeroU32::new(1000).unwrap();
        let exploding = futures::stream::poll_fn(
            |_| -> std::task::Poll<Option<std::io::Result<String>>> { panic!("source failed") },
        );

        let broken = supervisor.add_with_source(
            ApplicationConfig::new(0, "broken", "/broken"),
            exploding,
            rate,
            false,
        );
        let healthy = supervisor.add_with_source(
            ApplicationConfig::new(1, "healthy", "/healthy"),
            futures::stream::pending::<std::io::Result<String>>(),
            rate,
            false,
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !broken.is_stopped() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("panicked monitor marked stopped");
        assert!(!healthy.is_stopped());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopping_one_monitor_leaves_others_running() {
        let supervisor = Supervisor::new();
        let rate = NonZeroU32::new(1000).unwrap();
        let pending = || futures::stream::pending::<std::io::Result<String>>();

        let a = supervisor.add_with_source(
            ApplicationConfig::new(0, "a", "/a"),
            pending(),
            rate,
            false,
        );
        let b = supervisor.add_with_source(
            ApplicationConfig::new(1, "b", "/b"),
            pending(),
            rate,
            false,
        );

        a.stop();
        assert!(a.is_stopped());
        assert!(!b.is_stopped());

        supervisor.shutdown().await;
        assert!(b.is_stopped());
    }
}
