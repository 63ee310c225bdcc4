//! Kernel process supervision.
//!
//! The supervisor owns every [`KernelProcess`]. Each spawned child gets a
//! monitor task that awaits its exit, so exit detection never blocks the
//! caller. Crashed kernels are logged and left stopped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::command::KernelCommand;
use crate::infrastructure::audit::{self, AuditEvent};

/// Lifecycle state of a kernel process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KernelStatus {
    /// Recorded, spawn in progress.
    Starting,
    /// The process was spawned and has not exited.
    Running,
    /// The process ended, on request or on its own.
    Exited {
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
    },
    /// The process could not be launched.
    Failed {
        /// Launch error.
        reason: String,
    },
}

impl KernelStatus {
    /// Returns true while the process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Errors raised when launching a kernel.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to start the process.
    #[error("failed to launch kernel for '{analysis}': {source}")]
    Launch {
        /// Analysis the kernel serves.
        analysis: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A live kernel is already tracked for this analysis.
    #[error("kernel for '{0}' is already running")]
    AlreadyRunning(String),
}

/// A running child process as seen by the supervisor.
#[async_trait]
pub trait KernelChild: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Waits for the process to exit and returns its exit code.
    ///
    /// Must be cancel safe.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Requests forced termination without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal could not be delivered.
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// Launches kernel processes.
pub trait Spawner: Send + Sync {
    /// Starts `command` and returns a handle to the child.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the process cannot be started.
    fn spawn(&self, command: &KernelCommand) -> std::io::Result<Box<dyn KernelChild>>;
}

/// Spawns real OS processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

struct TokioChild(tokio::process::Child);

#[async_trait]
impl KernelChild for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.0.wait().await.map(|status| status.code())
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.0.start_kill()
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, command: &KernelCommand) -> std::io::Result<Box<dyn KernelChild>> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        Ok(Box::new(TokioChild(cmd.spawn()?)))
    }
}

/// Bookkeeping for one analysis kernel.
#[derive(Debug)]
pub struct KernelProcess {
    /// Analysis the kernel serves.
    pub analysis: String,
    /// Command line it was started with.
    pub command: KernelCommand,
    /// Bus address handed to the kernel.
    pub address: SocketAddr,
    /// OS process id.
    pub pid: Option<u32>,
    /// When the supervisor recorded the process.
    pub started_at: DateTime<Utc>,
    status: watch::Receiver<KernelStatus>,
    stop: Option<oneshot::Sender<Duration>>,
    monitor: Option<JoinHandle<()>>,
    /// Status sender of a kernel that never launched, so there is no
    /// monitor to settle it.
    unlaunched: Option<watch::Sender<KernelStatus>>,
}

impl KernelProcess {
    /// Current status.
    #[must_use]
    pub fn status(&self) -> KernelStatus {
        self.status.borrow().clone()
    }
}

/// Read-only view of kernel statuses, shareable with request handlers.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    statuses: HashMap<String, watch::Receiver<KernelStatus>>,
}

impl StatusBoard {
    /// Current status of `analysis`'s kernel, if it has one.
    #[must_use]
    pub fn get(&self, analysis: &str) -> Option<KernelStatus> {
        self.statuses.get(analysis).map(|rx| rx.borrow().clone())
    }

    /// Every known status, keyed by analysis.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, KernelStatus> {
        self.statuses
            .iter()
            .map(|(name, rx)| (name.clone(), rx.borrow().clone()))
            .collect()
    }
}

/// Starts, tracks and stops kernel processes.
pub struct KernelSupervisor {
    spawner: Arc<dyn Spawner>,
    processes: HashMap<String, KernelProcess>,
    grace_period: Duration,
}

impl KernelSupervisor {
    /// Creates a supervisor launching through `spawner`.
    #[must_use]
    pub fn new(spawner: Arc<dyn Spawner>, grace_period: Duration) -> Self {
        Self {
            spawner,
            processes: HashMap::new(),
            grace_period,
        }
    }

    /// Creates a supervisor spawning real processes.
    #[must_use]
    pub fn with_tokio(grace_period: Duration) -> Self {
        Self::new(Arc::new(TokioSpawner), grace_period)
    }

    /// Spawns the kernel for `analysis`.
    ///
    /// On failure the kernel is recorded as `Failed` and the error returned;
    /// other kernels are unaffected.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError::AlreadyRunning` if a live kernel is tracked for
    /// `analysis`, or `SpawnError::Launch` if the process cannot be started.
    pub fn start(
        &mut self,
        analysis: &str,
        command: KernelCommand,
        address: SocketAddr,
    ) -> Result<(), SpawnError> {
        if self
            .processes
            .get(analysis)
            .is_some_and(|p| matches!(p.status(), KernelStatus::Starting | KernelStatus::Running))
        {
            return Err(SpawnError::AlreadyRunning(analysis.to_string()));
        }

        let (status_tx, status_rx) = watch::channel(KernelStatus::Starting);
        let mut process = KernelProcess {
            analysis: analysis.to_string(),
            command,
            address,
            pid: None,
            started_at: Utc::now(),
            status: status_rx,
            stop: None,
            monitor: None,
            unlaunched: None,
        };

        match self.spawner.spawn(&process.command) {
            Ok(child) => {
                process.pid = child.id();
                status_tx.send_replace(KernelStatus::Running);
                let (stop_tx, stop_rx) = oneshot::channel();
                process.stop = Some(stop_tx);
                process.monitor = Some(tokio::spawn(monitor(
                    analysis.to_string(),
                    child,
                    status_tx,
                    stop_rx,
                )));
                info!(analysis, pid = ?process.pid, command = %process.command, "kernel started");
                audit::log_audit(&AuditEvent::KernelSpawned {
                    analysis: analysis.to_string(),
                    command: process.command.to_string(),
                    pid: process.pid,
                });
                self.processes.insert(analysis.to_string(), process);
                Ok(())
            }
            Err(source) => {
                error!(analysis, error = %source, "kernel failed to launch");
                status_tx.send_replace(KernelStatus::Failed {
                    reason: source.to_string(),
                });
                process.unlaunched = Some(status_tx);
                self.processes.insert(analysis.to_string(), process);
                Err(SpawnError::Launch {
                    analysis: analysis.to_string(),
                    source,
                })
            }
        }
    }

    /// Status of `analysis`'s kernel, if one was started.
    #[must_use]
    pub fn status(&self, analysis: &str) -> Option<KernelStatus> {
        self.processes.get(analysis).map(KernelProcess::status)
    }

    /// Tracked process for `analysis`.
    #[must_use]
    pub fn process(&self, analysis: &str) -> Option<&KernelProcess> {
        self.processes.get(analysis)
    }

    /// Snapshot of status receivers for concurrent readers.
    #[must_use]
    pub fn status_board(&self) -> StatusBoard {
        StatusBoard {
            statuses: self
                .processes
                .iter()
                .map(|(name, p)| (name.clone(), p.status.clone()))
                .collect(),
        }
    }

    /// Stops every tracked kernel.
    ///
    /// Each kernel gets the grace period to exit on its own, then it is
    /// killed. Kernels that failed to launch move from `Failed` to
    /// `Exited` too. Calling this again is a no-op.
    pub async fn stop_all(&mut self) {
        let grace = self.grace_period;
        let monitors: Vec<_> = self
            .processes
            .values_mut()
            .filter_map(|process| {
                if let Some(status) = process.unlaunched.take() {
                    status.send_replace(KernelStatus::Exited { code: None });
                }
                if let Some(stop) = process.stop.take() {
                    let _ = stop.send(grace);
                }
                process.monitor.take()
            })
            .collect();

        if monitors.is_empty() {
            return;
        }
        info!(count = monitors.len(), "stopping kernels");
        for result in join_all(monitors).await {
            if let Err(e) = result {
                warn!(error = %e, "kernel monitor task failed");
            }
        }
    }
}

async fn monitor(
    analysis: String,
    mut child: Box<dyn KernelChild>,
    status: watch::Sender<KernelStatus>,
    mut stop: oneshot::Receiver<Duration>,
) {
    let (result, requested) = tokio::select! {
        result = child.wait() => (result, false),
        request = &mut stop => {
            let grace = request.unwrap_or_default();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(result) => (result, true),
                Err(_) => {
                    warn!(analysis = %analysis, "kernel did not exit within grace period, killing");
                    if let Err(e) = child.start_kill() {
                        warn!(analysis = %analysis, error = %e, "kill failed");
                    }
                    (child.wait().await, true)
                }
            }
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            warn!(analysis = %analysis, error = %e, "failed to collect kernel exit status");
            None
        }
    };
    if requested {
        info!(analysis = %analysis, ?code, "kernel stopped");
    } else {
        warn!(analysis = %analysis, ?code, "kernel exited unexpectedly, analysis unavailable");
    }
    audit::log_audit(&AuditEvent::KernelExited {
        analysis: analysis.clone(),
        code,
        requested,
    });
    status.send_replace(KernelStatus::Exited { code });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Child that exits when killed or when its spawner's `exit` is notified.
    struct MockChild {
        exit: Arc<Notify>,
        killed: bool,
    }

    #[async_trait]
    impl KernelChild for MockChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            if self.killed {
                return Ok(None);
            }
            self.exit.notified().await;
            Ok(Some(0))
        }

        fn start_kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSpawner {
        launched: Mutex<Vec<KernelCommand>>,
        exit: Arc<Notify>,
        fail: bool,
    }

    impl Spawner for MockSpawner {
        fn spawn(&self, command: &KernelCommand) -> std::io::Result<Box<dyn KernelChild>> {
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such binary",
                ));
            }
            self.launched.lock().push(command.clone());
            Ok(Box::new(MockChild {
                exit: Arc::clone(&self.exit),
                killed: false,
            }))
        }
    }

    fn command() -> KernelCommand {
        KernelCommand {
            program: "python".into(),
            args: vec!["analysis.py".into(), "--subscribe-address=127.0.0.1:4000".into()],
            cwd: None,
        }
    }

    fn address() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    async fn wait_for_status(supervisor: &KernelSupervisor, name: &str, expected: &KernelStatus) {
        for _ in 0..100 {
            if supervisor.status(name).as_ref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status of {name} never became {expected:?}");
    }

    #[tokio::test]
    async fn start_records_running() {
        let spawner = Arc::new(MockSpawner::default());
        let mut supervisor = KernelSupervisor::new(spawner.clone(), Duration::from_millis(50));

        supervisor.start("demo2", command(), address()).unwrap();

        assert_eq!(supervisor.status("demo2"), Some(KernelStatus::Running));
        assert_eq!(supervisor.process("demo2").unwrap().pid, Some(4242));
        assert_eq!(spawner.launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let spawner = Arc::new(MockSpawner {
            fail: true,
            ..MockSpawner::default()
        });
        let mut supervisor = KernelSupervisor::new(spawner, Duration::from_millis(50));

        let result = supervisor.start("broken", command(), address());
        assert!(matches!(result, Err(SpawnError::Launch { .. })));
        assert!(matches!(
            supervisor.status("broken"),
            Some(KernelStatus::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn stop_all_settles_kernels_that_never_launched() {
        let spawner = Arc::new(MockSpawner {
            fail: true,
            ..MockSpawner::default()
        });
        let mut supervisor = KernelSupervisor::new(spawner, Duration::from_millis(20));
        assert!(supervisor.start("broken", command(), address()).is_err());

        supervisor.stop_all().await;
        supervisor.stop_all().await;
        assert_eq!(supervisor.status("broken"), Some(KernelStatus::Exited { code: None }));
        assert_eq!(
            supervisor.status_board().get("broken"),
            Some(KernelStatus::Exited { code: None })
        );
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let mut supervisor =
            KernelSupervisor::new(Arc::new(MockSpawner::default()), Duration::from_millis(50));
        supervisor.start("demo", command(), address()).unwrap();
        assert!(matches!(
            supervisor.start("demo", command(), address()),
            Err(SpawnError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn stop_all_kills_unresponsive_kernels_and_is_idempotent() {
        let mut supervisor =
            KernelSupervisor::new(Arc::new(MockSpawner::default()), Duration::from_millis(20));
        supervisor.start("a", command(), address()).unwrap();
        supervisor.start("b", command(), address()).unwrap();

        supervisor.stop_all().await;
        supervisor.stop_all().await;

        assert_eq!(supervisor.status("a"), Some(KernelStatus::Exited { code: None }));
        assert_eq!(supervisor.status("b"), Some(KernelStatus::Exited { code: None }));
    }

    #[tokio::test]
    async fn unexpected_exit_is_detected() {
        let spawner = Arc::new(MockSpawner::default());
        let mut supervisor = KernelSupervisor::new(spawner.clone(), Duration::from_millis(50));
        supervisor.start("demo", command(), address()).unwrap();
        let board = supervisor.status_board();

        spawner.exit.notify_one();
        wait_for_status(&supervisor, "demo", &KernelStatus::Exited { code: Some(0) }).await;
        assert_eq!(board.get("demo"), Some(KernelStatus::Exited { code: Some(0) }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_runs_and_stops() {
        let mut supervisor = KernelSupervisor::with_tokio(Duration::from_millis(100));
        let sleep = KernelCommand {
            program: "sleep".into(),
            args: vec!["30".into()],
            cwd: None,
        };
        supervisor.start("sleeper", sleep, address()).unwrap();
        assert_eq!(supervisor.status("sleeper"), Some(KernelStatus::Running));

        supervisor.stop_all().await;
        assert!(matches!(
            supervisor.status("sleeper"),
            Some(KernelStatus::Exited { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let mut supervisor = KernelSupervisor::with_tokio(Duration::from_millis(100));
        let missing = KernelCommand {
            program: "/nonexistent/dashbench-kernel".into(),
            args: vec![],
            cwd: None,
        };
        assert!(supervisor.start("ghost", missing, address()).is_err());
        supervisor.stop_all().await;
    }
}
