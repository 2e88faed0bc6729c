use crate::config::{validate_interval_ms, ConfigError};
use crate::stats::{self, Snapshot};
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How the telemetry utility is launched. `--interval <ms>` is always
/// appended after `args`.
#[derive(Debug, Clone)]
pub struct TelemetryCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TelemetryCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn build(&self, interval_ms: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--interval")
            .arg(interval_ms.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error(transparent)]
    InvalidInterval(#[from] ConfigError),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' started without a stdout pipe")]
    MissingStdout { program: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub running: bool,
    pub starts: u64,
    pub lines_published: u64,
    pub parse_anomalies: u64,
    pub stream_errors: u64,
    #[serde(skip)]
    pub published_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct Published {
    snapshot: Snapshot,
    at: SystemTime,
}

#[derive(Default)]
struct Shared {
    latest: RwLock<Option<Published>>,
    running: AtomicBool,
    starts: AtomicU64,
    lines_published: AtomicU64,
    parse_anomalies: AtomicU64,
    stream_errors: AtomicU64,
    changed: Notify,
}

impl Shared {
    fn publish(&self, snapshot: Snapshot) {
        let published = Published {
            snapshot,
            at: SystemTime::now(),
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(published);
        self.lines_published.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_waiters();
    }

    fn clear(&self) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn latest(&self) -> Option<Published> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ingest(&self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(err) => {
                self.parse_anomalies.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "skipping non UTF-8 tegrastats line");
                return;
            }
        };
        if line.trim().is_empty() {
            return;
        }

        let snapshot = stats::parse(line);
        if snapshot.is_empty() {
            self.parse_anomalies.fetch_add(1, Ordering::Relaxed);
            warn!(line, "no known fields in tegrastats line, skipping");
            return;
        }
        self.publish(snapshot);
    }

    fn set_stopped(&self) {
        self.running.store(false, Ordering::Release);
        self.changed.notify_waiters();
    }
}

struct Run {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Run {
    async fn finish(self) {
        // Fails only when the loop already ended on EOF and dropped its receiver.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "tegrastats read loop task failed");
        }
    }
}

/// Owns the telemetry subprocess and the latest parsed [`Snapshot`].
///
/// Lines are read as they arrive; nothing bounds how long the utility may go
/// quiet. A subprocess that stops writing without exiting leaves the read loop
/// parked on its pipe until [`Poller::stop`] kills it.
pub struct Poller {
    command: TelemetryCommand,
    shared: Arc<Shared>,
    run: Mutex<Option<Run>>,
}

impl Poller {
    pub fn new(command: TelemetryCommand) -> Self {
        Self {
            command,
            shared: Arc::new(Shared::default()),
            run: Mutex::new(None),
        }
    }

    /// Stops any previous run, clears the cache and launches the utility.
    pub async fn start(&self, interval_ms: u32) -> Result<(), PollerError> {
        validate_interval_ms(interval_ms)?;

        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            previous.finish().await;
        }
        self.shared.clear();

        let mut child = self
            .command
            .build(interval_ms)
            .spawn()
            .map_err(|source| PollerError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;
        let Some(stdout) = child.stdout.take() else {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill tegrastats without stdout");
            }
            return Err(PollerError::MissingStdout {
                program: self.command.program.clone(),
            });
        };

        info!(
            program = %self.command.program,
            pid = child.id().unwrap_or(0),
            interval_ms,
            "tegrastats started"
        );
        self.shared.starts.fetch_add(1, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(
            child,
            stdout,
            self.shared.clone(),
            shutdown_rx,
        ));
        *run = Some(Run {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Cancels the read loop and waits until the subprocess has been reaped.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if let Some(current) = run.take() {
            current.finish().await;
            info!(program = %self.command.program, "tegrastats stopped");
        }
    }

    /// Latest published snapshot, or `None` if nothing was parsed since the
    /// last [`Poller::start`].
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.shared.latest().map(|p| p.snapshot)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PollerStatus {
        PollerStatus {
            running: self.is_running(),
            starts: self.shared.starts.load(Ordering::Relaxed),
            lines_published: self.shared.lines_published.load(Ordering::Relaxed),
            parse_anomalies: self.shared.parse_anomalies.load(Ordering::Relaxed),
            stream_errors: self.shared.stream_errors.load(Ordering::Relaxed),
            published_at: self.shared.latest().map(|p| p.at),
        }
    }

    /// Waits until a snapshot is available or the read loop has ended.
    pub async fn wait_for_snapshot(&self) -> Option<Snapshot> {
        loop {
            let changed = self.shared.changed.notified();
            if let Some(snapshot) = self.snapshot() {
                return Some(snapshot);
            }
            if !self.is_running() {
                return None;
            }
            changed.await;
        }
    }
}

async fn read_loop(
    mut child: Child,
    stdout: ChildStdout,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pid = child.id().unwrap_or(0);
    let mut lines = BufReader::new(stdout).split(b'\n');
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(pid, "tegrastats read loop cancelled");
                cancelled = true;
                break;
            }
            next = lines.next_segment() => match next {
                Ok(Some(raw)) => shared.ingest(&raw),
                Ok(None) => {
                    info!(pid, "tegrastats closed its output");
                    break;
                }
                Err(err) => {
                    shared.stream_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pid, error = %err, "failed reading tegrastats output");
                    break;
                }
            }
        }
    }
    drop(lines);

    match reap(&mut child, &mut shutdown, cancelled).await {
        Ok(status) => info!(pid, %status, "tegrastats exited"),
        Err(err) => warn!(pid, error = %err, "failed waiting for tegrastats"),
    }
    shared.set_stopped();
}

async fn reap(
    child: &mut Child,
    shutdown: &mut watch::Receiver<bool>,
    cancelled: bool,
) -> std::io::Result<ExitStatus> {
    if !cancelled {
        // The stream ended on its own; the process may still be exiting.
        tokio::select! {
            status = child.wait() => return status,
            _ = shutdown.changed() => {}
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "tegrastats already gone before kill");
    }
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Engine, Rail, Sensor};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn script(body: &str) -> TelemetryCommand {
        // `sh -c body tegrastats --interval N` exposes the interval as $2.
        TelemetryCommand::new("sh", ["-c", body, "tegrastats"])
    }

    async fn wait_published(poller: &Poller) -> Snapshot {
        tokio::time::timeout(WAIT, poller.wait_for_snapshot())
            .await
            .expect("snapshot within timeout")
            .expect("snapshot published")
    }

    async fn wait_stopped(poller: &Poller) {
        tokio::time::timeout(WAIT, async {
            while poller.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("read loop ends");
    }

    #[tokio::test]
    async fn nothing_published_before_first_line() {
        let poller = Poller::new(script("exec sleep 30"));
        assert!(poller.snapshot().is_none());

        poller.start(1000).await.expect("start");
        assert!(poller.is_running());
        assert!(poller.snapshot().is_none());

        tokio::time::timeout(WAIT, poller.stop())
            .await
            .expect("stop kills the subprocess");
        assert!(!poller.is_running());
        assert!(poller.snapshot().is_none());
    }

    #[tokio::test]
    async fn publishes_and_keeps_snapshot_after_stop() {
        let poller = Poller::new(script(
            "echo 'EMC_FREQ 12%@1600 thermal@38.5C VDD_IN 100/200'; exec sleep 30",
        ));
        poller.start(1000).await.expect("start");

        let snapshot = wait_published(&poller).await;
        let emc = snapshot.usage(Engine::Emc).expect("EMC present");
        assert_eq!(emc.load, "12");
        assert_eq!(emc.frequency.as_deref(), Some("1600"));
        assert_eq!(snapshot.scalar(Sensor::Thermal), Some("38.5"));

        poller.stop().await;
        let kept = poller.snapshot().expect("cache survives stop");
        assert_eq!(kept, snapshot);
        assert_eq!(
            kept.power(Rail::VddIn).map(|p| p.average.as_str()),
            Some("200")
        );
    }

    #[tokio::test]
    async fn interval_is_passed_to_the_utility() {
        let poller = Poller::new(script("echo \"APE $2\"; exec sleep 30"));
        poller.start(250).await.expect("start");

        let snapshot = wait_published(&poller).await;
        assert_eq!(snapshot.scalar(Sensor::Ape), Some("250"));
        poller.stop().await;
    }

    #[tokio::test]
    async fn end_of_stream_ends_loop_and_keeps_last_value() {
        let poller = Poller::new(script("echo 'GPU@40C'; echo 'GPU@41C'"));
        poller.start(1000).await.expect("start");

        wait_stopped(&poller).await;
        let snapshot = poller.snapshot().expect("last value kept");
        assert_eq!(snapshot.scalar(Sensor::Gpu), Some("41"));

        let status = poller.status();
        assert!(!status.running);
        assert_eq!(status.lines_published, 2);
        assert!(status.published_at.is_some());

        poller.stop().await;
        assert!(poller.snapshot().is_some());
    }

    #[tokio::test]
    async fn unusable_lines_are_skipped() {
        let poller = Poller::new(script(
            "echo 'RAM 1873/3830MB'; printf '\\377\\376\\n'; echo; echo 'Tdiode@37C'",
        ));
        poller.start(1000).await.expect("start");
        wait_stopped(&poller).await;

        let snapshot = poller.snapshot().expect("valid line published");
        assert_eq!(snapshot.scalar(Sensor::Tdiode), Some("37"));
        let status = poller.status();
        assert_eq!(status.parse_anomalies, 2);
        assert_eq!(status.lines_published, 1);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let poller = Poller::new(TelemetryCommand::new(
            "/nonexistent/tegrastats",
            Vec::<String>::new(),
        ));
        let err = poller.start(1000).await.unwrap_err();
        assert!(matches!(err, PollerError::Spawn { .. }));
        assert!(!poller.is_running());
        assert!(poller.snapshot().is_none());

        poller.stop().await;
    }

    #[tokio::test]
    async fn invalid_interval_is_rejected_before_spawn() {
        let poller = Poller::new(script("exec sleep 30"));
        for bad in [0, 300_001] {
            let err = poller.start(bad).await.unwrap_err();
            assert!(matches!(err, PollerError::InvalidInterval(_)));
        }
        assert_eq!(poller.status().starts, 0);
    }

    #[tokio::test]
    async fn restart_begins_with_empty_cache() {
        let poller = Poller::new(script(
            "if [ \"$2\" = 1 ]; then echo 'BCPU@39C'; fi; exec sleep 30",
        ));
        poller.start(1).await.expect("first start");
        wait_published(&poller).await;

        poller.start(2).await.expect("second start");
        assert!(poller.is_running());
        assert!(poller.snapshot().is_none());
        assert_eq!(poller.status().starts, 2);

        poller.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let poller = Poller::new(script("exec sleep 30"));
        poller.stop().await;

        poller.start(1000).await.expect("start");
        poller.stop().await;
        poller.stop().await;
        assert!(!poller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_mixed_publications() {
        let poller = Arc::new(Poller::new(script(
            "i=0; while [ $i -lt 3000 ]; do \
             echo 'EMC_FREQ 1%@1 PLL@1C VDD_IN 1/1'; \
             echo 'EMC_FREQ 2%@2 PLL@2C VDD_IN 2/2'; \
             i=$((i+1)); done",
        )));
        poller.start(1).await.expect("start");

        let mut readers = Vec::new();
        for _ in 0..4 {
            let poller = poller.clone();
            readers.push(tokio::spawn(async move {
                let mut seen = 0_u64;
                while poller.is_running() {
                    if let Some(s) = poller.snapshot() {
                        let emc = s.usage(Engine::Emc).expect("EMC present");
                        let rail = s.power(Rail::VddIn).expect("VDD_IN present");
                        assert_eq!(Some(emc.load.as_str()), emc.frequency.as_deref());
                        assert_eq!(s.scalar(Sensor::Pll), Some(emc.load.as_str()));
                        assert_eq!(rail.current, emc.load);
                        assert_eq!(rail.average, emc.load);
                        seen += 1;
                    }
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        for reader in readers {
            tokio::time::timeout(WAIT, reader)
                .await
                .expect("reader finishes")
                .expect("reader assertions hold");
        }
        assert_eq!(poller.status().lines_published, 6000);
        poller.stop().await;
    }
}
