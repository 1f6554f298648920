//! External slicer supervision.
//!
//! The supervisor launches one slicer process, waits for it with a timeout,
//! and persists its output into the work directory. A separate monitor task
//! reports progress for operators; it only reads a liveness flag and never
//! influences the outcome of the wait.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
#[cfg(unix)]
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Diagnostic, Result, SliceQuoteError};
use crate::invocation::{SliceInvocation, SliceTargets};
use crate::probe;
use crate::settings::SlicerSettings;
use crate::workspace::{describe, WorkDir};

/// Combined stdout/stderr of a successful run.
pub const OUTPUT_LOG_FILE: &str = "bambu_cli_output.txt";
/// Output of a failed or timed-out run.
pub const ERROR_LOG_FILE: &str = "bambu_cli_error.txt";

const MONITOR_LISTING_LIMIT: usize = 5;

/// Supervision lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// Nothing has happened yet.
    #[default]
    NotStarted,
    /// Running display/rendering probes.
    Validating,
    /// Process spawned.
    Launched,
    /// Waiting on the process with the monitor running.
    Monitoring,
    /// Process exited with status zero.
    Completed,
    /// Process exited non-zero, or supervision itself failed.
    Failed,
    /// Process exceeded the timeout and was killed.
    TimedOut,
}

impl SupervisorState {
    /// Whether supervision has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// What the slicer did.
#[derive(Debug, Clone)]
pub struct SliceResult {
    /// Exit code; `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall time from launch to exit (or kill).
    pub elapsed: Duration,
    /// Requested output locations.
    pub targets: SliceTargets,
}

/// Terminal state of a supervised run plus its persisted log.
#[derive(Debug, Clone)]
pub struct SliceOutcome {
    /// `Completed`, `Failed` or `TimedOut`.
    pub state: SupervisorState,
    /// Captured result.
    pub result: SliceResult,
    /// Log file written into the work directory, if writing succeeded.
    pub log_file: Option<PathBuf>,
    /// Timeout that applied to the run.
    pub timeout: Duration,
}

impl SliceOutcome {
    /// Convert a non-successful outcome into the matching fatal error.
    pub fn into_result(self) -> Result<SliceResult> {
        match self.state {
            SupervisorState::Completed => Ok(self.result),
            SupervisorState::TimedOut => Err(SliceQuoteError::SlicerTimedOut(self.timeout)),
            _ => Err(SliceQuoteError::SlicerFailed(self.result.exit_code)),
        }
    }
}

/// Runs the slicer for one job.
pub struct SlicerSupervisor<'a> {
    settings: &'a SlicerSettings,
    work: &'a WorkDir,
    state: SupervisorState,
}

impl<'a> SlicerSupervisor<'a> {
    /// Create a supervisor writing its logs into `work`.
    pub fn new(settings: &'a SlicerSettings, work: &'a WorkDir) -> Self {
        Self {
            settings,
            work,
            state: SupervisorState::NotStarted,
        }
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = ?self.state, to = ?next, "slicer supervisor state");
        self.state = next;
    }

    /// Probe, launch, monitor and wait for the slicer.
    ///
    /// Non-zero exits and timeouts are reported as outcomes with their log
    /// persisted; only launch and wait failures are errors.
    pub async fn run(
        &mut self,
        invocation: &SliceInvocation,
        targets: &SliceTargets,
    ) -> Result<SliceOutcome> {
        self.transition(SupervisorState::Validating);
        if self.settings.run_probes {
            probe::run_diagnostics(self.settings).await;
        }

        info!(
            executable = %self.settings.executable.display(),
            info = %describe(&self.settings.executable),
            "Slicer executable"
        );
        info!(command = %invocation, "Slice command");
        info!(timeout_secs = self.settings.timeout.as_secs(), "Slicer timeout");

        info!("=== Starting slicer process ===");
        let started = Instant::now();
        let mut command = invocation.command();
        // Own process group, so a kill also reaches the display server and the slicer.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = SupervisorState::Failed;
                error!(error = %e, "failed to launch slicer");
                SliceQuoteError::Launch(e)
            })?;
        self.transition(SupervisorState::Launched);
        info!(pid = ?child.id(), "Slicer PID");

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        let (alive_tx, alive_rx) = watch::channel(true);
        let monitor = ProgressMonitor {
            tick: self.settings.monitor_tick,
            interval: self.settings.progress_interval,
            started,
            targets: targets.clone(),
        };
        let monitor = tokio::spawn(monitor.run(alive_rx));
        self.transition(SupervisorState::Monitoring);

        let waited = tokio::time::timeout(self.settings.timeout, child.wait()).await;
        let _ = alive_tx.send(false);
        let _ = monitor.await;
        let grace = self.settings.kill_grace;

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.transition(SupervisorState::Failed);
                error!(error = ?e, "ERROR: Unexpected failure while waiting for slicer");
                kill_process_tree(&mut child).await;
                return Err(SliceQuoteError::Io(e));
            }
            Err(_) => {
                self.transition(SupervisorState::TimedOut);
                error!(
                    timeout_secs = self.settings.timeout.as_secs(),
                    "ERROR: slicer TIMEOUT"
                );
                kill_process_tree(&mut child).await;
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    warn!("slicer did not exit within the kill grace period");
                }
                let result = SliceResult {
                    exit_code: None,
                    stdout: stdout.finish(grace).await,
                    stderr: stderr.finish(grace).await,
                    elapsed: started.elapsed(),
                    targets: targets.clone(),
                };
                return Ok(self.timed_out(result));
            }
        };

        let result = SliceResult {
            exit_code: status.code(),
            stdout: stdout.finish(grace).await,
            stderr: stderr.finish(grace).await,
            elapsed: started.elapsed(),
            targets: targets.clone(),
        };

        if status.success() {
            self.transition(SupervisorState::Completed);
            Ok(self.completed(result))
        } else {
            self.transition(SupervisorState::Failed);
            Ok(self.failed(result))
        }
    }

    fn outcome(&self, result: SliceResult, log_file: Option<PathBuf>) -> SliceOutcome {
        SliceOutcome {
            state: self.state,
            result,
            log_file,
            timeout: self.settings.timeout,
        }
    }

    fn completed(&self, result: SliceResult) -> SliceOutcome {
        info!(
            duration_secs = result.elapsed.as_secs_f64(),
            "Slicer finished: returncode=0"
        );
        info!(
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Slicer output sizes"
        );
        if !result.stdout.is_empty() {
            info!("Slicer stdout (last 500 chars):");
            let tail: Vec<&str> = tail_chars(&result.stdout, 500).lines().collect();
            for line in &tail[tail.len().saturating_sub(10)..] {
                info!("  {line}");
            }
        }

        let path = self.work.file(OUTPUT_LOG_FILE);
        let contents = format!("{}\n--- STDERR ---\n{}", result.stdout, result.stderr);
        let log_file = persist(&path, &contents);

        let targets = &result.targets;
        info!("Post-slice output check:");
        info!("  3mf: {} -> {}", targets.archive.display(), describe(&targets.archive));
        info!(
            "  slicedata dir: {} -> {}",
            targets.slice_data_dir.display(),
            describe(&targets.slice_data_dir)
        );
        let settings_export = targets.settings_export();
        info!(
            "  settings.json: {} -> {}",
            settings_export.display(),
            describe(&settings_export)
        );

        self.outcome(result, log_file)
    }

    fn failed(&self, result: SliceResult) -> SliceOutcome {
        error!(returncode = ?result.exit_code, "ERROR: slicer failed");
        error!("Slicer stdout (last 1000 chars): {}", or_none(tail_chars(&result.stdout, 1000)));
        error!("Slicer stderr (last 1000 chars): {}", or_none(tail_chars(&result.stderr, 1000)));

        let code = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        let contents = format!(
            "Error: returncode={code}\nStandard Output:\n{}\nStandard Error:\n{}\n",
            result.stdout, result.stderr
        );
        let log_file = persist(&self.work.file(ERROR_LOG_FILE), &contents);
        self.outcome(result, log_file)
    }

    fn timed_out(&self, result: SliceResult) -> SliceOutcome {
        warn!("Partial stdout (last 1000 chars): {}", or_none(tail_chars(&result.stdout, 1000)));
        warn!("Partial stderr (last 1000 chars): {}", or_none(tail_chars(&result.stderr, 1000)));

        let targets = &result.targets;
        warn!("Files created before timeout:");
        warn!("  3mf: {} -> {}", targets.archive.display(), describe(&targets.archive));
        warn!(
            "  output_dir: {} -> {}",
            targets.slice_data_dir.display(),
            describe(&targets.slice_data_dir)
        );
        match list_dir(&targets.slice_data_dir) {
            Ok(names) => {
                for name in names {
                    let path = targets.slice_data_dir.join(&name);
                    warn!("    {name}: {}", describe(&path));
                }
            }
            Err(diag) => warn!(%diag, "could not list slice data"),
        }

        let contents = format!(
            "Timeout after {}s\nPartial STDOUT:\n{}\nPartial STDERR:\n{}\n",
            self.settings.timeout.as_secs(),
            or_none(&result.stdout),
            or_none(&result.stderr)
        );
        let log_file = persist(&self.work.file(ERROR_LOG_FILE), &contents);
        self.outcome(result, log_file)
    }
}

/// Write a log artifact; failure is logged and yields `None`.
fn persist(path: &Path, contents: &str) -> Option<PathBuf> {
    match std::fs::write(path, contents) {
        Ok(()) => {
            info!(path = %path.display(), "Wrote slicer log");
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!(
                diag = %Diagnostic::new(format!("write {}", path.display()), e),
                "Failed writing slicer log"
            );
            None
        }
    }
}

/// Kill the slicer's process group, then the direct child.
async fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_group(pid).await;
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill slicer");
    }
}

/// The child leads its own group, so the group id is its pid.
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let group = format!("-{pgid}");
    let status = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, pgid, "failed to kill slicer process group"),
        Err(e) => warn!(error = %e, pgid, "failed to kill slicer process group"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pgid: u32) {}

fn or_none(s: &str) -> &str {
    if s.is_empty() {
        "none"
    } else {
        s
    }
}

/// Last `n` characters of `s`.
pub fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

/// Sorted file names in a directory.
pub fn list_dir(dir: &Path) -> std::result::Result<Vec<String>, Diagnostic> {
    let context = || format!("list {}", dir.display());
    let mut names = std::fs::read_dir(dir)
        .map_err(|e| Diagnostic::new(context(), e))?
        .map(|entry| {
            entry
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .map_err(|e| Diagnostic::new(context(), e))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    names.sort();
    Ok(names)
}

/// Reads one output pipe into a shared buffer so partial output survives a kill.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "slicer output read failed");
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    /// Wait up to `grace` for the pipe to close, then return what was read.
    async fn finish(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("slicer output still open after grace period, keeping partial output");
            self.task.abort();
        }
        let bytes = std::mem::take(
            &mut *self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Periodic progress logging while the slicer runs.
struct ProgressMonitor {
    tick: Duration,
    interval: Duration,
    started: Instant,
    targets: SliceTargets,
}

impl ProgressMonitor {
    /// Log until the liveness flag turns false. Returns the number of reports.
    async fn run(self, mut alive: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_report = Instant::now();
        let mut reports = 0;

        loop {
            tokio::select! {
                changed = alive.changed() => {
                    if changed.is_err() || !*alive.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if last_report.elapsed() >= self.interval {
                        self.report();
                        reports += 1;
                        last_report = Instant::now();
                    }
                }
            }
        }
        reports
    }

    fn report(&self) {
        info!(
            "  ... slicer running ({:.0}s elapsed)",
            self.started.elapsed().as_secs_f64()
        );
        if self.targets.archive.exists() {
            info!(
                "  ... 3mf file detected: {}",
                describe(&self.targets.archive)
            );
        }
        if let Ok(names) = list_dir(&self.targets.slice_data_dir) {
            if !names.is_empty() {
                let shown = &names[..names.len().min(MONITOR_LISTING_LIMIT)];
                info!("  ... output dir has {} files: {:?}", names.len(), shown);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::settings::{DisplayWrapper, ProfilePaths};
    use crate::workspace::{RequestId, WorkspaceManager};

    /// Slicer stand-in: `sh -c <script>` receives the real slicer arguments as `$@`.
    fn scripted(script: &str, timeout: Duration) -> SlicerSettings {
        SlicerSettings {
            executable: PathBuf::from("/opt/bambustudio/AppRun"),
            display_wrapper: Some(DisplayWrapper {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "slicer".into()],
            }),
            timeout,
            kill_grace: Duration::from_secs(1),
            monitor_tick: Duration::from_millis(10),
            progress_interval: Duration::from_millis(50),
            run_probes: false,
        }
    }

    fn setup(tmp: &Path) -> (WorkDir, SliceTargets) {
        let manager = WorkspaceManager::new(tmp.join("work"));
        let work = manager.prepare(&RequestId::parse("sup").unwrap()).unwrap();
        let targets = SliceTargets {
            archive: work.file("part_output.3mf"),
            slice_data_dir: work.output_dir.clone(),
        };
        (work, targets)
    }

    fn invocation(settings: &SlicerSettings, targets: &SliceTargets) -> SliceInvocation {
        let profiles = ProfilePaths {
            machine: "/p/m.json".into(),
            process: "/p/p.json".into(),
            filament: "/p/f.json".into(),
        };
        SliceInvocation::build(
            settings,
            &profiles,
            &profiles.process,
            targets,
            Path::new("/in/part.stl"),
        )
    }

    #[tokio::test]
    async fn test_completed_run_persists_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (work, targets) = setup(tmp.path());
        let script = r#"for a in "$@"; do case "$a" in --export-3mf=*) echo zip > "${a#--export-3mf=}";; esac; done; echo sliced; echo careful >&2"#;
        let settings = scripted(script, Duration::from_secs(10));
        let inv = invocation(&settings, &targets);

        let mut sup = SlicerSupervisor::new(&settings, &work);
        let outcome = sup.run(&inv, &targets).await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Completed);
        assert_eq!(outcome.state, SupervisorState::Completed);
        assert_eq!(outcome.result.exit_code, Some(0));
        assert_eq!(outcome.result.stdout.trim(), "sliced");
        assert!(targets.archive.exists());

        let log = std::fs::read_to_string(work.file(OUTPUT_LOG_FILE)).unwrap();
        assert_eq!(log, "sliced\n\n--- STDERR ---\ncareful\n");
        assert!(outcome.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let (work, targets) = setup(tmp.path());
        let settings = scripted("echo progress; echo boom >&2; exit 3", Duration::from_secs(10));
        let inv = invocation(&settings, &targets);

        let mut sup = SlicerSupervisor::new(&settings, &work);
        let outcome = sup.run(&inv, &targets).await.unwrap();

        assert_eq!(outcome.state, SupervisorState::Failed);
        assert_eq!(outcome.result.exit_code, Some(3));
        let log = std::fs::read_to_string(work.file(ERROR_LOG_FILE)).unwrap();
        assert!(log.starts_with("Error: returncode=3\n"));
        assert!(log.contains("Standard Output:\nprogress"));
        assert!(log.contains("Standard Error:\nboom"));
        assert!(!work.file(OUTPUT_LOG_FILE).exists());
        assert!(matches!(
            outcome.into_result(),
            Err(SliceQuoteError::SlicerFailed(Some(3)))
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (work, targets) = setup(tmp.path());
        let settings = scripted("echo partial; exec sleep 30", Duration::from_secs(1));
        let inv = invocation(&settings, &targets);

        let started = Instant::now();
        let mut sup = SlicerSupervisor::new(&settings, &work);
        let outcome = sup.run(&inv, &targets).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.state, SupervisorState::TimedOut);
        assert!(sup.state().is_terminal());
        assert_eq!(outcome.result.exit_code, None);
        assert_eq!(outcome.result.stdout.trim(), "partial");

        let log = std::fs::read_to_string(work.file(ERROR_LOG_FILE)).unwrap();
        assert!(log.starts_with("Timeout after 1s\n"));
        assert!(log.contains("Partial STDOUT:\npartial"));
        assert!(log.contains("Partial STDERR:\nnone"));
        assert!(matches!(
            outcome.into_result(),
            Err(SliceQuoteError::SlicerTimedOut(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let (work, targets) = setup(tmp.path());
        let pid_file = tmp.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
        let settings = scripted(&script, Duration::from_secs(1));
        let inv = invocation(&settings, &targets);

        let mut sup = SlicerSupervisor::new(&settings, &work);
        let outcome = sup.run(&inv, &targets).await.unwrap();
        assert_eq!(outcome.state, SupervisorState::TimedOut);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
        // Gone, or a zombie waiting to be reaped by init.
        let dead = || match std::fs::read_to_string(&stat) {
            Err(_) => true,
            Ok(text) => text
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        };
        for _ in 0..100 {
            if dead() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dead(), "grandchild {} survived the timeout", pid.trim());
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (work, targets) = setup(tmp.path());
        let settings = SlicerSettings {
            executable: tmp.path().join("no-such-slicer"),
            display_wrapper: None,
            run_probes: false,
            ..SlicerSettings::default()
        };
        let inv = invocation(&settings, &targets);

        let mut sup = SlicerSupervisor::new(&settings, &work);
        let err = sup.run(&inv, &targets).await.unwrap_err();
        assert!(matches!(err, SliceQuoteError::Launch(_)));
        assert_eq!(sup.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn test_monitor_stops_when_flag_clears() {
        let tmp = tempfile::tempdir().unwrap();
        let (_work, targets) = setup(tmp.path());
        let monitor = ProgressMonitor {
            tick: Duration::from_millis(5),
            interval: Duration::from_millis(20),
            started: Instant::now(),
            targets,
        };
        let (tx, rx) = watch::channel(true);
        let handle = tokio::spawn(monitor.run(rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(false).unwrap();
        let reports = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
        assert!(reports >= 1);
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SupervisorState::NotStarted.is_terminal());
        assert!(!SupervisorState::Monitoring.is_terminal());
        assert!(SupervisorState::TimedOut.is_terminal());
    }
}
