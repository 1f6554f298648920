//! Display and rendering probes run before launching the slicer.
//!
//! Probes only produce log lines. A failing probe never stops a job.

use std::process::Stdio;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Diagnostic;
use crate::settings::{DisplayWrapper, SlicerSettings};

const STDERR_EXCERPT: usize = 500;

/// One diagnostic command with its own timeout.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Name used in log lines.
    pub name: &'static str,
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Time limit.
    pub timeout: Duration,
}

/// Captured output of a successful probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl Probe {
    fn wrapped(
        name: &'static str,
        wrapper: Option<&DisplayWrapper>,
        tool: &[&str],
        timeout: Duration,
    ) -> Self {
        let mut command: Vec<String> = Vec::new();
        if let Some(w) = wrapper {
            command.push(w.program.clone());
            command.extend(w.args.iter().cloned());
        }
        command.extend(tool.iter().map(|s| s.to_string()));
        let program = command.remove(0);
        Self {
            name,
            program,
            args: command,
            env: Vec::new(),
            timeout,
        }
    }

    /// Check that a virtual X display can be opened.
    pub fn display(wrapper: Option<&DisplayWrapper>) -> Self {
        Self::wrapped("xvfb", wrapper, &["xdpyinfo"], Duration::from_secs(10))
    }

    /// Check that software OpenGL rendering works on that display.
    pub fn rendering(wrapper: Option<&DisplayWrapper>) -> Self {
        let mut probe = Self::wrapped(
            "OpenGL",
            wrapper,
            &["glxinfo", "-B"],
            Duration::from_secs(15),
        );
        probe
            .env
            .push(("LIBGL_ALWAYS_SOFTWARE".into(), "1".into()));
        probe
    }

    /// Run the probe. Non-zero exits, timeouts and launch failures are diagnostics.
    pub async fn run(&self) -> Result<ProbeOutput, Diagnostic> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let context = format!("{} validation", self.name);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Diagnostic::new(context, format!("{} not found", self.program)));
            }
            Ok(Err(e)) => return Err(Diagnostic::new(context, e)),
            Err(_) => {
                return Err(Diagnostic::new(
                    context,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            return Err(Diagnostic::new(
                context,
                format!("returncode={:?} stderr={excerpt}", output.status.code()),
            ));
        }
        Ok(ProbeOutput { stdout, stderr })
    }
}

/// Renderer, vendor and version lines from the head of `glxinfo -B` output.
pub fn renderer_summary(stdout: &str) -> Vec<&str> {
    stdout
        .lines()
        .take(10)
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("renderer") || lower.contains("vendor") || lower.contains("version")
        })
        .collect()
}

/// Run both probes and log their results.
pub async fn run_diagnostics(slicer: &SlicerSettings) {
    let wrapper = slicer.display_wrapper.as_ref();

    info!("=== X11/xvfb validation ===");
    match Probe::display(wrapper).run().await {
        Ok(_) => info!("xvfb validation: OK (xdpyinfo succeeded)"),
        Err(diag) => warn!(%diag, "xvfb validation failed"),
    }

    info!("=== OpenGL/Mesa validation ===");
    match Probe::rendering(wrapper).run().await {
        Ok(output) => {
            info!("OpenGL validation: OK");
            for line in renderer_summary(&output.stdout) {
                info!("  {line}");
            }
        }
        Err(diag) => warn!(%diag, "OpenGL validation failed"),
    }
}
