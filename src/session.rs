use std::ffi::OsStr;
use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::{
    process::{Child, Command},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::model::SessionEvent;
use crate::progress::events_for_line;

/// How a subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Succeeded,
    Failed(i32),
    Cancelled,
}

/// Cancellation wins over whatever the process reported, including a
/// clean exit that raced the terminate request. Death by signal has no
/// exit code and is reported as -1.
pub fn classify(cancelled: bool, exit_code: Option<i32>) -> SessionStatus {
    if cancelled {
        return SessionStatus::Cancelled;
    }
    match exit_code {
        Some(0) => SessionStatus::Succeeded,
        Some(code) => SessionStatus::Failed(code),
        None => SessionStatus::Failed(-1),
    }
}

/// Builds a tool command that never pops a console window.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// One subprocess, owned exclusively for its whole life.
///
/// stdout and stderr share one pipe, so lines come out in the order the
/// child wrote them. The child itself lives in a supervisor task that waits
/// for it and carries out the terminate/kill escalation once the session is
/// cancelled, so a cancel takes effect even while nobody is reading output.
pub struct ProcessSession {
    program: PathBuf,
    pid: Option<u32>,
    cancel: CancellationToken,
    lines: Option<SessionLines>,
    supervisor: JoinHandle<std::io::Result<ExitStatus>>,
}

impl ProcessSession {
    /// Spawns `program` with `args` in `workdir`. Must run inside a tokio
    /// runtime.
    pub fn start(
        program: &Path,
        args: &[String],
        workdir: &Path,
        grace: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (output, writer) = std::io::pipe()?;
        let error_writer = writer.try_clone()?;

        // The command owns both writer ends and drops them right after the
        // spawn, leaving the child as the only writer.
        let child = command(program)
            .args(args)
            .current_dir(workdir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(error_writer)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: program.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(program = %program.display(), ?pid, ?args, "process started");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || forward_lines(output, tx));

        let supervisor = tokio::spawn(supervise(child, pid, cancel.clone(), grace));

        Ok(Self {
            program: program.to_path_buf(),
            pid,
            lines: Some(SessionLines {
                rx,
                cancel: cancel.clone(),
            }),
            cancel,
            supervisor,
        })
    }

    /// Output lines in arrival order. Only the first call gets them.
    pub fn lines(&mut self) -> Option<SessionLines> {
        self.lines.take()
    }

    /// Idempotent and infallible; the outcome shows up in `wait`.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(pid = ?self.pid, "cancelling process");
        }
        self.cancel.cancel();
    }

    /// Resolves once the process has exited. Drain `lines` first so the
    /// result is not reported while output is still buffered.
    pub async fn wait(self) -> Result<SessionStatus> {
        let exit = self
            .supervisor
            .await
            .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))??;
        let status = classify(self.cancel.is_cancelled(), exit.code());
        tracing::info!(
            program = %self.program.display(),
            pid = ?self.pid,
            code = ?exit.code(),
            ?status,
            "process finished"
        );
        Ok(status)
    }

    /// Forwards every line to `events` (raw line first, then any percentage),
    /// copying lines into `transcript` when given, and returns the final
    /// status.
    pub async fn run_to_completion(
        mut self,
        events: &UnboundedSender<SessionEvent>,
        mut transcript: Option<&mut Vec<String>>,
    ) -> Result<SessionStatus> {
        if let Some(mut lines) = self.lines() {
            while let Some(line) = lines.next_line().await {
                tracing::debug!(pid = ?self.pid, "{line}");
                for event in events_for_line(&line) {
                    let _ = events.send(SessionEvent::Progress(event));
                }
                if let Some(transcript) = transcript.as_deref_mut() {
                    transcript.push(line);
                }
            }
        }
        self.wait().await
    }
}

/// Forward-only view of a session's merged output.
pub struct SessionLines {
    rx: UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl SessionLines {
    /// `None` once the process has closed its output or the session was
    /// cancelled.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.rx.recv() => line,
        }
    }
}

/// Runs on the blocking pool until the last writer closes the pipe or the
/// receiving side goes away.
fn forward_lines(output: PipeReader, tx: UnboundedSender<String>) {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!("output stream closed: {err}");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    cancel: CancellationToken,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Some(pid) = pid {
                request_termination(pid).await;
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(?pid, ?grace, "process ignored termination request, killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    }
}

async fn request_termination(pid: u32) {
    let pid = pid.to_string();

    #[cfg(unix)]
    let status = command("kill")
        .args(["-TERM", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(windows)]
    let status = command("taskkill")
        .args(["/PID", &pid, "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(not(any(unix, windows)))]
    let status: std::io::Result<ExitStatus> = Err(std::io::Error::other("no termination signal"));

    if let Err(err) = status {
        tracing::debug!(%pid, "termination request failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use std::time::Instant;

    #[test]
    fn cancellation_overrides_exit_code() {
        assert_eq!(classify(true, Some(0)), SessionStatus::Cancelled);
        assert_eq!(classify(true, Some(1)), SessionStatus::Cancelled);
        assert_eq!(classify(true, None), SessionStatus::Cancelled);
    }

    #[test]
    fn exit_codes_classify() {
        assert_eq!(classify(false, Some(0)), SessionStatus::Succeeded);
        assert_eq!(classify(false, Some(2)), SessionStatus::Failed(2));
        assert_eq!(classify(false, None), SessionStatus::Failed(-1));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessSession::start(
            &dir.path().join("no-such-tool"),
            &[],
            dir.path(),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(OrchestratorError::Spawn { .. })));
    }

    #[cfg(unix)]
    fn shell(script: &str, grace: Duration) -> ProcessSession {
        ProcessSession::start(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            &std::env::temp_dir(),
            grace,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let mut session = shell("echo out; sleep 0.1; echo err 1>&2", Duration::from_secs(1));
        let mut lines = session.lines().unwrap();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await {
            seen.push(line);
        }
        assert_eq!(seen, vec!["out".to_string(), "err".to_string()]);
        assert_eq!(session.wait().await.unwrap(), SessionStatus::Succeeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interleaved_streams_keep_emission_order() {
        let script = "for i in 1 2 3 4 5 6 7 8 9 10; do echo o$i; echo e$i 1>&2; done";
        let expected: Vec<String> = (1..=10)
            .flat_map(|i| [format!("o{i}"), format!("e{i}")])
            .collect();

        for _ in 0..20 {
            let mut session = shell(script, Duration::from_secs(1));
            let mut lines = session.lines().unwrap();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await {
                seen.push(line);
            }
            assert_eq!(seen, expected);
            assert_eq!(session.wait().await.unwrap(), SessionStatus::Succeeded);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lines_are_only_handed_out_once() {
        let mut session = shell("true", Duration::from_secs(1));
        assert!(session.lines().is_some());
        assert!(session.lines().is_none());
        session.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_failed_with_code() {
        let session = shell("echo boom; exit 3", Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let status = session.run_to_completion(&tx, None).await.unwrap();
        assert_eq!(status, SessionStatus::Failed(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_to_completion_emits_raw_then_percent() {
        let session = shell("printf '[download] 10.0%%\\n'", Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transcript = Vec::new();
        let status = session
            .run_to_completion(&tx, Some(&mut transcript))
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::Succeeded);
        assert_eq!(transcript, vec!["[download] 10.0%".to_string()]);
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Progress(ProgressEvent::RawLine(
                "[download] 10.0%".to_string()
            )))
        );
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Progress(ProgressEvent::PercentUpdate(10)))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_stops_a_cooperative_process() {
        let mut session = shell(
            "echo ready; while true; do sleep 0.1; done",
            Duration::from_secs(5),
        );
        let mut lines = session.lines().unwrap();
        assert_eq!(lines.next_line().await.as_deref(), Some("ready"));

        let started = Instant::now();
        session.cancel();
        session.cancel();
        assert_eq!(lines.next_line().await, None);
        let status = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, SessionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_escalates_to_kill_when_terminate_is_ignored() {
        let grace = Duration::from_millis(300);
        let mut session = shell(
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
            grace,
        );
        let mut lines = session.lines().unwrap();
        assert_eq!(lines.next_line().await.as_deref(), Some("ready"));

        let started = Instant::now();
        session.cancel();
        let status = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .expect("cancelled session must not run indefinitely")
            .unwrap();
        assert_eq!(status, SessionStatus::Cancelled);
        assert!(started.elapsed() >= grace);
    }
}
