//! Remote command execution and file transfer.
//!
//! Every environment hands out a [`RemoteExec`]. Three strategies exist:
//!
//! | Strategy | Module | Used by |
//! |----------|--------|---------|
//! | SSH with a cached ControlMaster connection | [`ssh`] | EC2 |
//! | Provider CLI exec (`aws ecs execute-command`, `gh codespace ssh`) | [`native`] | ECS, Codespaces |
//! | Local processes | [`local`] | Local |
//!
//! The Docker driver talks to the Engine exec API directly but shares the
//! wrapper and output capture defined here.
//!
//! # Process groups
//!
//! Commands run inside a small shell wrapper that starts the real command in
//! its own process group and reports the group ID on stderr:
//!
//! ```text
//! __TASKLIFT_PGID__=4242
//! ...command output...
//! __TASKLIFT_EXIT__=0
//! ```
//!
//! On timeout the transport sends `SIGTERM` (then `SIGKILL`) to that group
//! through a second channel, so the remote command stops instead of running
//! on after the local wait is abandoned. The exit marker also carries the
//! real exit status through CLIs that do not propagate it.

pub mod local;
pub mod native;
pub mod ssh;

use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use crate::config::validate::is_env_name;
use crate::connector::spawn_error;
use crate::provider::{OutputCallback, OutputLine, ProviderError, ProviderResult};

pub use local::LocalExec;
pub use native::NativeExec;
pub use ssh::{SshTarget, SshTransport};

/// Exit status the download script uses for "no such file".
pub const MISSING_FILE_EXIT: i32 = 44;

const PGID_MARKER: &str = "__TASKLIFT_PGID__=";
const EXIT_MARKER: &str = "__TASKLIFT_EXIT__=";

/// Grace between `SIGTERM` and `SIGKILL` for a timed out command.
const KILL_GRACE_SECS: u64 = 2;

/// A command to run in an environment.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub interactive: bool,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: Vec::new(),
            timeout,
            interactive: false,
        }
    }
}

/// What came back from a command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// `None` when the command never reported one (timeout, interactive).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// A way to run commands and move files in one environment.
///
/// Implementations serialize their own commands: two in-flight calls on the
/// same transport never share a connection.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Short description for logs (`ssh ubuntu@1.2.3.4`).
    fn describe(&self) -> String;

    /// Runs a command, streaming lines to `sink` as they arrive.
    ///
    /// A command that runs and fails is `Ok` with a non-zero exit code. `Err`
    /// means the transport itself broke.
    async fn exec(
        &self,
        request: &ExecRequest,
        sink: Option<&OutputCallback>,
    ) -> ProviderResult<ExecOutcome>;

    /// Writes one file, creating parent directories.
    async fn upload_file(&self, path: &str, content: &[u8]) -> ProviderResult<()>;

    /// Reads one file. `Ok(None)` when it does not exist.
    async fn download_file(&self, path: &str) -> ProviderResult<Option<Vec<u8>>>;

    /// Releases cached connections. Safe to call more than once.
    async fn close(&self) {}
}

/// Transports cached per environment ID.
#[derive(Default)]
pub struct TransportCache {
    entries: Mutex<HashMap<String, Arc<dyn RemoteExec>>>,
}

impl TransportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached transport, or builds and caches one.
    pub async fn get_or_insert_with<F>(
        &self,
        environment_id: &str,
        build: F,
    ) -> ProviderResult<Arc<dyn RemoteExec>>
    where
        F: FnOnce() -> ProviderResult<Arc<dyn RemoteExec>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(environment_id) {
            return Ok(existing.clone());
        }
        let transport = build()?;
        entries.insert(environment_id.to_string(), transport.clone());
        Ok(transport)
    }

    /// Drops and closes the transport for an environment, if any.
    pub async fn evict(&self, environment_id: &str) {
        let removed = self.entries.lock().await.remove(environment_id);
        if let Some(transport) = removed {
            debug!("Closing transport {}", transport.describe());
            transport.close().await;
        }
    }
}

/// Quotes a string for a POSIX shell.
pub fn quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

/// The `export ...; cd ... && command` line for a request.
pub fn command_line(request: &ExecRequest) -> ProviderResult<String> {
    let mut line = String::new();
    for (key, value) in &request.env {
        if !is_env_name(key) {
            return Err(ProviderError::Configuration(format!(
                "'{}' is not a valid environment variable name",
                key
            )));
        }
        line.push_str(&format!("export {}={}; ", key, quote(value)));
    }
    if let Some(dir) = &request.working_dir {
        line.push_str(&format!("cd {} && ", quote(dir)));
    }
    line.push_str(&request.command);
    Ok(line)
}

/// Wraps a request in the process-group reporting wrapper.
pub fn wrap_command(request: &ExecRequest) -> ProviderResult<String> {
    let inner = quote(&command_line(request)?);
    Ok(format!(
        "if command -v setsid >/dev/null 2>&1; then setsid sh -c {inner} & \
         else set -m; sh -c {inner} & fi; \
         pid=$!; echo \"{PGID_MARKER}$pid\" >&2; \
         wait \"$pid\"; rc=$?; echo \"{EXIT_MARKER}$rc\" >&2; exit $rc"
    ))
}

/// Shell line that stops a process group, politely first.
pub fn kill_group_command(pgid: i32) -> String {
    format!(
        "kill -TERM -- -{pgid} 2>/dev/null || kill -TERM {pgid} 2>/dev/null; \
         sleep {KILL_GRACE_SECS}; kill -KILL -- -{pgid} 2>/dev/null; true"
    )
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => None,
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Shell line that creates parent directories and writes stdin to `path`.
pub fn upload_script(path: &str) -> String {
    match parent_dir(path) {
        Some(dir) => format!("mkdir -p {} && cat > {}", quote(dir), quote(path)),
        None => format!("cat > {}", quote(path)),
    }
}

/// Shell line that prints `path`, or exits with [`MISSING_FILE_EXIT`].
pub fn download_script(path: &str) -> String {
    let p = quote(path);
    format!("if [ -f {p} ]; then cat {p}; else exit {MISSING_FILE_EXIT}; fi")
}

/// Collects command output, strips wrapper markers and forwards lines.
pub(crate) struct OutputCapture<'a> {
    sink: Option<&'a OutputCallback>,
    noise: &'static [&'static str],
    stdout: String,
    stderr: String,
    partial_out: Vec<u8>,
    partial_err: Vec<u8>,
    pub pgid: Option<i32>,
    pub exit: Option<i32>,
}

impl<'a> OutputCapture<'a> {
    pub fn new(sink: Option<&'a OutputCallback>, noise: &'static [&'static str]) -> Self {
        Self {
            sink,
            noise,
            stdout: String::new(),
            stderr: String::new(),
            partial_out: Vec::new(),
            partial_err: Vec::new(),
            pgid: None,
            exit: None,
        }
    }

    pub fn line(&mut self, line: OutputLine) {
        let (text, is_stderr) = match line {
            OutputLine::Stdout(s) => (s, false),
            OutputLine::Stderr(s) => (s, true),
        };
        let text = text.trim_end_matches('\r');

        // Markers can land on stdout when the CLI merges streams.
        if let Some(pgid) = text.strip_prefix(PGID_MARKER) {
            self.pgid = pgid.trim().parse().ok();
            return;
        }
        if let Some(code) = text.strip_prefix(EXIT_MARKER) {
            self.exit = code.trim().parse().ok();
            return;
        }
        if self.noise.iter().any(|n| text.contains(n)) {
            return;
        }

        let (buf, line) = if is_stderr {
            (&mut self.stderr, OutputLine::Stderr(text.to_string()))
        } else {
            (&mut self.stdout, OutputLine::Stdout(text.to_string()))
        };
        buf.push_str(text);
        buf.push('\n');
        if let Some(sink) = self.sink {
            sink(&line);
        }
    }

    /// Feeds a raw chunk that may end mid-line.
    pub fn chunk(&mut self, is_stderr: bool, bytes: &[u8]) {
        let partial = if is_stderr {
            &mut self.partial_err
        } else {
            &mut self.partial_out
        };
        partial.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = partial.iter().position(|b| *b == b'\n') {
            let rest = partial.split_off(pos + 1);
            let mut line = std::mem::replace(partial, rest);
            line.pop();
            lines.push(String::from_utf8_lossy(&line).to_string());
        }
        for line in lines {
            self.line(if is_stderr {
                OutputLine::Stderr(line)
            } else {
                OutputLine::Stdout(line)
            });
        }
    }

    /// Emits whatever is left without a trailing newline.
    pub fn flush(&mut self) {
        let out = std::mem::take(&mut self.partial_out);
        if !out.is_empty() {
            self.line(OutputLine::Stdout(String::from_utf8_lossy(&out).to_string()));
        }
        let err = std::mem::take(&mut self.partial_err);
        if !err.is_empty() {
            self.line(OutputLine::Stderr(String::from_utf8_lossy(&err).to_string()));
        }
    }

    pub fn into_outcome(self, exit_code: Option<i32>, duration: Duration, timed_out: bool) -> ExecOutcome {
        ExecOutcome {
            exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            duration,
            timed_out,
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Result of [`run_wrapped`], with whether the wrapper reported an exit.
pub(crate) struct WrappedRun {
    pub outcome: ExecOutcome,
    /// False when the process ended without the exit marker, which means the
    /// transport (not the command) decided the exit status.
    pub exit_reported: bool,
}

/// Runs a local process whose command line carries [`wrap_command`] output.
///
/// Lines stream to `sink`. On timeout `kill` runs with the reported process
/// group ID before the local child is killed.
pub(crate) async fn run_wrapped<K, KFut>(
    mut cmd: tokio::process::Command,
    program: &str,
    timeout: Duration,
    sink: Option<&OutputCallback>,
    noise: &'static [&'static str],
    kill: K,
) -> ProviderResult<WrappedRun>
where
    K: FnOnce(i32) -> KFut,
    KFut: Future<Output = ()>,
{
    let start = Instant::now();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProviderError::Connection("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProviderError::Connection("Failed to capture stderr".to_string()))?;

    // Split on raw bytes so output that is not UTF-8 is decoded lossily
    // instead of ending the stream.
    let stdout_stream = SplitStream::new(BufReader::new(stdout).split(b'\n'))
        .filter_map(|line| async move { line.ok().map(|l| OutputLine::Stdout(lossy(&l))) });
    let stderr_stream = SplitStream::new(BufReader::new(stderr).split(b'\n'))
        .filter_map(|line| async move { line.ok().map(|l| OutputLine::Stderr(lossy(&l))) });
    let mut lines = stream::select(Box::pin(stdout_stream), Box::pin(stderr_stream));

    let mut capture = OutputCapture::new(sink, noise);
    let finished = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.next().await {
            capture.line(line);
        }
        child.wait().await
    })
    .await;

    match finished {
        Ok(status) => {
            let status = status?;
            let exit_reported = capture.exit.is_some();
            let exit_code = capture.exit.or(status.code());
            Ok(WrappedRun {
                outcome: capture.into_outcome(exit_code, start.elapsed(), false),
                exit_reported,
            })
        }
        Err(_) => {
            warn!(
                "{} command timed out after {}s, stopping it",
                program,
                timeout.as_secs()
            );
            match capture.pgid {
                Some(pgid) => kill(pgid).await,
                None => warn!("No process group reported; only the local process is killed"),
            }
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            Ok(WrappedRun {
                outcome: capture.into_outcome(None, start.elapsed(), true),
                exit_reported: false,
            })
        }
    }
}

/// Runs a command with the local terminal attached. Nothing is captured.
pub(crate) async fn run_interactive(
    mut cmd: tokio::process::Command,
    program: &str,
    timeout: Duration,
) -> ProviderResult<ExecOutcome> {
    let start = Instant::now();
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(ExecOutcome {
            exit_code: status?.code(),
            duration: start.elapsed(),
            ..Default::default()
        }),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(ExecOutcome {
                duration: start.elapsed(),
                timed_out: true,
                ..Default::default()
            })
        }
    }
}

/// Looks a program up on `PATH` without running it.
pub(crate) fn find_on_path(program: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn test_command_line_exports_and_cd() {
        let mut request = ExecRequest::new("make test", Duration::from_secs(1));
        request.env = vec![("NAME".into(), "it's".into())];
        request.working_dir = Some("/work dir".into());
        let line = command_line(&request).unwrap();
        assert_eq!(line, "export NAME='it'\\''s'; cd '/work dir' && make test");
    }

    #[test]
    fn test_command_line_rejects_bad_env_name() {
        let mut request = ExecRequest::new("true", Duration::from_secs(1));
        request.env = vec![("A;rm -rf /".into(), "x".into())];
        assert!(matches!(
            command_line(&request),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[test]
    fn test_scripts() {
        assert_eq!(upload_script("/tmp/a.txt"), "mkdir -p /tmp && cat > /tmp/a.txt");
        assert_eq!(upload_script("a.txt"), "cat > a.txt");
        assert_eq!(
            download_script("/x y"),
            "if [ -f '/x y' ]; then cat '/x y'; else exit 44; fi"
        );
        assert!(kill_group_command(42).contains("kill -TERM -- -42"));
    }

    #[test]
    fn test_capture_strips_markers_and_noise() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let sink: OutputCallback = Arc::new(move |line: &OutputLine| {
            recorder.lock().unwrap().push(line.clone());
        });
        let mut capture = OutputCapture::new(Some(&sink), &["Starting session"]);
        capture.line(OutputLine::Stderr("__TASKLIFT_PGID__=77".into()));
        capture.line(OutputLine::Stdout("Starting session with SessionId: abc".into()));
        capture.line(OutputLine::Stdout("hello\r".into()));
        capture.line(OutputLine::Stdout("__TASKLIFT_EXIT__=3\r".into()));

        assert_eq!(capture.pgid, Some(77));
        assert_eq!(capture.exit, Some(3));
        let outcome = capture.into_outcome(Some(3), Duration::ZERO, false);
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[OutputLine::Stdout("hello".into())]
        );
    }

    #[test]
    fn test_capture_chunks_split_lines() {
        let mut capture = OutputCapture::new(None, &[]);
        capture.chunk(false, b"hel");
        capture.chunk(false, b"lo\nwor");
        capture.chunk(true, b"__TASKLIFT_PG");
        capture.chunk(true, b"ID__=9\n");
        capture.flush();
        assert_eq!(capture.pgid, Some(9));
        let outcome = capture.into_outcome(Some(0), Duration::ZERO, false);
        assert_eq!(outcome.stdout, "hello\nworld\n");
        assert_eq!(outcome.stderr, "");
    }

    #[tokio::test]
    async fn test_run_wrapped_reports_exit_code() {
        let request = ExecRequest::new("echo out; echo err >&2; exit 7", Duration::from_secs(10));
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(wrap_command(&request).unwrap());

        let run = run_wrapped(cmd, "sh", request.timeout, None, &[], |_| async {})
            .await
            .unwrap();
        assert!(run.exit_reported);
        assert_eq!(run.outcome.exit_code, Some(7));
        assert_eq!(run.outcome.stdout, "out\n");
        assert_eq!(run.outcome.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_run_wrapped_keeps_non_utf8_lines() {
        let request = ExecRequest::new(
            "printf '\\377ok\\n'; printf 'a\\376\\n' >&2; echo after",
            Duration::from_secs(10),
        );
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(wrap_command(&request).unwrap());

        let run = run_wrapped(cmd, "sh", request.timeout, None, &[], |_| async {})
            .await
            .unwrap();
        assert_eq!(run.outcome.exit_code, Some(0));
        assert_eq!(run.outcome.stdout, "\u{FFFD}ok\nafter\n");
        assert_eq!(run.outcome.stderr, "a\u{FFFD}\n");
    }

    #[tokio::test]
    async fn test_transport_cache_reuses_entry() {
        let cache = TransportCache::new();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let first = cache
            .get_or_insert_with("env-1", || {
                Ok(Arc::new(LocalExec::new(root.clone(), "/bin/sh", Vec::new())) as Arc<dyn RemoteExec>)
            })
            .await
            .unwrap();
        let second = cache
            .get_or_insert_with("env-1", || panic!("should be cached"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        cache.evict("env-1").await;
        cache.evict("env-1").await;
    }
}
