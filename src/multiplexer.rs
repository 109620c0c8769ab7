//! Mapping logical sessions onto physical environments.
//!
//! - [`DedicatedSessions`] gives every session its own environment (EC2,
//!   Codespaces, Docker, Local).
//! - [`ServiceRegistry`] is the find-or-create table shared providers use to
//!   bind one long-lived service per repository; the ECS provider runs one
//!   task per session inside it.
//!
//! The helpers here turn facade calls into transport calls and are shared by
//! both shapes.

pub mod dedicated;
pub mod registry;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::events::{EventSink, ProviderEvent};
use crate::provider::{ExecOptions, FileMap, ProviderError, ProviderResult, Session, TaskResult};
use crate::transport::{ExecRequest, RemoteExec, quote};

pub use dedicated::DedicatedSessions;
pub use registry::ServiceRegistry;

/// How long a terminated session keeps answering with its final status.
/// Older records are dropped the next time a session is terminated.
pub(crate) const TOMBSTONE_TTL: Duration = Duration::from_secs(60 * 60);

/// What is left of a session after it was terminated.
#[derive(Clone)]
pub(crate) struct Tombstone {
    pub session: Session,
    since: Instant,
}

impl Tombstone {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            since: Instant::now(),
        }
    }

    pub fn expired(&self, ttl: Duration) -> bool {
        self.since.elapsed() >= ttl
    }
}

/// Defaults applied when the caller's options leave a field unset.
pub(crate) struct ExecDefaults<'a> {
    pub timeout: Duration,
    pub working_dir: Option<String>,
    pub env: &'a HashMap<String, String>,
}

/// Resolves `path` against `working_dir` unless it is absolute.
pub(crate) fn resolve_path(path: &str, working_dir: Option<&str>) -> String {
    match working_dir {
        Some(dir) if !path.starts_with('/') => {
            format!("{}/{}", dir.trim_end_matches('/'), path)
        }
        _ => path.to_string(),
    }
}

/// Runs a command and folds every outcome into a [`TaskResult`].
pub(crate) async fn execute_via(
    transport: &dyn RemoteExec,
    session_id: &str,
    command: &str,
    opts: &ExecOptions,
    defaults: ExecDefaults<'_>,
    events: &EventSink,
) -> TaskResult {
    let mut env: Vec<(String, String)> = defaults
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    env.extend(opts.env.iter().cloned());

    let request = ExecRequest {
        command: command.to_string(),
        working_dir: opts.working_dir.clone().or(defaults.working_dir),
        env,
        timeout: opts.timeout.unwrap_or(defaults.timeout),
        interactive: opts.interactive,
    };

    debug!("Session {} exec via {}: {}", session_id, transport.describe(), command);
    events.emit(ProviderEvent::TaskStarted {
        session_id: session_id.to_string(),
        command: command.to_string(),
    });

    let result = match transport.exec(&request, opts.on_output.as_ref()).await {
        Ok(outcome) => {
            let success = outcome.success();
            let error = if outcome.timed_out {
                Some(format!(
                    "Command timed out after {}s",
                    request.timeout.as_secs()
                ))
            } else if success {
                None
            } else if !outcome.stderr.trim().is_empty() {
                Some(outcome.stderr.clone())
            } else {
                Some(match outcome.exit_code {
                    Some(code) => format!("Command exited with code {}", code),
                    None => "Command ended without an exit code".to_string(),
                })
            };
            TaskResult {
                success,
                output: outcome.stdout,
                stderr: outcome.stderr,
                error,
                exit_code: outcome.exit_code,
                duration: outcome.duration,
                timed_out: outcome.timed_out,
            }
        }
        Err(e) => {
            warn!("Session {} exec failed: {}", session_id, e);
            let exit_code = match &e {
                ProviderError::Execution { exit_code, .. } => *exit_code,
                _ => None,
            };
            TaskResult {
                exit_code,
                ..TaskResult::failed(e.to_string())
            }
        }
    };

    if result.success {
        events.emit(ProviderEvent::TaskCompleted {
            session_id: session_id.to_string(),
            exit_code: result.exit_code.unwrap_or(0),
            duration: result.duration,
        });
    } else {
        events.emit(ProviderEvent::TaskFailed {
            session_id: session_id.to_string(),
            exit_code: result.exit_code,
            error: result.error.clone().unwrap_or_default(),
            timed_out: result.timed_out,
        });
    }
    result
}

/// Writes every file, continuing past failures.
///
/// # Errors
///
/// After trying all files, returns one error naming each file that failed.
pub(crate) async fn upload_via(
    transport: &dyn RemoteExec,
    files: &FileMap,
    working_dir: Option<&str>,
) -> ProviderResult<()> {
    let mut failed = Vec::new();
    for (path, content) in files {
        let target = resolve_path(path, working_dir);
        match transport.upload_file(&target, content).await {
            Ok(()) => debug!("Uploaded {} ({} bytes)", target, content.len()),
            Err(e) => {
                warn!("Failed to upload {}: {}", target, e);
                failed.push(format!("{} ({})", path, e));
            }
        }
    }
    if failed.is_empty() {
        info!("Uploaded {} file(s) via {}", files.len(), transport.describe());
        Ok(())
    } else {
        Err(ProviderError::Execution {
            message: format!(
                "Failed to upload {} of {} file(s): {}",
                failed.len(),
                files.len(),
                failed.join(", ")
            ),
            exit_code: None,
            stderr: String::new(),
        })
    }
}

/// Reads each path. Missing files are logged and left out of the map.
///
/// # Errors
///
/// Only when no path could be read because the transport itself failed.
pub(crate) async fn download_via(
    transport: &dyn RemoteExec,
    paths: &[String],
    working_dir: Option<&str>,
) -> ProviderResult<FileMap> {
    let mut files = FileMap::new();
    let mut first_error = None;
    for path in paths {
        let target = resolve_path(path, working_dir);
        match transport.download_file(&target).await {
            Ok(Some(content)) => {
                files.insert(path.clone(), content);
            }
            Ok(None) => warn!("Remote file {} does not exist, skipping", target),
            Err(e) => {
                warn!("Failed to download {}: {}", target, e);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if files.is_empty() => Err(e),
        _ => Ok(files),
    }
}

/// Runs a rendered bootstrap command in a fresh environment.
///
/// # Errors
///
/// A non-zero exit or timeout is a [`ProviderError::Provisioning`]; transport
/// failures pass through.
pub(crate) async fn run_bootstrap(
    transport: &dyn RemoteExec,
    command: String,
    defaults: ExecDefaults<'_>,
) -> ProviderResult<()> {
    let mut env: Vec<(String, String)> = defaults
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    let request = ExecRequest {
        command,
        working_dir: defaults.working_dir,
        env,
        timeout: defaults.timeout,
        interactive: false,
    };
    let outcome = transport.exec(&request, None).await?;
    if outcome.success() {
        return Ok(());
    }
    let detail = if outcome.timed_out {
        format!("timed out after {}s", request.timeout.as_secs())
    } else {
        format!(
            "exit code {}: {}",
            outcome.exit_code.unwrap_or(-1),
            outcome.stderr.trim()
        )
    };
    Err(ProviderError::provisioning("environment bootstrap", detail))
}

/// Fills `{repository}`, `{branch}` and `{session_id}` in a bootstrap command.
///
/// Values are shell-quoted. Returns `None` when the template needs a
/// repository and the session has none.
pub(crate) fn render_bootstrap(
    template: &str,
    repository: Option<&str>,
    branch: Option<&str>,
    session_id: &str,
) -> Option<String> {
    if template.contains("{repository}") && repository.is_none() {
        return None;
    }
    let rendered = template
        .replace("{repository}", &quote(repository.unwrap_or_default()))
        .replace("{branch}", &quote(branch.unwrap_or("main")))
        .replace("{session_id}", &quote(session_id));
    Some(rendered)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::provider::OutputLine;
    use crate::transport::LocalExec;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/tmp/a.txt", Some("/work")), "/tmp/a.txt");
        assert_eq!(resolve_path("out/a.txt", Some("/work/")), "/work/out/a.txt");
        assert_eq!(resolve_path("a.txt", None), "a.txt");
    }

    #[test]
    fn test_render_bootstrap() {
        let rendered = render_bootstrap(
            "git clone --branch {branch} {repository} ws-{session_id}",
            Some("https://github.com/acme/app.git"),
            None,
            "s 1",
        )
        .unwrap();
        assert_eq!(
            rendered,
            "git clone --branch main https://github.com/acme/app.git ws-'s 1'"
        );
        assert!(render_bootstrap("git clone {repository}", None, None, "s").is_none());
    }

    #[tokio::test]
    async fn test_download_omits_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalExec::new(dir.path().to_path_buf(), "/bin/sh", Vec::new());
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("c.txt"), "c").unwrap();

        let paths: Vec<String> = ["a.txt", "missing.txt", "b.txt", "c.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let files = download_via(&transport, &paths, None).await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(!files.contains_key("missing.txt"));
        assert_eq!(files["b.txt"], b"b");
    }

    #[tokio::test]
    async fn test_execute_via_reports_failure_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalExec::new(dir.path().to_path_buf(), "/bin/sh", Vec::new());
        let (events, mut rx) = EventSink::channel();
        let env = HashMap::from([("BASE".to_string(), "1".to_string())]);

        let result = execute_via(
            &transport,
            "s1",
            "echo $BASE; exit 3",
            &ExecOptions::default(),
            ExecDefaults {
                timeout: Duration::from_secs(10),
                working_dir: None,
                env: &env,
            },
            &events,
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "1\n");
        assert_eq!(result.error.as_deref(), Some("Command exited with code 3"));

        assert!(matches!(rx.recv().await, Some(ProviderEvent::TaskStarted { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ProviderEvent::TaskFailed { exit_code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_via_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalExec::new(dir.path().to_path_buf(), "/bin/sh", Vec::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let opts = ExecOptions::default().on_output(Arc::new(move |line: &OutputLine| {
            recorder.lock().unwrap().push(line.clone());
        }));
        let env = HashMap::new();

        let result = execute_via(
            &transport,
            "s1",
            "echo one; echo two",
            &opts,
            ExecDefaults {
                timeout: Duration::from_secs(10),
                working_dir: None,
                env: &env,
            },
            &EventSink::disabled(),
        )
        .await;
        assert!(result.success);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_via_success_with_stderr_has_no_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalExec::new(dir.path().to_path_buf(), "/bin/sh", Vec::new());
        let env = HashMap::new();

        let result = execute_via(
            &transport,
            "s1",
            "echo done; echo 'warning: deprecated flag' >&2",
            &ExecOptions::default(),
            ExecDefaults {
                timeout: Duration::from_secs(10),
                working_dir: None,
                env: &env,
            },
            &EventSink::disabled(),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.error, None);
        assert_eq!(result.output, "done\n");
        assert_eq!(result.stderr, "warning: deprecated flag\n");
    }
}
