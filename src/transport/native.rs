//! Provider-native exec through the provider's CLI.
//!
//! Container targets have no sshd reachable from outside. Their providers
//! ship an exec bridge instead:
//!
//! ```text
//! aws ecs execute-command --cluster C --task T --container agent --interactive --command "sh -c '...'"
//! gh codespace ssh --codespace NAME -- "sh -c '...'"
//! ```
//!
//! Both take the remote command as one final argument. Output comes back on
//! the CLI's own stdout/stderr, interleaved with session chatter that is
//! filtered out. Files move as base64 text through the same channel.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    ExecOutcome, ExecRequest, MISSING_FILE_EXIT, RemoteExec, command_line, find_on_path,
    kill_group_command, quote, run_interactive, run_wrapped, wrap_command,
};
use crate::connector::install_hint;
use crate::provider::{OutputCallback, ProviderError, ProviderResult};

/// Lines the Session Manager plugin prints around every session.
pub const SSM_NOISE: &[&str] = &[
    "Starting session with SessionId",
    "Exiting session with sessionId",
    "The Session Manager plugin was installed successfully",
    "Cannot perform start session: EOF",
];

/// Base64 characters per upload command. Keeps command lines well below
/// the exec APIs' argument limits.
const UPLOAD_CHUNK: usize = 16 * 1024;

const FILE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

pub struct NativeExec {
    label: String,
    program: String,
    prefix: Vec<String>,
    env: Vec<(String, String)>,
    required_tools: Vec<String>,
    noise: &'static [&'static str],
    exec_lock: Mutex<()>,
}

impl NativeExec {
    /// `program prefix... "sh -c <script>"` runs `script` in the target.
    pub fn new(label: impl Into<String>, program: impl Into<String>, prefix: Vec<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            prefix,
            env: Vec::new(),
            required_tools: Vec::new(),
            noise: &[],
            exec_lock: Mutex::new(()),
        }
    }

    /// Environment for the local CLI process (credentials, region).
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// A helper the CLI needs at runtime but does not check for itself.
    pub fn requires(mut self, tool: impl Into<String>) -> Self {
        self.required_tools.push(tool.into());
        self
    }

    pub fn with_noise(mut self, noise: &'static [&'static str]) -> Self {
        self.noise = noise;
        self
    }

    fn check_tools(&self) -> ProviderResult<()> {
        for tool in &self.required_tools {
            if !find_on_path(tool) {
                return Err(ProviderError::ToolNotInstalled {
                    tool: tool.clone(),
                    hint: install_hint(tool).to_string(),
                });
            }
        }
        Ok(())
    }

    fn command(&self, script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.prefix)
            .arg(format!("sh -c {}", quote(script)))
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    async fn kill_group(&self, pgid: i32) {
        debug!("Killing process group {} via {}", pgid, self.label);
        let request = ExecRequest::new(kill_group_command(pgid), Duration::from_secs(30));
        let cmd = self.command(&request.command);
        if let Err(e) = run_wrapped(cmd, &self.program, request.timeout, None, self.noise, |_| async {}).await {
            warn!("Failed to signal process group {}: {}", pgid, e);
        }
    }

    /// Runs a short helper script and returns its stdout and exit code.
    async fn run_script(&self, script: &str) -> ProviderResult<(Option<i32>, String, String)> {
        let request = ExecRequest::new(script, FILE_TRANSFER_TIMEOUT);
        let cmd = self.command(&wrap_command(&request)?);
        let run = run_wrapped(cmd, &self.program, request.timeout, None, self.noise, |pgid| {
            self.kill_group(pgid)
        })
        .await?;
        if run.outcome.timed_out {
            return Err(ProviderError::Connection(format!(
                "{} did not answer within {}s",
                self.label,
                request.timeout.as_secs()
            )));
        }
        if !run.exit_reported {
            return Err(ProviderError::Connection(format!(
                "{} ended without running the command: {}",
                self.label,
                run.outcome.stderr.trim()
            )));
        }
        Ok((run.outcome.exit_code, run.outcome.stdout, run.outcome.stderr))
    }
}

#[async_trait]
impl RemoteExec for NativeExec {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn exec(
        &self,
        request: &ExecRequest,
        sink: Option<&OutputCallback>,
    ) -> ProviderResult<ExecOutcome> {
        self.check_tools()?;
        let _guard = self.exec_lock.lock().await;

        if request.interactive {
            let cmd = self.command(&command_line(request)?);
            return run_interactive(cmd, &self.program, request.timeout).await;
        }

        let cmd = self.command(&wrap_command(request)?);
        let run = run_wrapped(cmd, &self.program, request.timeout, sink, self.noise, |pgid| {
            self.kill_group(pgid)
        })
        .await?;

        if !run.exit_reported && !run.outcome.timed_out {
            // The bridge failed before the wrapper could report anything.
            return Err(ProviderError::Execution {
                message: format!("{} failed to start the command", self.label),
                exit_code: run.outcome.exit_code,
                stderr: run.outcome.stderr,
            });
        }
        Ok(run.outcome)
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> ProviderResult<()> {
        self.check_tools()?;
        let _guard = self.exec_lock.lock().await;

        let encoded = BASE64.encode(content);
        let mut script = match path.trim_end_matches('/').rfind('/') {
            Some(idx) if idx > 0 => format!("mkdir -p {} && : > {}", quote(&path[..idx]), quote(path)),
            _ => format!(": > {}", quote(path)),
        };
        let mut chunks = encoded.as_bytes().chunks(UPLOAD_CHUNK).peekable();
        if chunks.peek().is_none() {
            return self.finish_upload(path, &script).await;
        }
        for chunk in chunks {
            // Base64 is ASCII, so every chunk is valid UTF-8.
            let text = String::from_utf8_lossy(chunk);
            script.push_str(&format!(
                " && printf '%s' {} | base64 -d >> {}",
                quote(&text),
                quote(path)
            ));
            self.finish_upload(path, &script).await?;
            script = ":".to_string();
        }
        Ok(())
    }

    async fn download_file(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        self.check_tools()?;
        let _guard = self.exec_lock.lock().await;

        let p = quote(path);
        let script = format!(
            "if [ -f {p} ]; then base64 < {p}; else exit {MISSING_FILE_EXIT}; fi"
        );
        let (exit_code, stdout, stderr) = self.run_script(&script).await?;
        match exit_code {
            Some(0) => {
                let text: String = stdout.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = BASE64.decode(text.as_bytes()).map_err(|e| {
                    ProviderError::Other(anyhow::anyhow!("Corrupt transfer of {}: {}", path, e))
                })?;
                Ok(Some(bytes))
            }
            Some(MISSING_FILE_EXIT) => Ok(None),
            code => Err(ProviderError::Execution {
                message: format!("Failed to read {}", path),
                exit_code: code,
                stderr,
            }),
        }
    }
}

impl NativeExec {
    async fn finish_upload(&self, path: &str, script: &str) -> ProviderResult<()> {
        let (exit_code, _, stderr) = self.run_script(script).await?;
        match exit_code {
            Some(0) => Ok(()),
            code => Err(ProviderError::Execution {
                message: format!("Failed to write {}", path),
                exit_code: code,
                stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_bridge() -> NativeExec {
        // `sh -c "sh -c '<script>'"` stands in for a provider CLI.
        NativeExec::new("test bridge", "sh", vec!["-c".to_string()])
    }

    #[tokio::test]
    async fn test_missing_helper_tool_is_reported() {
        let exec = shell_bridge().requires("tasklift-missing-plugin");
        let err = exec
            .exec(&ExecRequest::new("true", Duration::from_secs(5)), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProviderError::ToolNotInstalled { ref tool, .. } if tool == "tasklift-missing-plugin")
        );
    }

    #[tokio::test]
    async fn test_exec_through_bridge() {
        let exec = shell_bridge();
        let outcome = exec
            .exec(&ExecRequest::new("echo hi; exit 2", Duration::from_secs(10)), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_base64_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin").display().to_string();
        let exec = shell_bridge();

        let content: Vec<u8> = (0..=255u8).cycle().take(40_000).collect();
        exec.upload_file(&path, &content).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content);

        let downloaded = exec.download_file(&path).await.unwrap();
        assert_eq!(downloaded, Some(content));

        let missing = dir.path().join("missing.txt").display().to_string();
        assert_eq!(exec.download_file(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_upload_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt").display().to_string();
        shell_bridge().upload_file(&path, b"").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), Vec::<u8>::new());
    }
}
