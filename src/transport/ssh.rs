//! SSH transport over the system `ssh` binary.
//!
//! One OpenSSH ControlMaster connection is kept per environment, so
//! sequential commands reuse the same TCP session instead of paying a full
//! handshake each time. Commands on one transport are serialized; the kill
//! issued on timeout uses a separate multiplexed channel and does not wait.
//!
//! Commands are executed as:
//! ```sh
//! ssh [options] user@host "<process-group wrapper around: export K=V; cd dir && command>"
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    ExecOutcome, ExecRequest, MISSING_FILE_EXIT, RemoteExec, command_line, download_script,
    kill_group_command, run_interactive, run_wrapped, upload_script, wrap_command,
};
use crate::connector::spawn_error;
use crate::credentials::{KeyMaterial, MaterializedKey};
use crate::provider::{OutputCallback, ProviderError, ProviderResult};

/// `ssh` exits with this status when it could not reach the host.
const SSH_CONNECTION_FAILURE: i32 = 255;

const FILE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

pub struct SshTransport {
    target: SshTarget,
    key: Option<MaterializedKey>,
    batch_mode: bool,
    control_dir: TempDir,
    exec_lock: Mutex<()>,
}

impl SshTransport {
    /// Prepares a transport. Nothing connects until the first command.
    ///
    /// The key, if any, is written to a private temp file owned by the
    /// transport and removed when it is dropped.
    pub fn new(target: SshTarget, key: Option<&KeyMaterial>) -> ProviderResult<Self> {
        let key = key.map(KeyMaterial::materialize).transpose()?;
        let batch_mode = key
            .as_ref()
            .is_none_or(|k| k.askpass_env().is_empty());
        let control_dir = tempfile::Builder::new()
            .prefix("tl-ssh-")
            .tempdir()
            .map_err(ProviderError::Io)?;

        Ok(Self {
            target,
            key,
            batch_mode,
            control_dir,
            exec_lock: Mutex::new(()),
        })
    }

    fn control_path(&self) -> String {
        self.control_dir.path().join("cm").display().to_string()
    }

    /// Options shared by every invocation.
    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("BatchMode={}", if self.batch_mode { "yes" } else { "no" }),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            // Fresh VMs present a host key nobody has seen yet.
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path()),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.key_path().display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args
    }

    fn ssh_command(&self, remote: &str, tty: bool) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(self.ssh_args());
        if tty {
            cmd.arg("-t");
        }
        if let Some(key) = &self.key {
            cmd.envs(key.askpass_env());
        }
        cmd.arg(self.target.destination()).arg(remote);
        cmd
    }

    async fn kill_group(&self, pgid: i32) {
        debug!("Killing remote process group {} on {}", pgid, self.target.host);
        let mut cmd = self.ssh_command(&kill_group_command(pgid), false);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(Duration::from_secs(30), cmd.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to signal remote process group {}: {}", pgid, e),
            Err(_) => warn!("Timed out signalling remote process group {}", pgid),
        }
    }

    fn connection_error(&self, stderr: &str) -> ProviderError {
        ProviderError::Connection(format!(
            "ssh to {} failed: {}",
            self.target.destination(),
            stderr.trim()
        ))
    }
}

#[async_trait]
impl RemoteExec for SshTransport {
    fn describe(&self) -> String {
        format!("ssh {}", self.target.destination())
    }

    async fn exec(
        &self,
        request: &ExecRequest,
        sink: Option<&OutputCallback>,
    ) -> ProviderResult<ExecOutcome> {
        let _guard = self.exec_lock.lock().await;

        if request.interactive {
            let cmd = self.ssh_command(&command_line(request)?, true);
            return run_interactive(cmd, "ssh", request.timeout).await;
        }

        let cmd = self.ssh_command(&wrap_command(request)?, false);
        let run = run_wrapped(cmd, "ssh", request.timeout, sink, &[], |pgid| {
            self.kill_group(pgid)
        })
        .await?;

        if !run.exit_reported && run.outcome.exit_code == Some(SSH_CONNECTION_FAILURE) {
            return Err(self.connection_error(&run.outcome.stderr));
        }
        Ok(run.outcome)
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> ProviderResult<()> {
        let _guard = self.exec_lock.lock().await;

        let mut cmd = self.ssh_command(&upload_script(path), false);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| spawn_error("ssh", e))?;

        let transfer = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(content).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(FILE_TRANSFER_TIMEOUT, transfer)
            .await
            .map_err(|_| self.connection_error("upload timed out"))??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => Ok(()),
            Some(SSH_CONNECTION_FAILURE) => Err(self.connection_error(&stderr)),
            code => Err(ProviderError::Execution {
                message: format!("Failed to write {}", path),
                exit_code: code,
                stderr: stderr.to_string(),
            }),
        }
    }

    async fn download_file(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        let _guard = self.exec_lock.lock().await;

        let mut cmd = self.ssh_command(&download_script(path), false);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::time::timeout(FILE_TRANSFER_TIMEOUT, cmd.output())
            .await
            .map_err(|_| self.connection_error("download timed out"))?
            .map_err(|e| spawn_error("ssh", e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_FILE_EXIT) => Ok(None),
            Some(SSH_CONNECTION_FAILURE) => Err(self.connection_error(&stderr)),
            code => Err(ProviderError::Execution {
                message: format!("Failed to read {}", path),
                exit_code: code,
                stderr: stderr.to_string(),
            }),
        }
    }

    async fn close(&self) {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(self.ssh_args())
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // No master running is fine.
        let _ = tokio::time::timeout(Duration::from_secs(10), cmd.status()).await;
    }
}
