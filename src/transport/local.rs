//! Local process transport.
//!
//! Commands run under the configured shell with the session's workspace as
//! the working directory. Relative file paths resolve against the workspace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::{
    ExecOutcome, ExecRequest, RemoteExec, command_line, kill_group_command, run_interactive,
    run_wrapped, wrap_command,
};
use crate::provider::{OutputCallback, ProviderResult};

pub struct LocalExec {
    workspace: PathBuf,
    shell: String,
    env: Vec<(String, String)>,
    exec_lock: Mutex<()>,
}

impl LocalExec {
    pub fn new(workspace: PathBuf, shell: impl Into<String>, env: Vec<(String, String)>) -> Self {
        Self {
            workspace,
            shell: shell.into(),
            env,
            exec_lock: Mutex::new(()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }

    fn shell_command(&self, script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(&self.workspace)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    async fn kill_group(&self, pgid: i32) {
        let status = self
            .shell_command(&kill_group_command(pgid))
            .stdin(std::process::Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            warn!("Failed to signal process group {}: {}", pgid, e);
        }
    }
}

#[async_trait]
impl RemoteExec for LocalExec {
    fn describe(&self) -> String {
        format!("local {}", self.workspace.display())
    }

    async fn exec(
        &self,
        request: &ExecRequest,
        sink: Option<&OutputCallback>,
    ) -> ProviderResult<ExecOutcome> {
        let _guard = self.exec_lock.lock().await;

        if request.interactive {
            let cmd = self.shell_command(&command_line(request)?);
            return run_interactive(cmd, &self.shell, request.timeout).await;
        }

        let cmd = self.shell_command(&wrap_command(request)?);
        let run = run_wrapped(cmd, &self.shell, request.timeout, sink, &[], |pgid| {
            self.kill_group(pgid)
        })
        .await?;
        Ok(run.outcome)
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> ProviderResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
