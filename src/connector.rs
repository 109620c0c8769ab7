//! Connector trait for provider control-plane calls.
//!
//! Cloud drivers never link a cloud SDK. They run the provider's own CLI
//! (`aws`, `gh`) and parse its JSON output, which keeps credential handling
//! identical to what an operator has on their shell.
//!
//! # Protocol
//!
//! A connector runs one [`CliCommand`] to completion and returns its exit
//! code and captured output:
//!
//! ```text
//! aws ecs describe-services --cluster agents --services svc --output json
//! ```
//!
//! A non-zero exit is not an error at this layer. Drivers decide, usually via
//! [`classify_cli_failure`], what a failure means for them.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::provider::{ProviderError, ProviderResult};

/// One invocation of a provider CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CliCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// The command line as it would appear in a shell, for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Result from a connector execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Parses stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ProviderResult<T> {
        serde_json::from_str(self.stdout.trim()).map_err(|e| {
            ProviderError::Other(anyhow::anyhow!(
                "Unexpected CLI output ({}): {}",
                e,
                truncate(&self.stdout, 200)
            ))
        })
    }
}

/// Runs provider CLI commands.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn run(&self, command: &CliCommand) -> ProviderResult<CliOutput>;
}

/// A connector that spawns real processes.
pub struct ProcessConnector {
    timeout: Duration,
}

impl ProcessConnector {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProcessConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn run(&self, command: &CliCommand) -> ProviderResult<CliOutput> {
        debug!("Running: {}", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| spawn_error(&command.program, e))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ProviderError::Connection(format!(
                    "`{}` did not finish within {}s",
                    command.program,
                    self.timeout.as_secs()
                ))
            })??;

        let result = CliOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success() {
            debug!(
                "`{}` exited with {}: {}",
                command.program,
                result.exit_code,
                truncate(result.stderr.trim(), 300)
            );
        }
        Ok(result)
    }
}

/// Maps a failure to spawn a helper program to the right error.
pub fn spawn_error(program: &str, e: std::io::Error) -> ProviderError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProviderError::ToolNotInstalled {
            tool: program.to_string(),
            hint: install_hint(program).to_string(),
        }
    } else {
        ProviderError::Io(e)
    }
}

/// Where to get a helper program the transports rely on.
pub fn install_hint(program: &str) -> &'static str {
    match program {
        "aws" => "install the AWS CLI v2: https://aws.amazon.com/cli/",
        "gh" => "install the GitHub CLI: https://cli.github.com/",
        "session-manager-plugin" => {
            "install the Session Manager plugin for the AWS CLI: \
             https://docs.aws.amazon.com/systems-manager/latest/userguide/session-manager-working-with-install-plugin.html"
        }
        "ssh" => "install an OpenSSH client",
        "docker" => "install Docker and start the daemon",
        _ => "make sure it is installed and on PATH",
    }
}

/// Turns a failed CLI call into the matching [`ProviderError`].
///
/// `action` names what was being attempted, for the error message.
pub fn classify_cli_failure(action: &str, output: &CliOutput) -> ProviderError {
    let stderr = output.stderr.trim();
    let message = format!("{}: {}", action, first_line(stderr));

    let denied_markers = [
        "AccessDenied",
        "UnauthorizedOperation",
        "UnauthorizedException",
        "LimitExceeded",
        "InsufficientInstanceCapacity",
        "VcpuLimitExceeded",
        "HTTP 403",
    ];
    let throttled_markers = [
        "Throttling",
        "ThrottlingException",
        "RequestLimitExceeded",
        "TooManyRequests",
        "rate limit",
        "HTTP 429",
    ];
    let setup_markers = [
        "Unable to locate credentials",
        "ExpiredToken",
        "InvalidClientTokenId",
        "not logged in",
        "gh auth login",
        "ClusterNotFoundException",
    ];
    let not_found_markers = [
        "NotFound",
        "not found",
        "MISSING",
        "does not exist",
        "HTTP 404",
    ];
    let connection_markers = [
        "Could not connect to the endpoint URL",
        "Connection reset",
        "Connection refused",
        "connection timed out",
        "EndpointConnectionError",
    ];

    if throttled_markers.iter().any(|m| stderr.contains(m)) {
        ProviderError::Throttled(message)
    } else if denied_markers.iter().any(|m| stderr.contains(m)) {
        ProviderError::Denied(message)
    } else if setup_markers.iter().any(|m| stderr.contains(m)) {
        ProviderError::SetupRequired {
            message,
            remediation: setup_remediation(stderr).to_string(),
        }
    } else if not_found_markers.iter().any(|m| stderr.contains(m)) {
        ProviderError::NotFound(message)
    } else if connection_markers.iter().any(|m| stderr.contains(m)) {
        ProviderError::Connection(message)
    } else {
        warn!("Unclassified CLI failure ({}): {}", output.exit_code, stderr);
        ProviderError::Execution {
            message,
            exit_code: Some(output.exit_code),
            stderr: stderr.to_string(),
        }
    }
}

fn setup_remediation(stderr: &str) -> &'static str {
    if stderr.contains("ClusterNotFoundException") {
        "create the ECS cluster named in the config, or fix `cluster`"
    } else if stderr.contains("gh auth") || stderr.contains("not logged in") {
        "run `gh auth login -s codespace` or set GH_TOKEN"
    } else {
        "configure AWS credentials (`aws configure`, AWS_PROFILE, or an instance role)"
    }
}

fn first_line(s: &str) -> &str {
    s.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_classify_markers() {
        let denied = fail(254, "An error occurred (UnauthorizedOperation) when calling RunInstances");
        assert!(matches!(
            classify_cli_failure("run-instances", &denied),
            ProviderError::Denied(_)
        ));

        let quota = fail(254, "An error occurred (VcpuLimitExceeded) when calling RunInstances");
        assert!(matches!(
            classify_cli_failure("run-instances", &quota),
            ProviderError::Denied(_)
        ));

        let throttled = fail(254, "An error occurred (RequestLimitExceeded): Request limit exceeded.");
        let err = classify_cli_failure("describe-instances", &throttled);
        assert!(matches!(err, ProviderError::Throttled(_)));
        assert!(err.is_retryable());

        let missing = fail(254, "An error occurred (InvalidInstanceID.NotFound)");
        assert!(classify_cli_failure("terminate", &missing).is_not_found());

        let creds = fail(253, "Unable to locate credentials. You can configure credentials by running \"aws configure\".");
        assert!(matches!(
            classify_cli_failure("sts", &creds),
            ProviderError::SetupRequired { .. }
        ));

        let other = fail(1, "something odd");
        assert!(matches!(
            classify_cli_failure("x", &other),
            ProviderError::Execution { exit_code: Some(1), .. }
        ));
    }

    #[test]
    fn test_cli_output_json() {
        let out = ok("{\"a\": 1}\n");
        let v: serde_json::Value = out.json().unwrap();
        assert_eq!(v["a"], 1);
        assert!(ok("not json").json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_command_display_quotes() {
        let cmd = CliCommand::new("aws").args(["ecs", "run-task"]).arg("a b");
        assert_eq!(cmd.display(), "aws ecs run-task 'a b'");
    }

    #[tokio::test]
    async fn test_process_connector_missing_tool() {
        let err = ProcessConnector::new()
            .run(&CliCommand::new("tasklift-definitely-missing-tool"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ToolNotInstalled { .. }));
    }

    #[tokio::test]
    async fn test_process_connector_captures_output() {
        let out = ProcessConnector::new()
            .run(&CliCommand::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_scripted_connector_queues_and_repeats() {
        let connector = ScriptedConnector::new();
        connector
            .on(&["describe"], ok("first"))
            .on(&["describe"], ok("second"));

        let cmd = CliCommand::new("aws").arg("describe");
        assert_eq!(connector.run(&cmd).await.unwrap().stdout, "first");
        assert_eq!(connector.run(&cmd).await.unwrap().stdout, "second");
        assert_eq!(connector.run(&cmd).await.unwrap().stdout, "second");
        assert_eq!(connector.calls_matching(&["describe"]), 3);

        let unscripted = connector.run(&CliCommand::new("aws").arg("other")).await.unwrap();
        assert!(!unscripted.success());
    }
}
