//! The compute provider facade and the types it exchanges with callers.
//!
//! Every backend implements [`ComputeProvider`]. Callers (a task runner, the
//! CLI, a web backend) only ever see this trait and the [`Provider`] enum that
//! selects one implementation from configuration at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ComputeProvider                         │
//! │  create_session() / execute_command() / terminate_session()   │
//! └───────────────┬───────────────────────────────┬──────────────┘
//!                 │ 1:1                            │ shared
//!                 ▼                                ▼
//!     DedicatedSessions<Driver>               EcsProvider
//!                 │                                │
//!                 ▼                                ▼
//!        EnvironmentDriver              ServiceRegistry + task units
//!     (ec2, codespaces, docker, local)             │
//!                 │                                │
//!                 └───────────┬────────────────────┘
//!                             ▼
//!                        RemoteExec
//!              (ssh, provider-native exec, local)
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Multiplicity | Transport |
//! |----------|--------|--------------|-----------|
//! | EC2 | [`ec2`] | 1:1 | SSH |
//! | ECS | [`ecs`] | many sessions per service | `aws ecs execute-command` |
//! | Codespaces | [`codespaces`] | 1:1 | `gh codespace ssh` |
//! | Docker | [`docker`] | 1:1 | Docker exec API |
//! | Local | [`local`] | 1:1 | local processes |
//!
//! # Error Handling
//!
//! Provider operations return [`ProviderResult<T>`]. The one exception is
//! [`ComputeProvider::execute_command`], which always returns a
//! [`TaskResult`]: a failing command must never take down the process that
//! serves other sessions.

pub mod aws;
pub mod codespaces;
pub mod docker;
pub mod ec2;
pub mod ecs;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ProviderConfig, ValidationResult};
use crate::connector::{Connector, ProcessConnector};
use crate::credentials::{Credentials, KeyMaterial};
use crate::events::EventSink;
use crate::multiplexer::DedicatedSessions;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// Errors are categorized so callers can pick a remediation:
/// - **Needs a human**: `Configuration`, `SetupRequired`, `Denied`,
///   `ToolNotInstalled` are never retried automatically
/// - **Retryable while polling**: `Connection`, `Throttled`, `Io`
/// - **Definitive**: `TerminalState`, `ReadinessTimeout`, `Provisioning`
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Invalid or missing configuration, detected before any I/O.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Credentials work but shared infrastructure (cluster, key pair, task
    /// definition, login) is missing.
    #[error("Setup required: {message}")]
    SetupRequired { message: String, remediation: String },

    /// The one-shot create/run call failed.
    #[error("Failed to provision {resource}: {message}")]
    Provisioning { resource: String, message: String },

    /// The provider refused the call for quota or permission reasons.
    #[error("Request denied by provider: {0}")]
    Denied(String),

    /// Polling used up its attempt budget.
    #[error("Timed out waiting for {what} after {attempts} attempts")]
    ReadinessTimeout { what: String, attempts: u32 },

    /// The provider reported a definitive failure while we were polling.
    #[error("{what} entered terminal state '{state}'")]
    TerminalState { what: String, state: String },

    /// A remote command failed or its transport broke.
    #[error("Command failed: {message}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The referenced session or environment no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A local helper program the transport depends on is missing.
    #[error("`{tool}` is not installed ({hint})")]
    ToolNotInstalled { tool: String, hint: String },

    /// Failed to reach the provider or the remote host.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The provider rate limited the request.
    #[error("Throttled by provider: {0}")]
    Throttled(String),

    /// The caller cancelled a wait.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// The user-visible class of a failure.
///
/// Every [`ProviderError`] maps to exactly one class, and each class maps to
/// one actionable message in the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadConfig,
    NeedsSetup,
    QuotaOrPermissions,
    ProvisioningFailed,
    TimedOut,
    CommandFailed,
    NotFound,
    Transient,
}

impl ProviderError {
    /// Whether a poll tick that failed with this error should keep polling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_) | ProviderError::Throttled(_) | ProviderError::Io(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Configuration(_) => ErrorClass::BadConfig,
            ProviderError::SetupRequired { .. } | ProviderError::ToolNotInstalled { .. } => {
                ErrorClass::NeedsSetup
            }
            ProviderError::Denied(_) => ErrorClass::QuotaOrPermissions,
            ProviderError::Provisioning { .. } | ProviderError::TerminalState { .. } => {
                ErrorClass::ProvisioningFailed
            }
            ProviderError::ReadinessTimeout { .. } | ProviderError::Cancelled(_) => {
                ErrorClass::TimedOut
            }
            ProviderError::Execution { .. } => ErrorClass::CommandFailed,
            ProviderError::NotFound(_) => ErrorClass::NotFound,
            ProviderError::Connection(_)
            | ProviderError::Throttled(_)
            | ProviderError::Io(_)
            | ProviderError::Other(_) => ErrorClass::Transient,
        }
    }

    /// Convenience constructor for a failed one-shot create call.
    pub fn provisioning(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        ProviderError::Provisioning {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Re-labels a generic failure of a create call as [`ProviderError::Provisioning`].
    ///
    /// Errors that already carry a more specific class (denied, setup,
    /// missing tool) are kept as they are.
    pub fn into_provisioning(self, resource: &str) -> Self {
        match self {
            ProviderError::Other(e) => ProviderError::provisioning(resource, e),
            ProviderError::Execution { message, .. } => ProviderError::provisioning(resource, message),
            ProviderError::NotFound(message) => ProviderError::provisioning(resource, message),
            other => other,
        }
    }
}

/// The closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ec2,
    Ecs,
    Codespaces,
    Docker,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ec2 => "ec2",
            ProviderKind::Ecs => "ecs",
            ProviderKind::Codespaces => "codespaces",
            ProviderKind::Docker => "docker",
            ProviderKind::Local => "local",
        }
    }

    /// Whether sessions of this kind share physical environments.
    pub fn is_shared(&self) -> bool {
        matches!(self, ProviderKind::Ecs)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static declaration of what a backend supports.
///
/// Callers use this to pick a provider or warn about unsupported features
/// before creating anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCapabilities {
    pub supports_spot_instances: bool,
    pub supports_persistent_storage: bool,
    pub supports_custom_images: bool,
    pub supports_docker_containers: bool,
    pub max_concurrent_tasks: u32,
    /// Longest supported session, `None` when the backend imposes no limit.
    pub max_task_duration: Option<Duration>,
}

impl ProviderCapabilities {
    pub fn for_kind(kind: ProviderKind) -> Self {
        const HOUR: u64 = 3600;
        match kind {
            ProviderKind::Ec2 => Self {
                supports_spot_instances: true,
                supports_persistent_storage: true,
                supports_custom_images: true,
                supports_docker_containers: true,
                max_concurrent_tasks: 20,
                max_task_duration: Some(Duration::from_secs(24 * HOUR)),
            },
            ProviderKind::Ecs => Self {
                supports_spot_instances: false,
                supports_persistent_storage: false,
                supports_custom_images: true,
                supports_docker_containers: true,
                max_concurrent_tasks: 100,
                max_task_duration: Some(Duration::from_secs(8 * HOUR)),
            },
            ProviderKind::Codespaces => Self {
                supports_spot_instances: false,
                supports_persistent_storage: true,
                supports_custom_images: false,
                supports_docker_containers: true,
                max_concurrent_tasks: 10,
                max_task_duration: Some(Duration::from_secs(4 * HOUR)),
            },
            ProviderKind::Docker => Self {
                supports_spot_instances: false,
                supports_persistent_storage: false,
                supports_custom_images: true,
                supports_docker_containers: true,
                max_concurrent_tasks: 8,
                max_task_duration: None,
            },
            ProviderKind::Local => Self {
                supports_spot_instances: false,
                supports_persistent_storage: false,
                supports_custom_images: false,
                supports_docker_containers: false,
                max_concurrent_tasks: 4,
                max_task_duration: None,
            },
        }
    }
}

/// Per-session overrides of the provider's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Instance type, codespace machine, or container CPU/memory preset.
    pub machine: Option<String>,
    /// AMI, container image, or task definition family.
    pub image: Option<String>,
    /// Task-level CPU units (ECS) or cores (Docker).
    pub cpu: Option<String>,
    /// Task-level memory in MiB (ECS) or bytes (Docker).
    pub memory: Option<String>,
    /// Request spot capacity where supported.
    pub spot: Option<bool>,
}

/// Options for [`ComputeProvider::create_session`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Caller-supplied task/session ID, stable across reconnects.
    pub task_id: String,
    pub user_id: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

impl SessionOptions {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn repository(mut self, url: impl Into<String>) -> Self {
        self.repository = Some(url.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// Status of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Terminated,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Well-known session metadata keys.
pub mod meta {
    pub const REPOSITORY: &str = "repository";
    pub const BRANCH: &str = "branch";
    pub const USER_ID: &str = "user_id";
    pub const SERVICE: &str = "service";
    pub const SERVICE_ARN: &str = "service_arn";
    pub const TASK: &str = "task";
    pub const CLUSTER: &str = "cluster";
}

/// A logical handle for one task's claim on compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub provider: ProviderKind,
    pub status: SessionStatus,
    /// The backing environment (instance ID, codespace name, service name).
    pub environment_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.meta(meta::USER_ID)
    }
}

/// A line of output from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Callback receiving output lines as they arrive.
pub type OutputCallback = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Options for [`ComputeProvider::execute_command`].
#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Overrides the configured command timeout.
    pub timeout: Option<Duration>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Hand the local terminal to the remote command instead of capturing.
    pub interactive: bool,
    pub on_output: Option<OutputCallback>,
}

impl ExecOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn on_output(mut self, callback: OutputCallback) -> Self {
        self.on_output = Some(callback);
        self
    }
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("timeout", &self.timeout)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("interactive", &self.interactive)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

/// Outcome of [`ComputeProvider::execute_command`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskResult {
    pub success: bool,
    /// Captured standard output.
    pub output: String,
    /// Captured standard error, whether or not the command succeeded.
    pub stderr: String,
    /// Why the command failed. Always `None` when `success` is true.
    pub error: Option<String>,
    /// `None` when the command never reported one (timeout, transport error).
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl TaskResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Files keyed by remote path.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// A single command invocation to run inside a session.
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
    pub id: String,
    pub command: String,
    /// Files staged before the command runs.
    pub files: FileMap,
    pub working_directory: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Record of a [`TaskDefinition`] that ran.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub id: String,
    pub environment_id: String,
    pub status: TaskStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
}

/// The uniform interface every backend satisfies.
///
/// # Concurrency
///
/// Calls for different session IDs may run fully in parallel. Calls for the
/// same session ID must be serialized by the caller: running
/// `execute_command` and `terminate_session` concurrently on one session is
/// not supported.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Static capabilities of this backend.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::for_kind(self.kind())
    }

    /// Pure validation of the provider's configuration.
    fn validate_config(&self) -> ValidationResult;

    /// Verifies credentials, permissions and shared infrastructure.
    ///
    /// May create shared templates on first run. Missing infrastructure is
    /// reported as [`ProviderError::SetupRequired`].
    async fn initialize(&self) -> ProviderResult<()>;

    /// Creates (or re-attaches to) the session for `opts.task_id`.
    async fn create_session(&self, opts: &SessionOptions) -> ProviderResult<Session>;

    /// Runs a command in the session and waits for it, bounded by the timeout.
    async fn execute_command(&self, session_id: &str, command: &str, opts: &ExecOptions)
    -> TaskResult;

    /// Fresh status of a session.
    async fn get_session_status(&self, session_id: &str) -> ProviderResult<Session>;

    /// Sessions known to this provider, optionally filtered by user.
    async fn list_sessions(&self, user_id: Option<&str>) -> ProviderResult<Vec<Session>>;

    /// Ends a session. Terminating an already-terminated session is a no-op.
    async fn terminate_session(&self, session_id: &str) -> ProviderResult<()>;

    /// Writes files into the session, best-effort per file.
    async fn upload_files(&self, session_id: &str, files: &FileMap) -> ProviderResult<()>;

    /// Reads files from the session. Missing files are omitted from the map.
    async fn download_results(&self, session_id: &str, paths: &[String])
    -> ProviderResult<FileMap>;

    /// Stages a task's files, then runs its command.
    async fn run_task(&self, session_id: &str, task: &TaskDefinition) -> TaskExecution {
        let start_time = chrono::Utc::now();
        let mut execution = TaskExecution {
            id: task.id.clone(),
            environment_id: String::new(),
            status: TaskStatus::Pending,
            start_time,
            end_time: None,
            exit_code: None,
            output: String::new(),
            error: None,
        };

        match self.get_session_status(session_id).await {
            Ok(session) if session.status == SessionStatus::Active => {
                execution.environment_id = session.environment_id;
            }
            Ok(session) => {
                execution.status = TaskStatus::Failed;
                execution.error = Some(format!("Session {} is {}", session_id, session.status));
                execution.end_time = Some(chrono::Utc::now());
                return execution;
            }
            Err(e) => {
                execution.status = TaskStatus::Failed;
                execution.error = Some(e.to_string());
                execution.end_time = Some(chrono::Utc::now());
                return execution;
            }
        }

        if !task.files.is_empty()
            && let Err(e) = self.upload_files(session_id, &task.files).await
        {
            execution.status = TaskStatus::Failed;
            execution.error = Some(format!("Failed to stage files: {}", e));
            execution.end_time = Some(chrono::Utc::now());
            return execution;
        }

        execution.status = TaskStatus::Running;
        let mut opts = ExecOptions {
            timeout: task.timeout,
            working_dir: task.working_directory.clone(),
            ..Default::default()
        };
        opts.env = task
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let result = self.execute_command(session_id, &task.command, &opts).await;

        execution.end_time = Some(chrono::Utc::now());
        execution.exit_code = result.exit_code;
        execution.output = result.output;
        execution.error = result.error;
        execution.status = if result.timed_out {
            TaskStatus::TimedOut
        } else if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        execution
    }
}

/// Everything a provider needs besides its configuration.
#[derive(Clone)]
pub struct ProviderContext {
    pub credentials: Credentials,
    pub events: EventSink,
    /// SSH key for VM-like targets. Loaded from `key_path` when absent.
    pub key_material: Option<KeyMaterial>,
    pub connector: Arc<dyn Connector>,
}

impl ProviderContext {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            events: EventSink::disabled(),
            key_material: None,
            connector: Arc::new(ProcessConnector::new()),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_key_material(mut self, key: KeyMaterial) -> Self {
        self.key_material = Some(key);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }
}

/// The provider selected from configuration.
///
/// Resolved once at startup; every call dispatches to exactly one backend.
pub enum Provider {
    Ec2(DedicatedSessions<ec2::Ec2Driver>),
    Ecs(ecs::EcsProvider),
    Codespaces(DedicatedSessions<codespaces::CodespacesDriver>),
    Docker(DedicatedSessions<docker::DockerDriver>),
    Local(DedicatedSessions<local::LocalDriver>),
}

impl Provider {
    /// Builds the provider named by `config.provider`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` if the configuration fails
    /// validation, or if the key file or Docker daemon cannot be reached.
    pub fn from_config(config: &Config, ctx: ProviderContext) -> ProviderResult<Self> {
        let validation = config.validate();
        if !validation.valid {
            return Err(ProviderError::Configuration(validation.errors.join("; ")));
        }

        let core = config.tasklift.clone();
        let provider = match &config.provider {
            ProviderConfig::Ec2(cfg) => {
                let key = match (&ctx.key_material, &cfg.key_path) {
                    (Some(key), _) => Some(key.clone()),
                    (None, Some(path)) => Some(
                        KeyMaterial::from_file(path, ctx.credentials.get("SSH_KEY_PASSPHRASE", None))
                            .map_err(|e| ProviderError::Configuration(format!("{:#}", e)))?,
                    ),
                    (None, None) => None,
                };
                let driver = ec2::Ec2Driver::new(cfg.clone(), &core, &ctx, key);
                Provider::Ec2(DedicatedSessions::new(driver, config.clone(), ctx.events))
            }
            ProviderConfig::Ecs(cfg) => Provider::Ecs(ecs::EcsProvider::new(cfg.clone(), core, &ctx)),
            ProviderConfig::Codespaces(cfg) => {
                let driver = codespaces::CodespacesDriver::new(cfg.clone(), &core, &ctx);
                Provider::Codespaces(DedicatedSessions::new(driver, config.clone(), ctx.events))
            }
            ProviderConfig::Docker(cfg) => {
                let driver = docker::DockerDriver::new(cfg.clone(), &core)?;
                Provider::Docker(DedicatedSessions::new(driver, config.clone(), ctx.events))
            }
            ProviderConfig::Local(cfg) => {
                let driver = local::LocalDriver::new(cfg.clone(), &core);
                Provider::Local(DedicatedSessions::new(driver, config.clone(), ctx.events))
            }
        };
        Ok(provider)
    }

    fn inner(&self) -> &dyn ComputeProvider {
        match self {
            Provider::Ec2(p) => p,
            Provider::Ecs(p) => p,
            Provider::Codespaces(p) => p,
            Provider::Docker(p) => p,
            Provider::Local(p) => p,
        }
    }
}

#[async_trait]
impl ComputeProvider for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner().capabilities()
    }

    fn validate_config(&self) -> ValidationResult {
        self.inner().validate_config()
    }

    async fn initialize(&self) -> ProviderResult<()> {
        self.inner().initialize().await
    }

    async fn create_session(&self, opts: &SessionOptions) -> ProviderResult<Session> {
        self.inner().create_session(opts).await
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> TaskResult {
        self.inner().execute_command(session_id, command, opts).await
    }

    async fn get_session_status(&self, session_id: &str) -> ProviderResult<Session> {
        self.inner().get_session_status(session_id).await
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> ProviderResult<Vec<Session>> {
        self.inner().list_sessions(user_id).await
    }

    async fn terminate_session(&self, session_id: &str) -> ProviderResult<()> {
        self.inner().terminate_session(session_id).await
    }

    async fn upload_files(&self, session_id: &str, files: &FileMap) -> ProviderResult<()> {
        self.inner().upload_files(session_id, files).await
    }

    async fn download_results(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> ProviderResult<FileMap> {
        self.inner().download_results(session_id, paths).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_distinct_for_timeout_and_terminal() {
        let timeout = ProviderError::ReadinessTimeout {
            what: "instance".to_string(),
            attempts: 3,
        };
        let terminal = ProviderError::TerminalState {
            what: "instance".to_string(),
            state: "Failed".to_string(),
        };
        assert_eq!(timeout.class(), ErrorClass::TimedOut);
        assert_eq!(terminal.class(), ErrorClass::ProvisioningFailed);
        assert_eq!(
            ProviderError::provisioning("instance", "InsufficientInstanceCapacity").class(),
            ErrorClass::ProvisioningFailed
        );
        assert_eq!(
            ProviderError::Execution {
                message: "exit 1".into(),
                exit_code: Some(1),
                stderr: String::new(),
            }
            .class(),
            ErrorClass::CommandFailed
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProviderError::Throttled("slow down".into()).is_retryable());
        assert!(ProviderError::Connection("reset".into()).is_retryable());
        assert!(!ProviderError::Configuration("bad".into()).is_retryable());
        assert!(
            !ProviderError::SetupRequired {
                message: "no cluster".into(),
                remediation: "create it".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_into_provisioning_keeps_specific_classes() {
        let denied = ProviderError::Denied("quota".into()).into_provisioning("instance");
        assert!(matches!(denied, ProviderError::Denied(_)));

        let generic =
            ProviderError::Other(anyhow::anyhow!("boom")).into_provisioning("instance");
        assert!(matches!(generic, ProviderError::Provisioning { .. }));
    }

    #[test]
    fn test_capabilities_are_static_per_kind() {
        let ec2 = ProviderCapabilities::for_kind(ProviderKind::Ec2);
        assert!(ec2.supports_spot_instances);
        let ecs = ProviderCapabilities::for_kind(ProviderKind::Ecs);
        assert!(!ecs.supports_spot_instances);
        assert!(ecs.max_concurrent_tasks > ec2.max_concurrent_tasks);
        assert!(ProviderKind::Ecs.is_shared());
        assert!(!ProviderKind::Codespaces.is_shared());
    }

    #[test]
    fn test_session_options_builder() {
        let opts = SessionOptions::new("t1")
            .user("u1")
            .repository("https://github.com/acme/app.git")
            .branch("main");
        assert_eq!(opts.task_id, "t1");
        assert_eq!(opts.user_id.as_deref(), Some("u1"));
        assert_eq!(opts.branch.as_deref(), Some("main"));
    }
}
