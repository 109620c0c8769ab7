//! Configuration schema definitions for tasklift.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and a
//! tagged enum for provider selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── CoreConfig             - Polling, grace and timeout tunables
//! └── ProviderConfig         - Tagged enum selecting the backend
//!     ├── Ec2                - One VM per session, SSH transport
//!     ├── Ecs                - Shared per-repository service, one task per session
//!     ├── Codespaces         - One codespace per session
//!     ├── Docker             - One local container per session
//!     └── Local              - One workspace directory per session
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;
use crate::readiness::PollPolicy;

/// Root configuration structure for tasklift.
///
/// # TOML Structure
///
/// ```toml
/// [tasklift]
/// poll_interval_secs = 5
/// max_poll_attempts = 60
///
/// [provider]
/// type = "ecs"
/// region = "us-east-1"
/// cluster = "agents"
/// task_definition = "agent-runner"
/// subnets = ["subnet-0abc"]
/// ```
///
/// # Example
///
/// ```
/// use tasklift::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [provider]
///     type = "local"
/// "#).unwrap();
/// assert_eq!(config.tasklift.max_poll_attempts, 60);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings shared by every provider.
    #[serde(default)]
    pub tasklift: CoreConfig,

    /// Provider configuration determining where sessions run.
    pub provider: ProviderConfig,
}

/// Core tasklift settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `poll_interval_secs` | 5 |
/// | `max_poll_attempts` | 60 |
/// | `poll_jitter` | 0.0 |
/// | `ssh_grace_secs` | 30 |
/// | `command_timeout_secs` | 1800 (30 minutes) |
/// | `project_tag` | `tasklift` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Seconds between readiness polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Polls before giving up on an environment or task becoming ready.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Random extra delay per poll, as a fraction of the interval.
    ///
    /// Spreads out polling when many sessions start at once.
    #[serde(default)]
    pub poll_jitter: f64,

    /// Extra wait after a VM reports running, for sshd to come up.
    #[serde(default = "default_ssh_grace")]
    pub ssh_grace_secs: u64,

    /// Default timeout for `execute_command` when the caller sets none.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Value of the `tasklift:project` tag put on every created resource.
    ///
    /// Listing only returns resources carrying this tag.
    #[serde(default = "default_project_tag")]
    pub project_tag: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_jitter: 0.0,
            ssh_grace_secs: default_ssh_grace(),
            command_timeout_secs: default_command_timeout(),
            project_tag: default_project_tag(),
        }
    }
}

impl CoreConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.max_poll_attempts,
            jitter: self.poll_jitter,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ssh_grace(&self) -> Duration {
        Duration::from_secs(self.ssh_grace_secs)
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_poll_attempts() -> u32 {
    60
}

fn default_ssh_grace() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_project_tag() -> String {
    "tasklift".to_string()
}

/// Provider configuration specifying where sessions run.
///
/// # Provider Types
///
/// | Type | Description | Multiplicity |
/// |------|-------------|--------------|
/// | `ec2` | One EC2 instance per session | 1:1 |
/// | `ecs` | Per-repository ECS service, one task per session | shared |
/// | `codespaces` | One GitHub codespace per session | 1:1 |
/// | `docker` | One local container per session | 1:1 |
/// | `local` | One workspace directory per session | 1:1 |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Ec2(Ec2ProviderConfig),
    Ecs(EcsProviderConfig),
    Codespaces(CodespacesProviderConfig),
    Docker(DockerProviderConfig),
    Local(LocalProviderConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Ec2(_) => ProviderKind::Ec2,
            ProviderConfig::Ecs(_) => ProviderKind::Ecs,
            ProviderConfig::Codespaces(_) => ProviderKind::Codespaces,
            ProviderConfig::Docker(_) => ProviderKind::Docker,
            ProviderConfig::Local(_) => ProviderKind::Local,
        }
    }

    /// Command run once in a fresh environment, before the session is handed out.
    pub fn bootstrap_command(&self) -> Option<&str> {
        match self {
            ProviderConfig::Ec2(c) => c.bootstrap_command.as_deref(),
            ProviderConfig::Ecs(c) => c.bootstrap_command.as_deref(),
            ProviderConfig::Codespaces(c) => c.bootstrap_command.as_deref(),
            ProviderConfig::Docker(c) => c.bootstrap_command.as_deref(),
            ProviderConfig::Local(c) => c.bootstrap_command.as_deref(),
        }
    }

    /// Environment variables applied to every command.
    pub fn env(&self) -> &HashMap<String, String> {
        match self {
            ProviderConfig::Ec2(c) => &c.env,
            ProviderConfig::Ecs(c) => &c.env,
            ProviderConfig::Codespaces(c) => &c.env,
            ProviderConfig::Docker(c) => &c.env,
            ProviderConfig::Local(c) => &c.env,
        }
    }
}

/// Configuration for the EC2 provider.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "ec2"
/// region = "us-west-2"
/// instance_type = "m5.large"
/// key_name = "agents"
/// key_path = "~/.ssh/agents.pem"
/// security_group_ids = ["sg-0123"]
/// subnet_id = "subnet-0456"
/// use_spot = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ec2ProviderConfig {
    #[serde(default)]
    pub region: String,

    /// Default: `t3.medium`
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// AMI ID. When unset the AMI is resolved from `ami_parameter`.
    pub ami: Option<String>,

    /// SSM public parameter holding the current AMI ID.
    #[serde(default = "default_ami_parameter")]
    pub ami_parameter: String,

    /// EC2 key pair name registered in the account.
    #[serde(default)]
    pub key_name: String,

    /// Local private key for `key_name`. `~` is expanded.
    pub key_path: Option<String>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    pub subnet_id: Option<String>,

    pub iam_instance_profile: Option<String>,

    /// Request spot capacity.
    #[serde(default)]
    pub use_spot: bool,

    /// Maximum hourly spot price. Defaults to the on-demand price.
    pub spot_max_price: Option<String>,

    /// Root volume size in GiB.
    #[serde(default = "default_volume_size")]
    pub volume_size_gb: u32,

    /// Default: `ubuntu`
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Cloud-init user data passed to the instance.
    pub user_data: Option<String>,

    pub bootstrap_command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_instance_type() -> String {
    "t3.medium".to_string()
}

fn default_ami_parameter() -> String {
    "/aws/service/canonical/ubuntu/server/22.04/stable/current/amd64/hvm/ebs-gp2/ami-id".to_string()
}

fn default_volume_size() -> u32 {
    30
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Configuration for the shared ECS provider.
///
/// Sessions for the same repository share one ECS service. Each session gets
/// its own task inside that service's network configuration.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "ecs"
/// region = "us-east-1"
/// cluster = "agents"
/// task_definition = "agent-runner"
/// subnets = ["subnet-0abc", "subnet-0def"]
/// security_groups = ["sg-0123"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EcsProviderConfig {
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub cluster: String,

    /// Task definition family (optionally `family:revision`).
    #[serde(default)]
    pub task_definition: String,

    /// Container inside the task definition that commands run in.
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// `FARGATE`, `EC2` or `EXTERNAL`. Default: `FARGATE`
    #[serde(default = "default_launch_type")]
    pub launch_type: String,

    #[serde(default)]
    pub subnets: Vec<String>,

    #[serde(default)]
    pub security_groups: Vec<String>,

    #[serde(default = "default_true")]
    pub assign_public_ip: bool,

    /// Prefix for per-repository service names.
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,

    /// Register `task_definition` from `image` when it does not exist yet.
    #[serde(default)]
    pub register_task_definition: bool,

    /// Container image used when registering the task definition.
    pub image: Option<String>,

    /// Task-level CPU units. Default: `1024`
    #[serde(default = "default_task_cpu")]
    pub cpu: String,

    /// Task-level memory in MiB. Default: `2048`
    #[serde(default = "default_task_memory")]
    pub memory: String,

    pub execution_role_arn: Option<String>,

    pub task_role_arn: Option<String>,

    pub bootstrap_command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_container_name() -> String {
    "agent".to_string()
}

fn default_launch_type() -> String {
    "FARGATE".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_prefix() -> String {
    "tasklift".to_string()
}

fn default_task_cpu() -> String {
    "1024".to_string()
}

fn default_task_memory() -> String {
    "2048".to_string()
}

/// Configuration for the GitHub Codespaces provider.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "codespaces"
/// repository = "acme/app"
/// machine = "standardLinux32gb"
/// idle_timeout_minutes = 30
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodespacesProviderConfig {
    /// Repository used when a session names none.
    pub repository: Option<String>,

    /// Default: `basicLinux32gb`
    #[serde(default = "default_machine")]
    pub machine: String,

    /// Default: 30
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u32,

    /// `EastUs`, `WestUs2`, `WestEurope` or `SouthEastAsia`.
    pub location: Option<String>,

    pub devcontainer_path: Option<String>,

    /// Working directory for commands. Default: `/workspaces/<repo>`.
    pub working_dir: Option<String>,

    pub bootstrap_command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_machine() -> String {
    "basicLinux32gb".to_string()
}

fn default_idle_timeout() -> u32 {
    30
}

/// Configuration for the Docker container provider.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "docker"
/// image = "ubuntu:24.04"
/// working_dir = "/workspace"
///
/// [provider.resources]
/// cpu_limit = 2.0
/// memory_limit = 2147483648  # 2GB
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerProviderConfig {
    #[serde(default)]
    pub image: String,

    /// Volume mounts in `host:container[:options]` format.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Default: `bridge`
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Docker daemon URL. Uses the local socket when unset.
    pub docker_host: Option<String>,

    #[serde(default)]
    pub resources: DockerResourceConfig,

    pub bootstrap_command: Option<String>,
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

/// Resource limits for Docker containers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerResourceConfig {
    /// CPU core limit (e.g., 2.0 for 2 CPU cores).
    pub cpu_limit: Option<f64>,

    /// Memory limit in bytes.
    pub memory_limit: Option<i64>,
}

/// Configuration for the local process provider.
///
/// Each session gets its own directory under `workspace_root`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    /// Directory holding session workspaces. Default: a `tasklift`
    /// directory under the system temp dir.
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell to use for running commands. Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    pub bootstrap_command: Option<String>,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            env: HashMap::new(),
            shell: default_shell(),
            bootstrap_command: None,
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}
