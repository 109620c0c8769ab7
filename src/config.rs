//! Configuration loading and schema definitions for tasklift.
//!
//! This module provides types and functions for loading tasklift
//! configuration from TOML files or strings, validating it, and writing
//! starter templates for `tasklift init`.

pub mod schema;
pub mod validate;

pub use schema::*;
pub use validate::{ValidationResult, validate};

use std::path::Path;

use anyhow::{Context, Result};

use crate::provider::ProviderKind;

/// Loads tasklift configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use tasklift::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("tasklift.toml"))?;
/// println!("Poll attempts: {}", config.tasklift.max_poll_attempts);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads tasklift configuration from a TOML string.
///
/// # Example
///
/// ```
/// use tasklift::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [tasklift]
///     poll_interval_secs = 2
///
///     [provider]
///     type = "local"
/// "#)?;
///
/// assert_eq!(config.tasklift.poll_interval_secs, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Starter configuration written by `tasklift init`.
pub fn template(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Ec2 => {
            r#"[tasklift]
poll_interval_secs = 5
max_poll_attempts = 60
ssh_grace_secs = 30

[provider]
type = "ec2"
region = "us-east-1"
instance_type = "t3.medium"
key_name = "tasklift"
key_path = "~/.ssh/tasklift.pem"
security_group_ids = ["sg-REPLACE_ME"]
# subnet_id = "subnet-REPLACE_ME"
# use_spot = true
bootstrap_command = "git clone --branch {branch} {repository} ~/workspace"
"#
        }
        ProviderKind::Ecs => {
            r#"[tasklift]
poll_interval_secs = 5
max_poll_attempts = 60

[provider]
type = "ecs"
region = "us-east-1"
cluster = "tasklift"
task_definition = "tasklift-agent"
container_name = "agent"
launch_type = "FARGATE"
subnets = ["subnet-REPLACE_ME"]
security_groups = ["sg-REPLACE_ME"]
# register_task_definition = true
# image = "public.ecr.aws/docker/library/ubuntu:24.04"
"#
        }
        ProviderKind::Codespaces => {
            r#"[tasklift]
poll_interval_secs = 10
max_poll_attempts = 60

[provider]
type = "codespaces"
repository = "owner/repo"
machine = "basicLinux32gb"
idle_timeout_minutes = 30
"#
        }
        ProviderKind::Docker => {
            r#"[tasklift]
poll_interval_secs = 1
max_poll_attempts = 30

[provider]
type = "docker"
image = "ubuntu:24.04"
working_dir = "/workspace"
"#
        }
        ProviderKind::Local => {
            r#"[tasklift]
poll_interval_secs = 1
max_poll_attempts = 5

[provider]
type = "local"
"#
        }
    }
}
