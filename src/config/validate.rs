//! Pure validation of provider configuration.
//!
//! Nothing here performs I/O. Errors make a configuration unusable; warnings
//! point at settings that work but are likely to surprise.

use regex::Regex;
use serde::Serialize;

use super::schema::{
    CodespacesProviderConfig, Config, CoreConfig, DockerProviderConfig, Ec2ProviderConfig,
    EcsProviderConfig, LocalProviderConfig, ProviderConfig,
};
use crate::provider::codespaces::NAME_SEPARATOR;

const REGION_PATTERN: &str = r"^[a-z]{2}(-gov)?-[a-z]+-\d+$";
const INSTANCE_TYPE_PATTERN: &str = r"^[a-z][a-z0-9-]*\.[a-z0-9]+$";
const ECS_LAUNCH_TYPES: &[&str] = &["FARGATE", "EC2", "EXTERNAL"];
const CODESPACES_LOCATIONS: &[&str] = &["EastUs", "SouthEastAsia", "WestEurope", "WestUs2"];
const MIN_IDLE_TIMEOUT: u32 = 5;
const MAX_IDLE_TIMEOUT: u32 = 240;

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

impl Config {
    /// Validates the provider section together with the core tunables.
    pub fn validate(&self) -> ValidationResult {
        let mut result = validate(&self.provider);
        validate_core(&self.tasklift, &self.provider, &mut result);
        result.finish()
    }
}

/// Validates a provider configuration on its own.
pub fn validate(provider: &ProviderConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    match provider {
        ProviderConfig::Ec2(c) => validate_ec2(c, &mut result),
        ProviderConfig::Ecs(c) => validate_ecs(c, &mut result),
        ProviderConfig::Codespaces(c) => validate_codespaces(c, &mut result),
        ProviderConfig::Docker(c) => validate_docker(c, &mut result),
        ProviderConfig::Local(c) => validate_local(c, &mut result),
    }
    for key in provider.env().keys() {
        if !is_env_name(key) {
            result.error(format!("env: '{}' is not a valid environment variable name", key));
        }
    }
    result.finish()
}

/// Whether `name` can be exported by a POSIX shell.
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn matches(pattern: &str, value: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn require(result: &mut ValidationResult, field: &str, value: &str) -> bool {
    if value.trim().is_empty() {
        result.error(format!("{} is required", field));
        false
    } else {
        true
    }
}

fn check_region(result: &mut ValidationResult, region: &str) {
    if require(result, "region", region) && !matches(REGION_PATTERN, region) {
        result.error(format!(
            "region '{}' does not look like an AWS region (e.g. us-east-1)",
            region
        ));
    }
}

fn validate_ec2(c: &Ec2ProviderConfig, result: &mut ValidationResult) {
    check_region(result, &c.region);
    require(result, "key_name", &c.key_name);

    if !matches(INSTANCE_TYPE_PATTERN, &c.instance_type) {
        result.error(format!(
            "instance_type '{}' does not look like an EC2 instance type (e.g. t3.medium)",
            c.instance_type
        ));
    }
    if let Some(ami) = &c.ami
        && !ami.starts_with("ami-")
    {
        result.error(format!("ami '{}' must start with 'ami-'", ami));
    }
    if c.security_group_ids.is_empty() {
        result.warn("no security_group_ids set; the VPC default group must allow SSH");
    }
    if c.volume_size_gb < 8 {
        result.error("volume_size_gb must be at least 8");
    }
    if c.key_path.is_none() {
        result.warn("key_path is not set; SSH key material must be supplied programmatically");
    }
    if c.use_spot {
        result.warn("spot instances may be reclaimed with two minutes' notice");
    } else if c.spot_max_price.is_some() {
        result.warn("spot_max_price has no effect unless use_spot = true");
    }
}

fn validate_ecs(c: &EcsProviderConfig, result: &mut ValidationResult) {
    check_region(result, &c.region);
    require(result, "cluster", &c.cluster);
    require(result, "task_definition", &c.task_definition);
    require(result, "container_name", &c.container_name);
    require(result, "service_prefix", &c.service_prefix);

    if !ECS_LAUNCH_TYPES.contains(&c.launch_type.as_str()) {
        result.error(format!(
            "launch_type '{}' must be one of {}",
            c.launch_type,
            ECS_LAUNCH_TYPES.join(", ")
        ));
    }
    if c.launch_type == "FARGATE" {
        if c.subnets.is_empty() {
            result.error("subnets are required for FARGATE tasks");
        }
        if !c.assign_public_ip {
            result.warn("assign_public_ip is disabled; tasks need a NAT gateway to pull images");
        }
    }
    if c.register_task_definition && c.image.is_none() {
        result.error("image is required when register_task_definition = true");
    }
    if c.cpu.parse::<u32>().is_err() {
        result.error(format!("cpu '{}' must be a number of CPU units", c.cpu));
    }
    if c.memory.parse::<u32>().is_err() {
        result.error(format!("memory '{}' must be a number of MiB", c.memory));
    }
}

fn validate_codespaces(c: &CodespacesProviderConfig, result: &mut ValidationResult) {
    require(result, "machine", &c.machine);

    if !(MIN_IDLE_TIMEOUT..=MAX_IDLE_TIMEOUT).contains(&c.idle_timeout_minutes) {
        result.error(format!(
            "idle_timeout_minutes must be between {} and {}",
            MIN_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT
        ));
    } else if c.idle_timeout_minutes < 10 {
        result.warn("idle_timeout_minutes below 10 may stop codespaces between commands");
    }
    if let Some(location) = &c.location
        && !CODESPACES_LOCATIONS.contains(&location.as_str())
    {
        result.error(format!(
            "location '{}' must be one of {}",
            location,
            CODESPACES_LOCATIONS.join(", ")
        ));
    }
    if let Some(repo) = &c.repository
        && crate::repository::github_owner_repo(repo).is_none()
    {
        result.error(format!("repository '{}' is not a GitHub owner/repo", repo));
    }
}

fn validate_docker(c: &DockerProviderConfig, result: &mut ValidationResult) {
    require(result, "image", &c.image);
    if let Some(cpu) = c.resources.cpu_limit
        && cpu <= 0.0
    {
        result.error("resources.cpu_limit must be positive");
    }
    if let Some(mem) = c.resources.memory_limit
        && mem < 6 * 1024 * 1024
    {
        result.error("resources.memory_limit must be at least 6MB");
    }
}

fn validate_local(c: &LocalProviderConfig, result: &mut ValidationResult) {
    require(result, "shell", &c.shell);
}

fn validate_core(core: &CoreConfig, provider: &ProviderConfig, result: &mut ValidationResult) {
    if core.poll_interval_secs == 0 {
        result.error("tasklift.poll_interval_secs must be at least 1");
    }
    if core.max_poll_attempts == 0 {
        result.error("tasklift.max_poll_attempts must be at least 1");
    }
    if !(0.0..1.0).contains(&core.poll_jitter) {
        result.error("tasklift.poll_jitter must be in [0, 1)");
    }
    if core.command_timeout_secs == 0 {
        result.error("tasklift.command_timeout_secs must be at least 1");
    }
    if core.project_tag.trim().is_empty() {
        result.error("tasklift.project_tag must not be empty");
    }
    if core.project_tag.contains(NAME_SEPARATOR) {
        result.error(format!(
            "tasklift.project_tag must not contain '{}'; it separates project and session in codespace names",
            NAME_SEPARATOR
        ));
    }

    let budget = core.poll_interval_secs.saturating_mul(core.max_poll_attempts as u64);
    if budget > 0 && budget < 60 && !matches!(provider, ProviderConfig::Local(_)) {
        result.warn(format!(
            "readiness budget is only {}s; cloud environments usually take longer to start",
            budget
        ));
    }
    if core.ssh_grace_secs == 0 && matches!(provider, ProviderConfig::Ec2(_)) {
        result.warn("ssh_grace_secs = 0; the first SSH connection may be refused while sshd starts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn validate_str(toml: &str) -> ValidationResult {
        load_config_str(toml).unwrap().validate()
    }

    #[test]
    fn test_minimal_configs_are_valid() {
        let minimal = [
            r#"
            [provider]
            type = "ec2"
            region = "us-east-1"
            key_name = "agents"
            key_path = "~/.ssh/agents.pem"
            security_group_ids = ["sg-1"]
            "#,
            r#"
            [provider]
            type = "ecs"
            region = "eu-west-1"
            cluster = "agents"
            task_definition = "runner"
            subnets = ["subnet-1"]
            "#,
            r#"
            [provider]
            type = "codespaces"
            "#,
            r#"
            [provider]
            type = "docker"
            image = "ubuntu:24.04"
            "#,
            r#"
            [provider]
            type = "local"
            "#,
        ];
        for toml in minimal {
            let result = validate_str(toml);
            assert!(result.valid, "{:?}", result.errors);
            assert!(result.errors.is_empty());
        }
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        let result = validate_str(
            r#"
            [provider]
            type = "ecs"
            "#,
        );
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("region is required")));
        assert!(result.errors.iter().any(|e| e.contains("cluster is required")));
        assert!(result.errors.iter().any(|e| e.contains("task_definition is required")));

        let result = validate_str(
            r#"
            [provider]
            type = "ec2"
            "#,
        );
        assert!(result.errors.iter().any(|e| e.contains("key_name is required")));

        let result = validate_str(
            r#"
            [provider]
            type = "docker"
            "#,
        );
        assert!(result.errors.iter().any(|e| e.contains("image is required")));
    }

    #[test]
    fn test_region_and_instance_type_patterns() {
        let result = validate_str(
            r#"
            [provider]
            type = "ec2"
            region = "US-EAST"
            key_name = "k"
            instance_type = "large"
            "#,
        );
        assert!(result.errors.iter().any(|e| e.contains("AWS region")));
        assert!(result.errors.iter().any(|e| e.contains("instance type")));

        assert!(matches(REGION_PATTERN, "us-gov-west-1"));
        assert!(matches(REGION_PATTERN, "ap-southeast-2"));
        assert!(matches(INSTANCE_TYPE_PATTERN, "m5.2xlarge"));
        assert!(matches(INSTANCE_TYPE_PATTERN, "u-6tb1.metal"));
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let result = validate_str(
            r#"
            [tasklift]
            ssh_grace_secs = 0

            [provider]
            type = "ec2"
            region = "us-east-1"
            key_name = "agents"
            key_path = "/keys/agents.pem"
            security_group_ids = ["sg-1"]
            use_spot = true
            "#,
        );
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("spot")));
        assert!(result.warnings.iter().any(|w| w.contains("ssh_grace_secs")));
    }

    #[test]
    fn test_codespaces_idle_timeout_range() {
        let result = validate_str(
            r#"
            [provider]
            type = "codespaces"
            idle_timeout_minutes = 500
            "#,
        );
        assert!(!result.valid);

        let result = validate_str(
            r#"
            [provider]
            type = "codespaces"
            idle_timeout_minutes = 5
            "#,
        );
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("idle_timeout_minutes")));
    }

    #[test]
    fn test_fargate_without_public_ip_warns() {
        let result = validate_str(
            r#"
            [provider]
            type = "ecs"
            region = "us-east-1"
            cluster = "c"
            task_definition = "t"
            subnets = ["subnet-1"]
            assign_public_ip = false
            launch_type = "FARGATE"
            "#,
        );
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("NAT")));
    }

    #[test]
    fn test_env_names_and_core_bounds() {
        let result = validate_str(
            r#"
            [tasklift]
            max_poll_attempts = 0
            poll_jitter = 1.5

            [provider]
            type = "local"

            [provider.env]
            "BAD-NAME" = "x"
            "#,
        );
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("BAD-NAME")));
        assert!(result.errors.iter().any(|e| e.contains("max_poll_attempts")));
        assert!(result.errors.iter().any(|e| e.contains("poll_jitter")));
        assert!(is_env_name("_PATH2"));

        let result = validate_str(
            r#"
            [tasklift]
            project_tag = "team:a"

            [provider]
            type = "local"
            "#,
        );
        assert!(result.errors.iter().any(|e| e.contains("project_tag")));
        assert!(!is_env_name("2PATH"));
    }
}
