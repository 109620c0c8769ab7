//! GitHub Codespaces driver: one codespace per session, driven by `gh`.
//!
//! Codespaces carry no tags. The session is encoded in the display name
//! (`<project>:<session>`), which is also how listing finds this project's
//! codespaces. Project tags may not contain `:`, so the text before the first
//! separator is always the whole project. Display names are capped at 48
//! characters; a longer session ID gets a hashed suffix and can no longer be
//! re-attached from the name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{ProviderContext, ProviderError, ProviderKind, ProviderResult};
use crate::config::{CodespacesProviderConfig, CoreConfig};
use crate::connector::{CliCommand, CliOutput, Connector, classify_cli_failure};
use crate::environment::{Environment, EnvironmentDriver, EnvironmentRequest, EnvironmentStatus, tags};
use crate::readiness::{PollPolicy, PollStatus, poll_until};
use crate::repository::github_owner_repo;
use crate::transport::{NativeExec, RemoteExec, TransportCache};

const DISPLAY_NAME_MAX: usize = 48;

/// Separates project and session in a display name.
pub const NAME_SEPARATOR: char = ':';

const META_MACHINE: &str = "machine";

const VIEW_FIELDS: &str = "name,displayName,state,repository,gitStatus,createdAt,machineName";

/// Maps a codespace state onto the environment state machine.
pub fn map_codespace_state(state: &str) -> EnvironmentStatus {
    match state {
        "Available" => EnvironmentStatus::Running,
        "Provisioning" | "Queued" | "Created" | "Starting" | "Rebuilding" | "Awaiting"
        | "Exporting" | "Updating" => EnvironmentStatus::Starting,
        "ShuttingDown" => EnvironmentStatus::Stopping,
        "Shutdown" | "Archived" | "Deleted" => EnvironmentStatus::Stopped,
        _ => EnvironmentStatus::Error,
    }
}

/// `<project>:<session>`, or a hashed form when that would not fit.
pub fn display_name(project: &str, session_id: &str) -> String {
    let full = format!("{}{}{}", project, NAME_SEPARATOR, session_id);
    if full.chars().count() <= DISPLAY_NAME_MAX {
        return full;
    }
    let digest = Sha256::digest(session_id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    let keep = DISPLAY_NAME_MAX - suffix.len() - 1;
    let head: String = full.chars().take(keep).collect();
    format!("{}~{}", head, suffix)
}

fn belongs_to(project: &str, name: &str) -> bool {
    name.split_once(NAME_SEPARATOR)
        .is_some_and(|(owner, _)| owner == project)
}

/// Inverse of [`display_name`] for names that were not shortened.
fn session_from_display_name<'a>(project: &str, name: &'a str) -> Option<&'a str> {
    let (owner, rest) = name.split_once(NAME_SEPARATOR)?;
    if owner != project
        || rest.is_empty()
        || (name.contains('~') && name.chars().count() == DISPLAY_NAME_MAX)
    {
        return None;
    }
    Some(rest)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Codespace {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    repository: String,
    git_status: Option<GitStatus>,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    machine_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GitStatus {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

impl Codespace {
    fn to_environment(&self, project: &str) -> Environment {
        let mut environment = Environment::new(
            self.name.clone(),
            ProviderKind::Codespaces,
            map_codespace_state(&self.state),
        );
        if let Some(created_at) = self.created_at {
            environment.created_at = created_at;
        }
        if let Some(session) = session_from_display_name(project, &self.display_name) {
            environment
                .metadata
                .insert(tags::PROJECT.to_string(), project.to_string());
            environment
                .metadata
                .insert(tags::SESSION.to_string(), session.to_string());
        }
        if !self.repository.is_empty() {
            environment
                .metadata
                .insert(tags::REPOSITORY.to_string(), self.repository.clone());
        }
        if let Some(branch) = self.git_status.as_ref().and_then(|g| g.git_ref.clone()) {
            environment.metadata.insert(tags::BRANCH.to_string(), branch);
        }
        if let Some(machine) = &self.machine_name {
            environment
                .metadata
                .insert(META_MACHINE.to_string(), machine.clone());
        }
        environment
    }
}

pub struct CodespacesDriver {
    config: CodespacesProviderConfig,
    connector: Arc<dyn Connector>,
    env: Vec<(String, String)>,
    policy: PollPolicy,
    project: String,
    transports: TransportCache,
}

impl CodespacesDriver {
    pub fn new(config: CodespacesProviderConfig, core: &CoreConfig, ctx: &ProviderContext) -> Self {
        Self {
            config,
            connector: ctx.connector.clone(),
            env: ctx.credentials.github_env(),
            policy: core.poll_policy(),
            project: core.project_tag.clone(),
            transports: TransportCache::new(),
        }
    }

    async fn gh<I, S>(&self, action: &str, args: I) -> ProviderResult<CliOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = CliCommand::new("gh")
            .args(args)
            .envs(self.env.iter().cloned());
        let output = self.connector.run(&command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_cli_failure(action, &output))
        }
    }

    fn repository_for(&self, request: &EnvironmentRequest) -> ProviderResult<String> {
        let url = request
            .repository
            .as_deref()
            .or(self.config.repository.as_deref())
            .ok_or_else(|| {
                ProviderError::Configuration(
                    "codespaces need a repository, from the session or `repository`".to_string(),
                )
            })?;
        github_owner_repo(url).ok_or_else(|| {
            ProviderError::Configuration(format!("'{}' is not a GitHub repository", url))
        })
    }

    fn create_args(&self, request: &EnvironmentRequest, repository: &str) -> Vec<String> {
        let mut args = vec![
            "codespace".to_string(),
            "create".to_string(),
            "--repo".to_string(),
            repository.to_string(),
            "--machine".to_string(),
            request
                .resources
                .machine
                .clone()
                .unwrap_or_else(|| self.config.machine.clone()),
            "--idle-timeout".to_string(),
            format!("{}m", self.config.idle_timeout_minutes),
            "--display-name".to_string(),
            display_name(&self.project, &request.session_id),
        ];
        if let Some(branch) = &request.branch {
            args.extend(["--branch".to_string(), branch.clone()]);
        }
        if let Some(location) = &self.config.location {
            args.extend(["--location".to_string(), location.clone()]);
        }
        if let Some(path) = &self.config.devcontainer_path {
            args.extend(["--devcontainer-path".to_string(), path.clone()]);
        }
        args
    }

    async fn view(&self, name: &str) -> ProviderResult<Codespace> {
        self.gh(
            "gh codespace view",
            ["codespace", "view", "--codespace", name, "--json", VIEW_FIELDS],
        )
        .await?
        .json()
    }

    async fn wait_until_available(&self, name: &str) -> ProviderResult<Codespace> {
        poll_until(&format!("codespace {}", name), &self.policy, None, |_| async move {
            let codespace = match self.view(name).await {
                Ok(codespace) => codespace,
                Err(e) if e.is_not_found() => {
                    return Ok(PollStatus::Pending("not yet visible".to_string()));
                }
                Err(e) => return Err(e),
            };
            Ok(match map_codespace_state(&codespace.state) {
                EnvironmentStatus::Running => PollStatus::Ready(codespace),
                EnvironmentStatus::Creating | EnvironmentStatus::Starting => {
                    PollStatus::Pending(codespace.state)
                }
                _ => PollStatus::Terminal(codespace.state),
            })
        })
        .await
    }

    async fn delete(&self, name: &str) -> ProviderResult<()> {
        self.gh(
            "gh codespace delete",
            ["codespace", "delete", "--codespace", name, "--force"],
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl EnvironmentDriver for CodespacesDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codespaces
    }

    async fn preflight(&self) -> ProviderResult<()> {
        self.gh("gh auth status", ["auth", "status"])
            .await
            .map_err(|e| match e {
                ProviderError::Execution { message, .. } => ProviderError::SetupRequired {
                    message,
                    remediation: "run `gh auth login` or set GITHUB_TOKEN".to_string(),
                },
                other => other,
            })?;
        info!("GitHub CLI authenticated");
        Ok(())
    }

    async fn create_environment(&self, request: &EnvironmentRequest) -> ProviderResult<Environment> {
        let repository = self.repository_for(request)?;
        let args = self.create_args(request, &repository);

        info!("Creating codespace on {} for session {}", repository, request.session_id);
        let output = self
            .gh("gh codespace create", args)
            .await
            .map_err(|e| e.into_provisioning("codespace"))?;
        let name = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::provisioning("codespace", "gh printed no codespace name"))?;
        info!("Created codespace {}, waiting for it to become available", name);

        let codespace = match self.wait_until_available(&name).await {
            Ok(codespace) => codespace,
            Err(e) => {
                warn!("Codespace {} did not become available: {}", name, e);
                if let Err(cleanup) = self.delete(&name).await {
                    warn!("Failed to delete codespace {}: {}", name, cleanup);
                }
                return Err(e);
            }
        };

        let mut environment = codespace.to_environment(&self.project);
        environment.metadata.extend(request.tags(&self.project));
        environment
            .metadata
            .insert(tags::REPOSITORY.to_string(), repository);
        Ok(environment)
    }

    async fn destroy_environment(&self, environment_id: &str) -> ProviderResult<()> {
        self.transports.evict(environment_id).await;
        match self.delete(environment_id).await {
            Ok(()) => {
                info!("Deleted codespace {}", environment_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Codespace {} was already gone", environment_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn environment_status(&self, environment_id: &str) -> ProviderResult<Environment> {
        Ok(self.view(environment_id).await?.to_environment(&self.project))
    }

    async fn list_environments(&self) -> ProviderResult<Vec<Environment>> {
        let listed: Vec<Codespace> = self
            .gh(
                "gh codespace list",
                ["codespace", "list", "--limit", "200", "--json", VIEW_FIELDS],
            )
            .await?
            .json()?;
        Ok(listed
            .into_iter()
            .filter(|c| belongs_to(&self.project, &c.display_name))
            .map(|c| c.to_environment(&self.project))
            .collect())
    }

    async fn transport(&self, environment: &Environment) -> ProviderResult<Arc<dyn RemoteExec>> {
        self.transports
            .get_or_insert_with(&environment.id, || {
                let prefix = vec![
                    "codespace".to_string(),
                    "ssh".to_string(),
                    "--codespace".to_string(),
                    environment.id.clone(),
                    "--".to_string(),
                ];
                let exec = NativeExec::new(format!("codespace {}", environment.id), "gh", prefix)
                    .with_env(self.env.clone());
                Ok(Arc::new(exec) as Arc<dyn RemoteExec>)
            })
            .await
    }

    fn default_working_dir(&self, environment: &Environment) -> Option<String> {
        if let Some(dir) = &self.config.working_dir {
            return Some(dir.clone());
        }
        let repository = environment.meta(tags::REPOSITORY)?;
        let owner_repo = github_owner_repo(repository)?;
        let name = owner_repo.rsplit('/').next()?;
        Some(format!("/workspaces/{}", name))
    }
}
