//! Local driver: one workspace directory per session on this machine.
//!
//! There is no isolation; commands run as child processes under the
//! configured shell. It exists for development and for exercising the
//! session lifecycle without cloud credentials.
//!
//! ```toml
//! [provider]
//! type = "local"
//! workspace_root = "/tmp/tasklift"
//! shell = "/bin/bash"
//! ```
//!
//! Each workspace holds a `.tasklift.json` marker with the session's tags,
//! which is what listing and re-attach read back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ProviderError, ProviderKind, ProviderResult};
use crate::config::{CoreConfig, LocalProviderConfig};
use crate::environment::{Environment, EnvironmentDriver, EnvironmentRequest, EnvironmentStatus, tags};
use crate::transport::{LocalExec, RemoteExec, TransportCache};

const MARKER_FILE: &str = ".tasklift.json";

#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceMarker {
    created_at: chrono::DateTime<chrono::Utc>,
    tags: BTreeMap<String, String>,
}

/// Directory name for a session: path separators and dots never escape.
fn workspace_dir_name(session_id: &str) -> String {
    let name: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.strip_prefix('.') {
        Some(rest) => format!("_{}", rest),
        None => name,
    }
}

pub struct LocalDriver {
    config: LocalProviderConfig,
    root: PathBuf,
    project: String,
    transports: TransportCache,
}

impl LocalDriver {
    pub fn new(config: LocalProviderConfig, core: &CoreConfig) -> Self {
        let root = config
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tasklift"));
        Self {
            config,
            root,
            project: core.project_tag.clone(),
            transports: TransportCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace(&self, environment_id: &str) -> PathBuf {
        self.root.join(environment_id)
    }

    async fn read_marker(&self, dir: &Path) -> ProviderResult<Option<WorkspaceMarker>> {
        match tokio::fs::read(dir.join(MARKER_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProviderError::Other(anyhow::anyhow!("{}: {}", dir.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn to_environment(&self, id: &str, marker: WorkspaceMarker) -> Environment {
        let mut environment = Environment::new(id, ProviderKind::Local, EnvironmentStatus::Running);
        environment.created_at = marker.created_at;
        environment.metadata = marker.tags;
        environment
    }
}

#[async_trait]
impl EnvironmentDriver for LocalDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn preflight(&self) -> ProviderResult<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| ProviderError::SetupRequired {
            message: format!("cannot create {}: {}", self.root.display(), e),
            remediation: "point `workspace_root` at a writable directory".to_string(),
        })?;
        if !Path::new(&self.config.shell).exists() {
            return Err(ProviderError::SetupRequired {
                message: format!("shell {} does not exist", self.config.shell),
                remediation: "set `shell` to an installed shell".to_string(),
            });
        }
        info!("Local provider ready in {}", self.root.display());
        Ok(())
    }

    async fn create_environment(&self, request: &EnvironmentRequest) -> ProviderResult<Environment> {
        let id = workspace_dir_name(&request.session_id);
        let dir = self.workspace(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::provisioning("local workspace", e))?;

        let marker = WorkspaceMarker {
            created_at: chrono::Utc::now(),
            tags: request.tags(&self.project).into_iter().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)
            .map_err(|e| ProviderError::provisioning("local workspace", e))?;
        tokio::fs::write(dir.join(MARKER_FILE), bytes)
            .await
            .map_err(|e| ProviderError::provisioning("local workspace", e))?;

        info!("Created workspace {}", dir.display());
        Ok(self.to_environment(&id, marker))
    }

    async fn destroy_environment(&self, environment_id: &str) -> ProviderResult<()> {
        self.transports.evict(environment_id).await;
        let dir = self.workspace(environment_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Removed workspace {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workspace {} was already gone", dir.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn environment_status(&self, environment_id: &str) -> ProviderResult<Environment> {
        match self.read_marker(&self.workspace(environment_id)).await? {
            Some(marker) => Ok(self.to_environment(environment_id, marker)),
            None => Err(ProviderError::NotFound(format!("workspace {}", environment_id))),
        }
    }

    async fn list_environments(&self) -> ProviderResult<Vec<Environment>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut environments = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(marker) = self.read_marker(&entry.path()).await?
                && marker.tags.get(tags::PROJECT) == Some(&self.project)
            {
                environments.push(self.to_environment(&id, marker));
            }
        }
        environments.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(environments)
    }

    async fn transport(&self, environment: &Environment) -> ProviderResult<Arc<dyn RemoteExec>> {
        self.transports
            .get_or_insert_with(&environment.id, || {
                let mut env: Vec<(String, String)> = self
                    .config
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                env.sort();
                if let Some(session) = environment.session_id() {
                    env.push(("TASKLIFT_SESSION_ID".to_string(), session.to_string()));
                }
                let exec = LocalExec::new(self.workspace(&environment.id), self.config.shell.clone(), env);
                Ok(Arc::new(exec) as Arc<dyn RemoteExec>)
            })
            .await
    }

    fn default_working_dir(&self, environment: &Environment) -> Option<String> {
        Some(self.workspace(&environment.id).to_string_lossy().into_owned())
    }
}
