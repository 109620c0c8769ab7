//! Physical execution environments and the drivers that manage them.
//!
//! An [`Environment`] is one VM, container, codespace or workspace. Each
//! backend implements [`EnvironmentDriver`] for create/poll/destroy of a
//! single environment; the multiplexer decides how sessions map onto them.
//!
//! # State machine
//!
//! ```text
//! Creating -> Starting -> Running -> Stopping -> Stopped
//!     \           \           \
//!      `-----------`-----------`--> Error
//! ```
//!
//! `Stopped` and `Error` are terminal. Provider-native states map onto this
//! machine through a pure function per driver; anything unrecognized maps
//! to `Error`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderKind, ProviderResult, Resources};
use crate::transport::RemoteExec;

/// Tag keys put on every resource this crate creates.
pub mod tags {
    /// Marks resources as ours. Value is the configured project tag.
    pub const PROJECT: &str = "tasklift:project";
    pub const SESSION: &str = "tasklift:session";
    pub const USER: &str = "tasklift:user";
    pub const REPOSITORY: &str = "tasklift:repository";
    pub const BRANCH: &str = "tasklift:branch";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl EnvironmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvironmentStatus::Stopped | EnvironmentStatus::Error)
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentStatus::Creating => "creating",
            EnvironmentStatus::Starting => "starting",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Stopping => "stopping",
            EnvironmentStatus::Stopped => "stopped",
            EnvironmentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A physical execution unit.
///
/// `metadata` belongs to the driver that created the environment; nothing
/// else interprets its keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub provider: ProviderKind,
    pub status: EnvironmentStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl Environment {
    pub fn new(id: impl Into<String>, provider: ProviderKind, status: EnvironmentStatus) -> Self {
        Self {
            id: id.into(),
            provider,
            status,
            created_at: chrono::Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The session this environment was created for, from its tags.
    pub fn session_id(&self) -> Option<&str> {
        self.meta(tags::SESSION)
    }
}

/// What to create.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRequest {
    /// Session the environment belongs to. Goes into the session tag.
    pub session_id: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub user_id: Option<String>,
    pub resources: Resources,
}

impl EnvironmentRequest {
    /// Tags to attach, project marker first.
    pub fn tags(&self, project: &str) -> Vec<(String, String)> {
        let mut labels = vec![
            (tags::PROJECT.to_string(), project.to_string()),
            (tags::SESSION.to_string(), self.session_id.clone()),
        ];
        if let Some(user) = &self.user_id {
            labels.push((tags::USER.to_string(), user.clone()));
        }
        if let Some(repo) = &self.repository {
            labels.push((tags::REPOSITORY.to_string(), repo.clone()));
        }
        if let Some(branch) = &self.branch {
            labels.push((tags::BRANCH.to_string(), branch.clone()));
        }
        labels
    }
}

/// Per-backend lifecycle of a single environment.
#[async_trait]
pub trait EnvironmentDriver: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Checks credentials and shared infrastructure. See
    /// [`ComputeProvider::initialize`](crate::provider::ComputeProvider::initialize).
    async fn preflight(&self) -> ProviderResult<()>;

    /// Issues one create call, then waits until the environment is usable.
    ///
    /// The create call is never retried. A terminal state while waiting
    /// aborts with [`ProviderError::TerminalState`](crate::provider::ProviderError::TerminalState).
    async fn create_environment(&self, request: &EnvironmentRequest) -> ProviderResult<Environment>;

    /// Closes the cached transport, then deletes the environment.
    ///
    /// An environment that is already gone counts as destroyed.
    async fn destroy_environment(&self, environment_id: &str) -> ProviderResult<()>;

    /// Fresh status. `NotFound` when the provider no longer knows the ID.
    async fn environment_status(&self, environment_id: &str) -> ProviderResult<Environment>;

    /// Environments carrying this project's tag.
    async fn list_environments(&self) -> ProviderResult<Vec<Environment>>;

    /// A transport for running commands in a running environment.
    async fn transport(&self, environment: &Environment) -> ProviderResult<Arc<dyn RemoteExec>>;

    /// Default working directory for commands, if the backend has one.
    fn default_working_dir(&self, _environment: &Environment) -> Option<String> {
        None
    }
}
