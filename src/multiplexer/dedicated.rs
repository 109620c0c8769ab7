//! One environment per session.
//!
//! [`DedicatedSessions`] turns any [`EnvironmentDriver`] into a full
//! [`ComputeProvider`]. It owns the session table; the driver owns the
//! environments.
//!
//! The table lock guards map reads and writes only. Driver calls (create,
//! poll, destroy, exec) happen with the lock released, so a slow create for
//! one session never blocks status calls for another.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ExecDefaults, TOMBSTONE_TTL, Tombstone, download_via, execute_via, render_bootstrap,
    run_bootstrap, upload_via,
};
use crate::config::{Config, ValidationResult};
use crate::environment::{Environment, EnvironmentDriver, EnvironmentRequest, EnvironmentStatus, tags};
use crate::events::{EventSink, ProviderEvent};
use crate::provider::{
    ComputeProvider, ExecOptions, FileMap, ProviderError, ProviderKind, ProviderResult, Session,
    SessionOptions, SessionStatus, TaskResult, meta,
};

#[derive(Clone)]
struct SessionRecord {
    session: Session,
    environment: Environment,
}

#[derive(Clone)]
enum Entry {
    Live(SessionRecord),
    /// Kept after terminate so repeated calls stay cheap no-ops.
    Tombstone(Tombstone),
}

pub struct DedicatedSessions<D> {
    driver: D,
    config: Config,
    events: EventSink,
    sessions: Mutex<HashMap<String, Entry>>,
    tombstone_ttl: Duration,
}

fn session_status(status: EnvironmentStatus) -> SessionStatus {
    match status {
        EnvironmentStatus::Creating | EnvironmentStatus::Starting | EnvironmentStatus::Running => {
            SessionStatus::Active
        }
        EnvironmentStatus::Stopping | EnvironmentStatus::Stopped => SessionStatus::Terminated,
        EnvironmentStatus::Error => SessionStatus::Error,
    }
}

/// Builds the session view of an environment. Values from `opts` win over
/// the environment's tags.
fn session_for(
    session_id: &str,
    environment: &Environment,
    opts: Option<&SessionOptions>,
) -> Session {
    let mut metadata = BTreeMap::new();
    let pairs = [
        (meta::REPOSITORY, tags::REPOSITORY, opts.and_then(|o| o.repository.clone())),
        (meta::BRANCH, tags::BRANCH, opts.and_then(|o| o.branch.clone())),
        (meta::USER_ID, tags::USER, opts.and_then(|o| o.user_id.clone())),
    ];
    for (key, tag, explicit) in pairs {
        if let Some(value) = explicit.or_else(|| environment.meta(tag).map(str::to_string)) {
            metadata.insert(key.to_string(), value);
        }
    }
    Session {
        id: session_id.to_string(),
        provider: environment.provider,
        status: session_status(environment.status),
        environment_id: environment.id.clone(),
        created_at: environment.created_at,
        metadata,
    }
}

impl<D: EnvironmentDriver> DedicatedSessions<D> {
    pub fn new(driver: D, config: Config, events: EventSink) -> Self {
        Self {
            driver,
            config,
            events,
            sessions: Mutex::new(HashMap::new()),
            tombstone_ttl: TOMBSTONE_TTL,
        }
    }

    /// How long terminated sessions are remembered.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    async fn entry(&self, session_id: &str) -> Option<Entry> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Finds a live environment tagged with `session_id`, e.g. after a restart.
    async fn find_environment(&self, session_id: &str) -> ProviderResult<Option<Environment>> {
        let environments = self.driver.list_environments().await?;
        Ok(environments
            .into_iter()
            .find(|e| e.session_id() == Some(session_id) && !e.status.is_terminal()))
    }

    /// The live record for a session, re-attaching to a tagged environment
    /// when the table has none.
    async fn resolve(&self, session_id: &str) -> ProviderResult<SessionRecord> {
        match self.entry(session_id).await {
            Some(Entry::Live(record)) => return Ok(record),
            Some(Entry::Tombstone(_)) => {
                return Err(ProviderError::NotFound(format!(
                    "session {} has been terminated",
                    session_id
                )));
            }
            None => {}
        }

        let environment = self
            .find_environment(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("session {}", session_id)))?;
        info!(
            "Re-attached session {} to {} {}",
            session_id,
            self.driver.kind(),
            environment.id
        );
        let record = SessionRecord {
            session: session_for(session_id, &environment, None),
            environment,
        };
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Entry::Live(record.clone()));
        Ok(record)
    }

    fn exec_defaults(&self, environment: &Environment) -> ExecDefaults<'_> {
        ExecDefaults {
            timeout: self.config.tasklift.command_timeout(),
            working_dir: self.driver.default_working_dir(environment),
            env: self.config.provider.env(),
        }
    }

    async fn bootstrap(
        &self,
        session_id: &str,
        environment: &Environment,
        opts: &SessionOptions,
    ) -> ProviderResult<()> {
        let Some(template) = self.config.provider.bootstrap_command() else {
            return Ok(());
        };
        let Some(command) = render_bootstrap(
            template,
            opts.repository.as_deref(),
            opts.branch.as_deref(),
            session_id,
        ) else {
            debug!("Session {} has no repository, skipping bootstrap", session_id);
            return Ok(());
        };

        info!("Bootstrapping {} for session {}", environment.id, session_id);
        let transport = self.driver.transport(environment).await?;
        run_bootstrap(transport.as_ref(), command, self.exec_defaults(environment)).await
    }

    /// Destroys an environment whose session never made it into the table.
    async fn discard(&self, environment: &Environment) {
        if let Err(e) = self.driver.destroy_environment(&environment.id).await {
            warn!("Failed to clean up {} {}: {}", self.driver.kind(), environment.id, e);
        }
    }
}

#[async_trait]
impl<D: EnvironmentDriver> ComputeProvider for DedicatedSessions<D> {
    fn kind(&self) -> ProviderKind {
        self.driver.kind()
    }

    fn validate_config(&self) -> ValidationResult {
        self.config.validate()
    }

    async fn initialize(&self) -> ProviderResult<()> {
        self.driver.preflight().await
    }

    async fn create_session(&self, opts: &SessionOptions) -> ProviderResult<Session> {
        let session_id = opts.task_id.trim();
        if session_id.is_empty() {
            return Err(ProviderError::Configuration(
                "session options need a task id".to_string(),
            ));
        }

        if let Some(Entry::Live(record)) = self.entry(session_id).await {
            debug!("Session {} already exists on {}", session_id, record.environment.id);
            return Ok(record.session);
        }

        let existing = match self.find_environment(session_id).await {
            Ok(found) => found.filter(|e| e.status == EnvironmentStatus::Running),
            Err(e) => {
                warn!("Could not look for an existing environment for {}: {}", session_id, e);
                None
            }
        };

        let environment = match existing {
            Some(environment) => {
                info!("Re-using {} for session {}", environment.id, session_id);
                environment
            }
            None => {
                let request = EnvironmentRequest {
                    session_id: session_id.to_string(),
                    repository: opts.repository.clone(),
                    branch: opts.branch.clone(),
                    user_id: opts.user_id.clone(),
                    resources: opts.resources.clone(),
                };
                let environment = self.driver.create_environment(&request).await?;
                self.events.emit(ProviderEvent::EnvironmentCreated {
                    provider: self.driver.kind(),
                    environment_id: environment.id.clone(),
                });

                if let Err(e) = self.bootstrap(session_id, &environment, opts).await {
                    warn!("Bootstrap failed for session {}: {}", session_id, e);
                    self.discard(&environment).await;
                    return Err(e.into_provisioning("environment bootstrap"));
                }
                environment
            }
        };

        let mut session = session_for(session_id, &environment, Some(opts));
        session.status = SessionStatus::Active;
        let record = SessionRecord {
            session: session.clone(),
            environment,
        };
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), Entry::Live(record));

        info!(
            "Session {} ready on {} {}",
            session_id, session.provider, session.environment_id
        );
        self.events.emit(ProviderEvent::SessionCreated {
            provider: session.provider,
            session_id: session.id.clone(),
            environment_id: session.environment_id.clone(),
        });
        Ok(session)
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> TaskResult {
        let record = match self.resolve(session_id).await {
            Ok(record) => record,
            Err(e) => return TaskResult::failed(e.to_string()),
        };
        let transport = match self.driver.transport(&record.environment).await {
            Ok(transport) => transport,
            Err(e) => return TaskResult::failed(e.to_string()),
        };
        execute_via(
            transport.as_ref(),
            session_id,
            command,
            opts,
            self.exec_defaults(&record.environment),
            &self.events,
        )
        .await
    }

    async fn get_session_status(&self, session_id: &str) -> ProviderResult<Session> {
        let record = match self.entry(session_id).await {
            Some(Entry::Tombstone(tombstone)) => return Ok(tombstone.session),
            Some(Entry::Live(record)) => record,
            None => {
                return match self.find_environment(session_id).await? {
                    Some(environment) => Ok(session_for(session_id, &environment, None)),
                    None => Err(ProviderError::NotFound(format!("session {}", session_id))),
                };
            }
        };

        let mut session = record.session.clone();
        match self.driver.environment_status(&record.environment.id).await {
            Ok(environment) => {
                session.status = session_status(environment.status);
                let mut sessions = self.sessions.lock().await;
                if let Some(Entry::Live(stored)) = sessions.get_mut(session_id) {
                    stored.session.status = session.status;
                    stored.environment = environment;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("Environment {} is gone", record.environment.id);
                session.status = SessionStatus::Terminated;
            }
            Err(e) => return Err(e),
        }
        Ok(session)
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> ProviderResult<Vec<Session>> {
        let mut sessions: BTreeMap<String, Session> = BTreeMap::new();
        let mut terminated = Vec::new();
        for (id, entry) in self.sessions.lock().await.iter() {
            match entry {
                Entry::Live(record) => {
                    sessions.insert(id.clone(), record.session.clone());
                }
                Entry::Tombstone(_) => terminated.push(id.clone()),
            }
        }

        for environment in self.driver.list_environments().await? {
            let Some(session_id) = environment.session_id() else {
                continue;
            };
            if terminated.iter().any(|t| t == session_id) {
                continue;
            }
            match sessions.get_mut(session_id) {
                Some(session) if session.environment_id == environment.id => {
                    session.status = session_status(environment.status);
                }
                Some(_) => {}
                None if !environment.status.is_terminal() => {
                    sessions.insert(
                        session_id.to_string(),
                        session_for(session_id, &environment, None),
                    );
                }
                None => {}
            }
        }

        Ok(sessions
            .into_values()
            .filter(|s| user_id.is_none() || s.user_id() == user_id)
            .collect())
    }

    async fn terminate_session(&self, session_id: &str) -> ProviderResult<()> {
        let mut session = match self.entry(session_id).await {
            Some(Entry::Tombstone(_)) => {
                debug!("Session {} already terminated", session_id);
                return Ok(());
            }
            Some(Entry::Live(record)) => record.session,
            None => match self.find_environment(session_id).await? {
                Some(environment) => session_for(session_id, &environment, None),
                None => {
                    debug!("Session {} not found, nothing to terminate", session_id);
                    return Ok(());
                }
            },
        };

        match self.driver.destroy_environment(&session.environment_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Environment {} was already gone", session.environment_id);
            }
            Err(e) => return Err(e),
        }

        session.status = SessionStatus::Terminated;
        {
            let ttl = self.tombstone_ttl;
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, entry| !matches!(entry, Entry::Tombstone(t) if t.expired(ttl)));
            sessions.insert(
                session_id.to_string(),
                Entry::Tombstone(Tombstone::new(session.clone())),
            );
        }

        info!("Terminated session {} ({})", session_id, session.environment_id);
        self.events.emit(ProviderEvent::EnvironmentDestroyed {
            provider: session.provider,
            environment_id: session.environment_id.clone(),
        });
        self.events.emit(ProviderEvent::SessionTerminated {
            provider: session.provider,
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn upload_files(&self, session_id: &str, files: &FileMap) -> ProviderResult<()> {
        let record = self.resolve(session_id).await?;
        let transport = self.driver.transport(&record.environment).await?;
        let working_dir = self.driver.default_working_dir(&record.environment);
        upload_via(transport.as_ref(), files, working_dir.as_deref()).await
    }

    async fn download_results(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> ProviderResult<FileMap> {
        let record = self.resolve(session_id).await?;
        let transport = self.driver.transport(&record.environment).await?;
        let working_dir = self.driver.default_working_dir(&record.environment);
        download_via(transport.as_ref(), paths, working_dir.as_deref()).await
    }
}
