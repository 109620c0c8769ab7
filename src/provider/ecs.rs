//! ECS provider: one long-lived service per repository, one task per session.
//!
//! ```text
//! repository URL ──repository_key──▶ service (find-or-create, shared)
//!                                        │
//!          session A ──run-task──▶ task A┤ same network configuration
//!          session B ──run-task──▶ task B┘
//! ```
//!
//! The service is created once with a desired count of zero and is never
//! deleted by a session; it anchors the network configuration and groups
//! the session tasks. Each session's task carries a `tasklift:session` tag
//! and `startedBy`, so the session table can be rebuilt after a restart.
//! Commands run through `aws ecs execute-command`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::aws::{AwsCli, ecs_tags};
use super::{
    ComputeProvider, ExecOptions, FileMap, ProviderContext, ProviderError, ProviderKind,
    ProviderResult, Session, SessionOptions, SessionStatus, TaskResult, meta,
};
use crate::config::{Config, CoreConfig, EcsProviderConfig, ProviderConfig, ValidationResult};
use crate::environment::{EnvironmentRequest, EnvironmentStatus, tags};
use crate::events::{EventSink, ProviderEvent};
use crate::multiplexer::{
    ExecDefaults, ServiceRegistry, TOMBSTONE_TTL, Tombstone, download_via, execute_via,
    render_bootstrap, run_bootstrap, upload_via,
};
use crate::readiness::{PollPolicy, PollStatus, poll_until};
use crate::repository::{DEFAULT_REPOSITORY_KEY, repository_key, service_name};
use crate::transport::native::SSM_NOISE;
use crate::transport::{NativeExec, RemoteExec, TransportCache};

/// ECS limit on service names.
const SERVICE_NAME_MAX: usize = 255;

/// ECS limit on `startedBy`.
const STARTED_BY_MAX: usize = 36;

/// `describe-tasks` accepts at most this many ARNs per call.
const DESCRIBE_BATCH: usize = 100;

const EXEC_AGENT: &str = "ExecuteCommandAgent";

/// Maps an ECS task `lastStatus` onto the environment state machine.
pub fn map_ecs_task_status(status: &str) -> EnvironmentStatus {
    match status {
        "PROVISIONING" | "PENDING" | "ACTIVATING" => EnvironmentStatus::Starting,
        "RUNNING" => EnvironmentStatus::Running,
        "DEACTIVATING" | "STOPPING" | "DEPROVISIONING" => EnvironmentStatus::Stopping,
        "STOPPED" | "DELETED" => EnvironmentStatus::Stopped,
        _ => EnvironmentStatus::Error,
    }
}

fn started_by(session_id: &str) -> String {
    session_id.chars().take(STARTED_BY_MAX).collect()
}

fn short_task_id(task_arn: &str) -> &str {
    task_arn.rsplit('/').next().unwrap_or(task_arn)
}

/// A service bound to one repository key.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHandle {
    pub name: String,
    pub arn: String,
    pub repository_key: String,
    /// `awsvpcConfiguration` that session tasks inherit.
    pub network: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DescribeClustersOutput {
    #[serde(default)]
    clusters: Vec<Cluster>,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    status: String,
}

#[derive(Debug, Deserialize)]
struct DescribeServicesOutput {
    #[serde(default)]
    services: Vec<ServiceDescription>,
}

#[derive(Debug, Deserialize)]
struct CreateServiceOutput {
    service: ServiceDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDescription {
    service_name: String,
    service_arn: String,
    status: String,
    network_configuration: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TasksOutput {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    failures: Vec<Failure>,
}

#[derive(Debug, Deserialize)]
struct Failure {
    arn: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksOutput {
    #[serde(default)]
    task_arns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    task_arn: String,
    #[serde(default)]
    last_status: String,
    group: Option<String>,
    stopped_reason: Option<String>,
    #[serde(default)]
    containers: Vec<Container>,
    #[serde(default)]
    tags: Vec<EcsTag>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    name: String,
    #[serde(default)]
    managed_agents: Vec<ManagedAgent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedAgent {
    name: String,
    last_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EcsTag {
    key: String,
    value: String,
}

impl Task {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    fn service(&self) -> Option<&str> {
        self.group.as_deref().and_then(|g| g.strip_prefix("service:"))
    }

    fn exec_agent_running(&self, container: &str) -> bool {
        self.containers
            .iter()
            .filter(|c| c.name == container)
            .flat_map(|c| &c.managed_agents)
            .any(|a| a.name == EXEC_AGENT && a.last_status.as_deref() == Some("RUNNING"))
    }
}

#[derive(Clone)]
struct TaskRecord {
    session: Session,
    task_arn: String,
}

#[derive(Clone)]
enum Entry {
    Live(TaskRecord),
    Tombstone(Tombstone),
}

pub struct EcsProvider {
    config: EcsProviderConfig,
    core: CoreConfig,
    aws: AwsCli,
    policy: PollPolicy,
    events: EventSink,
    services: ServiceRegistry<ServiceHandle>,
    sessions: Mutex<HashMap<String, Entry>>,
    tombstone_ttl: Duration,
    transports: TransportCache,
}

impl EcsProvider {
    pub fn new(config: EcsProviderConfig, core: CoreConfig, ctx: &ProviderContext) -> Self {
        let aws = AwsCli::new(ctx.connector.clone(), &config.region, &ctx.credentials);
        Self {
            policy: core.poll_policy(),
            config,
            core,
            aws,
            events: ctx.events.clone(),
            services: ServiceRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            tombstone_ttl: TOMBSTONE_TTL,
            transports: TransportCache::new(),
        }
    }

    /// How long terminated sessions are remembered.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    fn cluster(&self) -> &str {
        &self.config.cluster
    }

    fn network_configuration(&self) -> serde_json::Value {
        json!({
            "awsvpcConfiguration": {
                "subnets": self.config.subnets,
                "securityGroups": self.config.security_groups,
                "assignPublicIp": if self.config.assign_public_ip { "ENABLED" } else { "DISABLED" },
            }
        })
    }

    fn handle_from(&self, key: &str, service: ServiceDescription) -> ServiceHandle {
        ServiceHandle {
            network: service
                .network_configuration
                .unwrap_or_else(|| self.network_configuration()),
            name: service.service_name,
            arn: service.service_arn,
            repository_key: key.to_string(),
        }
    }

    async fn describe_service(&self, name: &str) -> ProviderResult<Option<ServiceDescription>> {
        let output: DescribeServicesOutput = self
            .aws
            .call_json(
                "ecs describe-services",
                ["ecs", "describe-services", "--cluster", self.cluster(), "--services", name],
            )
            .await?;
        Ok(output.services.into_iter().find(|s| s.status == "ACTIVE"))
    }

    async fn create_service(&self, key: &str, name: &str, repository: Option<&str>) -> ProviderResult<ServiceDescription> {
        let mut labels = vec![
            (tags::PROJECT.to_string(), self.core.project_tag.clone()),
            ("tasklift:repository-key".to_string(), key.to_string()),
        ];
        if let Some(repository) = repository {
            labels.push((tags::REPOSITORY.to_string(), repository.to_string()));
        }
        let args = vec![
            "ecs".to_string(),
            "create-service".to_string(),
            "--cluster".to_string(),
            self.cluster().to_string(),
            "--service-name".to_string(),
            name.to_string(),
            "--task-definition".to_string(),
            self.config.task_definition.clone(),
            "--desired-count".to_string(),
            "0".to_string(),
            "--launch-type".to_string(),
            self.config.launch_type.clone(),
            "--network-configuration".to_string(),
            self.network_configuration().to_string(),
            "--enable-execute-command".to_string(),
            "--tags".to_string(),
            ecs_tags(&labels).to_string(),
        ];
        let output: CreateServiceOutput = self.aws.call_json("ecs create-service", args).await?;
        Ok(output.service)
    }

    /// Describe, else create. A concurrent create by another process shows
    /// up as "already exists" and is reloaded.
    async fn find_or_create_service(
        &self,
        key: &str,
        name: &str,
        repository: Option<&str>,
    ) -> ProviderResult<ServiceHandle> {
        if let Some(existing) = self.describe_service(name).await? {
            info!("Reusing ECS service {} for {}", name, key);
            self.events.emit(ProviderEvent::ServiceReused {
                repository_key: key.to_string(),
                service: name.to_string(),
            });
            return Ok(self.handle_from(key, existing));
        }

        info!("Creating ECS service {} for {}", name, key);
        let created = match self.create_service(key, name, repository).await {
            Ok(service) => service,
            Err(e) if is_already_exists(&e) => {
                debug!("Service {} was created concurrently, reloading", name);
                self.describe_service(name).await?.ok_or_else(|| {
                    ProviderError::provisioning("ECS service", format!("{} exists but is not active", name))
                })?
            }
            Err(e) => return Err(e.into_provisioning("ECS service")),
        };
        self.events.emit(ProviderEvent::ServiceCreated {
            repository_key: key.to_string(),
            service: name.to_string(),
        });
        Ok(self.handle_from(key, created))
    }

    /// The service for a repository, created on first use.
    pub async fn get_or_create_service(&self, repository: Option<&str>) -> ProviderResult<ServiceHandle> {
        let key = repository
            .map(repository_key)
            .unwrap_or_else(|| DEFAULT_REPOSITORY_KEY.to_string());
        let name = service_name(&self.config.service_prefix, &key, SERVICE_NAME_MAX);

        let (handle, created_here) = self
            .services
            .get_or_create(&key, || self.find_or_create_service(&key, &name, repository))
            .await?;
        if !created_here {
            debug!("Service {} cached for {}", handle.name, key);
            self.events.emit(ProviderEvent::ServiceReused {
                repository_key: key,
                service: handle.name.clone(),
            });
        }
        Ok(handle)
    }

    fn run_task_args(&self, service: &ServiceHandle, session_id: &str, opts: &SessionOptions) -> Vec<String> {
        let request = EnvironmentRequest {
            session_id: session_id.to_string(),
            repository: opts.repository.clone(),
            branch: opts.branch.clone(),
            user_id: opts.user_id.clone(),
            resources: opts.resources.clone(),
        };
        let labels = request.tags(&self.core.project_tag);

        let mut env: Vec<(&String, &String)> = self.config.env.iter().collect();
        env.sort();
        let mut environment: Vec<serde_json::Value> = env
            .into_iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        environment.push(json!({ "name": "TASKLIFT_SESSION_ID", "value": session_id }));
        let mut overrides = json!({
            "containerOverrides": [{
                "name": self.config.container_name,
                "environment": environment,
            }]
        });
        if let Some(cpu) = &opts.resources.cpu {
            overrides["cpu"] = json!(cpu);
        }
        if let Some(memory) = &opts.resources.memory {
            overrides["memory"] = json!(memory);
        }

        vec![
            "ecs".to_string(),
            "run-task".to_string(),
            "--cluster".to_string(),
            self.cluster().to_string(),
            "--task-definition".to_string(),
            opts.resources
                .image
                .clone()
                .unwrap_or_else(|| self.config.task_definition.clone()),
            "--count".to_string(),
            "1".to_string(),
            "--launch-type".to_string(),
            self.config.launch_type.clone(),
            "--network-configuration".to_string(),
            service.network.to_string(),
            "--enable-execute-command".to_string(),
            "--started-by".to_string(),
            started_by(session_id),
            "--group".to_string(),
            format!("service:{}", service.name),
            "--tags".to_string(),
            ecs_tags(&labels).to_string(),
            "--overrides".to_string(),
            overrides.to_string(),
        ]
    }

    async fn describe_tasks(&self, task_arns: &[String], include_tags: bool) -> ProviderResult<TasksOutput> {
        let mut args = vec![
            "ecs".to_string(),
            "describe-tasks".to_string(),
            "--cluster".to_string(),
            self.cluster().to_string(),
            "--tasks".to_string(),
        ];
        args.extend(task_arns.iter().cloned());
        if include_tags {
            args.extend(["--include".to_string(), "TAGS".to_string()]);
        }
        self.aws.call_json("ecs describe-tasks", args).await
    }

    async fn describe_task(&self, task_arn: &str) -> ProviderResult<Task> {
        let output = self.describe_tasks(&[task_arn.to_string()], false).await?;
        output
            .tasks
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("task {}", task_arn)))
    }

    /// Starts the task for a session and waits until commands can run in it.
    async fn run_task_unit(
        &self,
        service: &ServiceHandle,
        session_id: &str,
        opts: &SessionOptions,
    ) -> ProviderResult<String> {
        let args = self.run_task_args(service, session_id, opts);
        let output: TasksOutput = self
            .aws
            .call_json("ecs run-task", args)
            .await
            .map_err(|e| e.into_provisioning("ECS task"))?;
        let Some(task) = output.tasks.into_iter().next() else {
            let reasons: Vec<String> = output
                .failures
                .iter()
                .map(|f| f.reason.clone().unwrap_or_else(|| "unknown".to_string()))
                .collect();
            return Err(ProviderError::provisioning(
                "ECS task",
                format!("run-task started nothing: {}", reasons.join(", ")),
            ));
        };
        let task_arn = task.task_arn;
        info!("Started task {} for session {}", short_task_id(&task_arn), session_id);

        let ready = poll_until(
            &format!("task {}", short_task_id(&task_arn)),
            &self.policy,
            None,
            |_| {
                let task_arn = task_arn.clone();
                async move {
                    let task = match self.describe_task(&task_arn).await {
                        Ok(task) => task,
                        Err(e) if e.is_not_found() => {
                            return Ok(PollStatus::Pending("not yet visible".to_string()));
                        }
                        Err(e) => return Err(e),
                    };
                    Ok(match map_ecs_task_status(&task.last_status) {
                        EnvironmentStatus::Running
                            if task.exec_agent_running(&self.config.container_name) =>
                        {
                            PollStatus::Ready(())
                        }
                        EnvironmentStatus::Running => {
                            PollStatus::Pending("RUNNING, exec agent starting".to_string())
                        }
                        EnvironmentStatus::Creating | EnvironmentStatus::Starting => {
                            PollStatus::Pending(task.last_status)
                        }
                        _ => PollStatus::Terminal(match task.stopped_reason {
                            Some(reason) => format!("{} ({})", task.last_status, reason),
                            None => task.last_status,
                        }),
                    })
                }
            },
        )
        .await;

        match ready {
            Ok(()) => Ok(task_arn),
            Err(e) => {
                warn!("Task {} did not become ready: {}", short_task_id(&task_arn), e);
                if let Err(cleanup) = self.stop_task(&task_arn).await {
                    warn!("Failed to stop task {}: {}", short_task_id(&task_arn), cleanup);
                }
                Err(e)
            }
        }
    }

    async fn stop_task(&self, task_arn: &str) -> ProviderResult<()> {
        self.aws
            .call(
                "ecs stop-task",
                [
                    "ecs",
                    "stop-task",
                    "--cluster",
                    self.cluster(),
                    "--task",
                    task_arn,
                    "--reason",
                    "tasklift session terminated",
                ],
            )
            .await
            .map(|_| ())
    }

    /// Running tasks of this project, with their tags.
    async fn project_tasks(&self, started_by_filter: Option<&str>) -> ProviderResult<Vec<Task>> {
        let mut args = vec![
            "ecs".to_string(),
            "list-tasks".to_string(),
            "--cluster".to_string(),
            self.cluster().to_string(),
            "--desired-status".to_string(),
            "RUNNING".to_string(),
        ];
        if let Some(filter) = started_by_filter {
            args.extend(["--started-by".to_string(), started_by(filter)]);
        }
        let listed: ListTasksOutput = self.aws.call_json("ecs list-tasks", args).await?;

        let mut tasks = Vec::new();
        for batch in listed.task_arns.chunks(DESCRIBE_BATCH) {
            let output = self.describe_tasks(batch, true).await?;
            for failure in &output.failures {
                debug!(
                    "Task {} vanished while listing: {}",
                    failure.arn.as_deref().unwrap_or("?"),
                    failure.reason.as_deref().unwrap_or("?")
                );
            }
            tasks.extend(
                output
                    .tasks
                    .into_iter()
                    .filter(|t| t.tag(tags::PROJECT) == Some(self.core.project_tag.as_str())),
            );
        }
        Ok(tasks)
    }

    async fn find_task(&self, session_id: &str) -> ProviderResult<Option<Task>> {
        Ok(self
            .project_tasks(Some(session_id))
            .await?
            .into_iter()
            .find(|t| t.tag(tags::SESSION) == Some(session_id)))
    }

    fn session_for(&self, session_id: &str, task: &Task, opts: Option<&SessionOptions>) -> Session {
        let mut metadata = BTreeMap::new();
        let pairs = [
            (meta::REPOSITORY, tags::REPOSITORY, opts.and_then(|o| o.repository.clone())),
            (meta::BRANCH, tags::BRANCH, opts.and_then(|o| o.branch.clone())),
            (meta::USER_ID, tags::USER, opts.and_then(|o| o.user_id.clone())),
        ];
        for (key, tag, explicit) in pairs {
            if let Some(value) = explicit.or_else(|| task.tag(tag).map(str::to_string)) {
                metadata.insert(key.to_string(), value);
            }
        }
        let service = task.service().unwrap_or_default().to_string();
        metadata.insert(meta::SERVICE.to_string(), service.clone());
        metadata.insert(meta::TASK.to_string(), task.task_arn.clone());
        metadata.insert(meta::CLUSTER.to_string(), self.cluster().to_string());

        Session {
            id: session_id.to_string(),
            provider: ProviderKind::Ecs,
            status: match map_ecs_task_status(&task.last_status) {
                EnvironmentStatus::Stopping | EnvironmentStatus::Stopped => SessionStatus::Terminated,
                EnvironmentStatus::Error => SessionStatus::Error,
                _ => SessionStatus::Active,
            },
            environment_id: service,
            created_at: chrono::Utc::now(),
            metadata,
        }
    }

    async fn entry(&self, session_id: &str) -> Option<Entry> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    async fn resolve(&self, session_id: &str) -> ProviderResult<TaskRecord> {
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
        let task = self
            .find_task(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("session {}", session_id)))?;
        info!("Re-attached session {} to task {}", session_id, short_task_id(&task.task_arn));
        let record = TaskRecord {
            session: self.session_for(session_id, &task, None),
            task_arn: task.task_arn,
        };
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Entry::Live(record.clone()));
        Ok(record)
    }

    async fn transport(&self, task_arn: &str) -> ProviderResult<Arc<dyn RemoteExec>> {
        self.transports
            .get_or_insert_with(task_arn, || {
                let prefix = vec![
                    "ecs".to_string(),
                    "execute-command".to_string(),
                    "--region".to_string(),
                    self.aws.region().to_string(),
                    "--cluster".to_string(),
                    self.cluster().to_string(),
                    "--task".to_string(),
                    task_arn.to_string(),
                    "--container".to_string(),
                    self.config.container_name.clone(),
                    "--interactive".to_string(),
                    "--command".to_string(),
                ];
                let exec = NativeExec::new(
                    format!("ecs exec {}", short_task_id(task_arn)),
                    "aws",
                    prefix,
                )
                .with_env(self.aws.env().to_vec())
                .requires("session-manager-plugin")
                .with_noise(SSM_NOISE);
                Ok(Arc::new(exec) as Arc<dyn RemoteExec>)
            })
            .await
    }

    fn exec_defaults(&self) -> ExecDefaults<'_> {
        ExecDefaults {
            timeout: self.core.command_timeout(),
            working_dir: None,
            env: &self.config.env,
        }
    }

    async fn bootstrap(&self, session_id: &str, task_arn: &str, opts: &SessionOptions) -> ProviderResult<()> {
        let Some(template) = self.config.bootstrap_command.as_deref() else {
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
        let transport = self.transport(task_arn).await?;
        run_bootstrap(transport.as_ref(), command, self.exec_defaults()).await
    }
}

fn is_already_exists(e: &ProviderError) -> bool {
    let text = match e {
        ProviderError::Execution { message, stderr, .. } => format!("{} {}", message, stderr),
        other => other.to_string(),
    };
    text.contains("already exists") || text.contains("not idempotent")
}

#[async_trait]
impl ComputeProvider for EcsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ecs
    }

    fn validate_config(&self) -> ValidationResult {
        Config {
            tasklift: self.core.clone(),
            provider: ProviderConfig::Ecs(self.config.clone()),
        }
        .validate()
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let clusters: DescribeClustersOutput = self
            .aws
            .call_json(
                "ecs describe-clusters",
                ["ecs", "describe-clusters", "--clusters", self.cluster()],
            )
            .await?;
        if !clusters.clusters.iter().any(|c| c.status == "ACTIVE") {
            return Err(ProviderError::SetupRequired {
                message: format!(
                    "ECS cluster '{}' is not active in {}",
                    self.cluster(),
                    self.aws.region()
                ),
                remediation: "create the cluster (`aws ecs create-cluster`) or fix `cluster`"
                    .to_string(),
            });
        }

        let described = self
            .aws
            .call(
                "ecs describe-task-definition",
                [
                    "ecs",
                    "describe-task-definition",
                    "--task-definition",
                    self.config.task_definition.as_str(),
                ],
            )
            .await;
        match described {
            Ok(_) => {}
            Err(ProviderError::NotFound(_) | ProviderError::Execution { .. })
                if self.config.register_task_definition =>
            {
                self.register_task_definition().await?;
            }
            Err(ProviderError::NotFound(message) | ProviderError::Execution { message, .. }) => {
                return Err(ProviderError::SetupRequired {
                    message,
                    remediation: format!(
                        "register task definition '{}' or set register_task_definition and image",
                        self.config.task_definition
                    ),
                });
            }
            Err(e) => return Err(e),
        }

        info!("ECS provider ready on cluster {}", self.cluster());
        Ok(())
    }

    async fn create_session(&self, opts: &SessionOptions) -> ProviderResult<Session> {
        let session_id = opts.task_id.trim();
        if session_id.is_empty() {
            return Err(ProviderError::Configuration(
                "session options need a task id".to_string(),
            ));
        }
        if let Some(Entry::Live(record)) = self.entry(session_id).await {
            return Ok(record.session);
        }

        let existing = match self.find_task(session_id).await {
            Ok(task) => task.filter(|t| map_ecs_task_status(&t.last_status) == EnvironmentStatus::Running),
            Err(e) => {
                warn!("Could not look for an existing task for {}: {}", session_id, e);
                None
            }
        };

        let record = match existing {
            Some(task) => {
                info!("Re-using task {} for session {}", short_task_id(&task.task_arn), session_id);
                TaskRecord {
                    session: self.session_for(session_id, &task, Some(opts)),
                    task_arn: task.task_arn,
                }
            }
            None => {
                let service = self.get_or_create_service(opts.repository.as_deref()).await?;
                let task_arn = self.run_task_unit(&service, session_id, opts).await?;

                if let Err(e) = self.bootstrap(session_id, &task_arn, opts).await {
                    warn!("Bootstrap failed for session {}: {}", session_id, e);
                    self.transports.evict(&task_arn).await;
                    if let Err(cleanup) = self.stop_task(&task_arn).await {
                        warn!("Failed to stop task {}: {}", short_task_id(&task_arn), cleanup);
                    }
                    return Err(e.into_provisioning("environment bootstrap"));
                }

                let mut metadata = BTreeMap::new();
                let pairs = [
                    (meta::REPOSITORY, &opts.repository),
                    (meta::BRANCH, &opts.branch),
                    (meta::USER_ID, &opts.user_id),
                ];
                for (key, value) in pairs {
                    if let Some(value) = value {
                        metadata.insert(key.to_string(), value.clone());
                    }
                }
                metadata.insert(meta::SERVICE.to_string(), service.name.clone());
                metadata.insert(meta::SERVICE_ARN.to_string(), service.arn.clone());
                metadata.insert(meta::TASK.to_string(), task_arn.clone());
                metadata.insert(meta::CLUSTER.to_string(), self.cluster().to_string());
                TaskRecord {
                    session: Session {
                        id: session_id.to_string(),
                        provider: ProviderKind::Ecs,
                        status: SessionStatus::Active,
                        environment_id: service.name,
                        created_at: chrono::Utc::now(),
                        metadata,
                    },
                    task_arn,
                }
            }
        };

        let session = record.session.clone();
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), Entry::Live(record));
        self.events.emit(ProviderEvent::SessionCreated {
            provider: ProviderKind::Ecs,
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
        let transport = match self.transport(&record.task_arn).await {
            Ok(transport) => transport,
            Err(e) => return TaskResult::failed(e.to_string()),
        };
        execute_via(
            transport.as_ref(),
            session_id,
            command,
            opts,
            self.exec_defaults(),
            &self.events,
        )
        .await
    }

    async fn get_session_status(&self, session_id: &str) -> ProviderResult<Session> {
        let record = match self.entry(session_id).await {
            Some(Entry::Tombstone(tombstone)) => return Ok(tombstone.session),
            Some(Entry::Live(record)) => record,
            None => {
                return match self.find_task(session_id).await? {
                    Some(task) => Ok(self.session_for(session_id, &task, None)),
                    None => Err(ProviderError::NotFound(format!("session {}", session_id))),
                };
            }
        };

        let mut session = record.session.clone();
        session.status = match self.describe_task(&record.task_arn).await {
            Ok(task) => match map_ecs_task_status(&task.last_status) {
                EnvironmentStatus::Stopping | EnvironmentStatus::Stopped => SessionStatus::Terminated,
                EnvironmentStatus::Error => SessionStatus::Error,
                _ => SessionStatus::Active,
            },
            Err(e) if e.is_not_found() => SessionStatus::Terminated,
            Err(e) => return Err(e),
        };
        if let Some(Entry::Live(stored)) = self.sessions.lock().await.get_mut(session_id) {
            stored.session.status = session.status;
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

        for task in self.project_tasks(None).await? {
            let Some(session_id) = task.tag(tags::SESSION) else {
                continue;
            };
            if terminated.iter().any(|t| t == session_id) || sessions.contains_key(session_id) {
                continue;
            }
            sessions.insert(session_id.to_string(), self.session_for(session_id, &task, None));
        }

        Ok(sessions
            .into_values()
            .filter(|s| user_id.is_none() || s.user_id() == user_id)
            .collect())
    }

    async fn terminate_session(&self, session_id: &str) -> ProviderResult<()> {
        let (mut session, task_arn) = match self.entry(session_id).await {
            Some(Entry::Tombstone(_)) => return Ok(()),
            Some(Entry::Live(record)) => (record.session, record.task_arn),
            None => match self.find_task(session_id).await? {
                Some(task) => (self.session_for(session_id, &task, None), task.task_arn),
                None => {
                    debug!("Session {} not found, nothing to terminate", session_id);
                    return Ok(());
                }
            },
        };

        self.transports.evict(&task_arn).await;
        match self.stop_task(&task_arn).await {
            Ok(()) => info!("Stopped task {} for session {}", short_task_id(&task_arn), session_id),
            Err(e) if e.is_not_found() => debug!("Task {} was already gone", task_arn),
            Err(e) => return Err(e),
        }

        session.status = SessionStatus::Terminated;
        {
            let ttl = self.tombstone_ttl;
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, entry| !matches!(entry, Entry::Tombstone(t) if t.expired(ttl)));
            sessions.insert(session_id.to_string(), Entry::Tombstone(Tombstone::new(session)));
        }
        self.events.emit(ProviderEvent::SessionTerminated {
            provider: ProviderKind::Ecs,
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn upload_files(&self, session_id: &str, files: &FileMap) -> ProviderResult<()> {
        let record = self.resolve(session_id).await?;
        let transport = self.transport(&record.task_arn).await?;
        upload_via(transport.as_ref(), files, None).await
    }

    async fn download_results(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> ProviderResult<FileMap> {
        let record = self.resolve(session_id).await?;
        let transport = self.transport(&record.task_arn).await?;
        download_via(transport.as_ref(), paths, None).await
    }
}

impl EcsProvider {
    async fn register_task_definition(&self) -> ProviderResult<()> {
        let image = self.config.image.clone().ok_or_else(|| ProviderError::SetupRequired {
            message: format!("task definition '{}' does not exist", self.config.task_definition),
            remediation: "set `image` so it can be registered".to_string(),
        })?;
        let family = self
            .config
            .task_definition
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let containers = json!([{
            "name": self.config.container_name,
            "image": image,
            "essential": true,
            "command": ["sleep", "infinity"],
            "linuxParameters": { "initProcessEnabled": true },
        }]);

        let mut args = vec![
            "ecs".to_string(),
            "register-task-definition".to_string(),
            "--family".to_string(),
            family.clone(),
            "--requires-compatibilities".to_string(),
            self.config.launch_type.clone(),
            "--network-mode".to_string(),
            "awsvpc".to_string(),
            "--cpu".to_string(),
            self.config.cpu.clone(),
            "--memory".to_string(),
            self.config.memory.clone(),
            "--container-definitions".to_string(),
            containers.to_string(),
        ];
        if let Some(role) = &self.config.execution_role_arn {
            args.extend(["--execution-role-arn".to_string(), role.clone()]);
        }
        if let Some(role) = &self.config.task_role_arn {
            args.extend(["--task-role-arn".to_string(), role.clone()]);
        }
        self.aws
            .call("ecs register-task-definition", args)
            .await
            .map_err(|e| e.into_provisioning("ECS task definition"))?;
        info!("Registered task definition family {}", family);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connector::testing::{ScriptedConnector, fail, ok};
    use crate::credentials::Credentials;

    const TASK_A: &str = "arn:aws:ecs:us-east-1:1:task/agents/aaa";
    const TASK_B: &str = "arn:aws:ecs:us-east-1:1:task/agents/bbb";

    fn config() -> EcsProviderConfig {
        toml::from_str(
            r#"
            region = "us-east-1"
            cluster = "agents"
            task_definition = "agent-runner"
            subnets = ["subnet-1"]
            "#,
        )
        .unwrap()
    }

    fn provider(connector: &Arc<ScriptedConnector>) -> (EcsProvider, tokio::sync::mpsc::UnboundedReceiver<ProviderEvent>) {
        let core = CoreConfig {
            poll_interval_secs: 0,
            max_poll_attempts: 4,
            ..Default::default()
        };
        let (events, rx) = EventSink::channel();
        let ctx = ProviderContext::new(Credentials::default())
            .with_connector(connector.clone())
            .with_events(events);
        (EcsProvider::new(config(), core, &ctx), rx)
    }

    fn service_json(name: &str) -> serde_json::Value {
        json!({
            "serviceName": name,
            "serviceArn": format!("arn:aws:ecs:us-east-1:1:service/agents/{}", name),
            "status": "ACTIVE",
            "networkConfiguration": {
                "awsvpcConfiguration": { "subnets": ["subnet-1"], "assignPublicIp": "ENABLED" }
            }
        })
    }

    fn task_json(arn: &str, status: &str, agent: &str, session: &str) -> serde_json::Value {
        json!({
            "taskArn": arn,
            "lastStatus": status,
            "group": "service:tasklift-github-com-acme-app",
            "containers": [{
                "name": "agent",
                "managedAgents": [{ "name": "ExecuteCommandAgent", "lastStatus": agent }]
            }],
            "tags": [
                { "key": "tasklift:project", "value": "tasklift" },
                { "key": "tasklift:session", "value": session },
                { "key": "tasklift:user", "value": "u1" }
            ]
        })
    }

    /// Cluster with no tasks and no services yet.
    fn empty_cluster(connector: &ScriptedConnector) {
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [] }))
            .on_json(&["ecs describe-services"], json!({ "services": [], "failures": [{ "reason": "MISSING" }] }));
    }

    #[test]
    fn test_task_status_map() {
        assert_eq!(map_ecs_task_status("PROVISIONING"), EnvironmentStatus::Starting);
        assert_eq!(map_ecs_task_status("ACTIVATING"), EnvironmentStatus::Starting);
        assert_eq!(map_ecs_task_status("RUNNING"), EnvironmentStatus::Running);
        assert_eq!(map_ecs_task_status("DEPROVISIONING"), EnvironmentStatus::Stopping);
        assert_eq!(map_ecs_task_status("STOPPED"), EnvironmentStatus::Stopped);
        assert_eq!(map_ecs_task_status("???"), EnvironmentStatus::Error);
    }

    #[test]
    fn test_started_by_is_capped() {
        let id = "x".repeat(80);
        assert_eq!(started_by(&id).len(), STARTED_BY_MAX);
        assert_eq!(short_task_id(TASK_A), "aaa");
    }

    #[tokio::test]
    async fn test_two_sessions_share_one_service() {
        let connector = Arc::new(ScriptedConnector::new());
        empty_cluster(&connector);
        connector
            .on_json(
                &["ecs create-service"],
                json!({ "service": service_json("tasklift-github-com-acme-app") }),
            )
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_A, "PROVISIONING", "PENDING", "s1")] }))
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_B, "PROVISIONING", "PENDING", "s2")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "PENDING", "PENDING", "s1")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "RUNNING", "PENDING", "s1")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "RUNNING", "RUNNING", "s1")] }));
        let (provider, mut rx) = provider(&connector);

        let repo = "https://github.com/acme/app.git";
        let first = provider
            .create_session(&SessionOptions::new("s1").repository(repo).user("u1"))
            .await
            .unwrap();
        let second = provider
            .create_session(&SessionOptions::new("s2").repository("git@github.com:acme/app.git"))
            .await
            .unwrap();

        assert_eq!(first.environment_id, "tasklift-github-com-acme-app");
        assert_eq!(first.environment_id, second.environment_id);
        assert_eq!(first.meta(meta::TASK), Some(TASK_A));
        assert_eq!(second.meta(meta::TASK), Some(TASK_B));
        assert_eq!(connector.calls_matching(&["ecs create-service"]), 1);
        assert_eq!(connector.calls_matching(&["ecs describe-services"]), 1);
        assert_eq!(connector.calls_matching(&["ecs run-task"]), 2);

        let run_task = connector
            .calls()
            .into_iter()
            .find(|c| c.args.contains(&"run-task".to_string()))
            .unwrap();
        let line = run_task.display();
        assert!(line.contains("--started-by s1"));
        assert!(line.contains("--group service:tasklift-github-com-acme-app"));
        assert!(line.contains("--enable-execute-command"));

        let mut created = 0;
        let mut reused = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProviderEvent::ServiceCreated { .. } => created += 1,
                ProviderEvent::ServiceReused { .. } => reused += 1,
                _ => {}
            }
        }
        assert_eq!((created, reused), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_create_service_once() {
        let connector = Arc::new(ScriptedConnector::new().with_delay(Duration::from_millis(20)));
        empty_cluster(&connector);
        connector
            .on_json(
                &["ecs create-service"],
                json!({ "service": service_json("tasklift-github-com-acme-app") }),
            )
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_A, "PROVISIONING", "PENDING", "s1")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "RUNNING", "RUNNING", "s1")] }));
        let (provider, _rx) = provider(&connector);

        let repo = "https://github.com/acme/app";
        let opts_a = SessionOptions::new("s1").repository(repo);
        let opts_b = SessionOptions::new("s2").repository(repo);
        let (a, b) = tokio::join!(
            provider.create_session(&opts_a),
            provider.create_session(&opts_b),
        );
        assert_eq!(a.unwrap().environment_id, b.unwrap().environment_id);
        assert_eq!(connector.calls_matching(&["ecs create-service"]), 1);
    }

    #[tokio::test]
    async fn test_already_exists_is_reloaded() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [] }))
            .on_json(&["ecs describe-services"], json!({ "services": [] }))
            .on_json(
                &["ecs describe-services"],
                json!({ "services": [service_json("tasklift-shared")] }),
            )
            .on(
                &["ecs create-service"],
                fail(254, "An error occurred (InvalidParameterException): Creation of service was not idempotent."),
            );
        let (provider, _rx) = provider(&connector);

        let handle = provider.get_or_create_service(None).await.unwrap();
        assert_eq!(handle.name, "tasklift-shared");
        assert_eq!(handle.repository_key, DEFAULT_REPOSITORY_KEY);
        assert_eq!(connector.calls_matching(&["ecs describe-services"]), 2);
    }

    #[tokio::test]
    async fn test_terminate_stops_only_the_task() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [] }))
            .on_json(
                &["ecs describe-services"],
                json!({ "services": [service_json("tasklift-github-com-acme-app")] }),
            )
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_A, "PROVISIONING", "PENDING", "s1")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "RUNNING", "RUNNING", "s1")] }))
            .on(&["ecs stop-task"], ok("{}"));
        let (provider, _rx) = provider(&connector);

        provider
            .create_session(&SessionOptions::new("s1").repository("https://github.com/acme/app"))
            .await
            .unwrap();
        provider.terminate_session("s1").await.unwrap();
        provider.terminate_session("s1").await.unwrap();

        assert_eq!(connector.calls_matching(&["ecs stop-task", TASK_A]), 1);
        assert_eq!(connector.calls_matching(&["delete-service"]), 0);
        assert_eq!(connector.calls_matching(&["update-service"]), 0);
        let status = provider.get_session_status("s1").await.unwrap();
        assert_eq!(status.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_expired_tombstones_are_dropped() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [] }))
            .on_json(
                &["ecs describe-services"],
                json!({ "services": [service_json("tasklift-shared")] }),
            )
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_A, "PROVISIONING", "PENDING", "s1")] }))
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_B, "PROVISIONING", "PENDING", "s2")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [task_json(TASK_A, "RUNNING", "RUNNING", "s1")] }))
            .on(&["ecs stop-task"], ok("{}"));
        let (provider, _rx) = provider(&connector);
        let provider = provider.with_tombstone_ttl(Duration::ZERO);

        for id in ["s1", "s2"] {
            provider.create_session(&SessionOptions::new(id)).await.unwrap();
            provider.terminate_session(id).await.unwrap();
        }

        let table = provider.sessions.lock().await;
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get("s2"), Some(Entry::Tombstone(_))));
        drop(table);
        assert_eq!(connector.calls_matching(&["ecs stop-task"]), 2);
    }

    #[tokio::test]
    async fn test_task_stopping_during_poll_is_terminal() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [] }))
            .on_json(
                &["ecs describe-services"],
                json!({ "services": [service_json("tasklift-shared")] }),
            )
            .on_json(&["ecs run-task"], json!({ "tasks": [task_json(TASK_A, "PROVISIONING", "PENDING", "s1")] }))
            .on_json(&["ecs describe-tasks"], json!({ "tasks": [{
                "taskArn": TASK_A,
                "lastStatus": "STOPPED",
                "stoppedReason": "CannotPullContainerError"
            }] }))
            .on(&["ecs stop-task"], ok("{}"));
        let (provider, _rx) = provider(&connector);

        let err = provider
            .create_session(&SessionOptions::new("s1"))
            .await
            .unwrap_err();
        match err {
            ProviderError::TerminalState { state, .. } => {
                assert!(state.contains("CannotPullContainerError"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(connector.calls_matching(&["ecs stop-task"]), 1);
    }

    #[tokio::test]
    async fn test_reattach_from_tags() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs list-tasks"], json!({ "taskArns": [TASK_A] }))
            .on_json(
                &["ecs describe-tasks", "TAGS"],
                json!({ "tasks": [task_json(TASK_A, "RUNNING", "RUNNING", "s1")] }),
            );
        let (provider, _rx) = provider(&connector);

        let session = provider.get_session_status("s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.meta(meta::TASK), Some(TASK_A));
        assert_eq!(session.environment_id, "tasklift-github-com-acme-app");

        let listed = provider.list_sessions(Some("u1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(provider.list_sessions(Some("someone-else")).await.unwrap().is_empty());

        let created = provider.create_session(&SessionOptions::new("s1")).await.unwrap();
        assert_eq!(created.meta(meta::TASK), Some(TASK_A));
        assert_eq!(connector.calls_matching(&["ecs run-task"]), 0);
    }

    #[tokio::test]
    async fn test_initialize_requires_active_cluster() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on_json(
            &["ecs describe-clusters"],
            json!({ "clusters": [{ "status": "INACTIVE" }] }),
        );
        let (provider, _rx) = provider(&connector);
        let err = provider.initialize().await.unwrap_err();
        assert!(matches!(err, ProviderError::SetupRequired { .. }));
    }

    #[tokio::test]
    async fn test_initialize_registers_missing_task_definition() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ecs describe-clusters"], json!({ "clusters": [{ "status": "ACTIVE" }] }))
            .on(
                &["ecs describe-task-definition"],
                fail(254, "An error occurred (ClientException): Unable to describe task definition."),
            )
            .on(&["ecs register-task-definition"], ok("{}"));
        let core = CoreConfig::default();
        let mut config = config();
        config.register_task_definition = true;
        config.image = Some("ghcr.io/acme/agent:latest".into());
        let ctx = ProviderContext::new(Credentials::default()).with_connector(connector.clone());
        let provider = EcsProvider::new(config, core, &ctx);

        provider.initialize().await.unwrap();
        assert_eq!(
            connector.calls_matching(&["ecs register-task-definition", "--family agent-runner"]),
            1
        );
    }

    #[tokio::test]
    async fn test_exec_transport_uses_execute_command() {
        let connector = Arc::new(ScriptedConnector::new());
        let (provider, _rx) = provider(&connector);
        let transport = provider.transport(TASK_A).await.unwrap();
        assert_eq!(transport.describe(), "ecs exec aaa");
    }
}
