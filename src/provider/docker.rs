//! Docker driver: one labelled container per session.
//!
//! Containers idle on `sleep infinity`; commands run through exec instances
//! wrapped in the same process-group reporter the other transports use, so a
//! timed-out command can be killed with a second exec. Files move as tar
//! archives through the container filesystem API.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::ContainerInspectResponse;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{OutputCallback, ProviderError, ProviderKind, ProviderResult};
use crate::config::{CoreConfig, DockerProviderConfig};
use crate::environment::{Environment, EnvironmentDriver, EnvironmentRequest, EnvironmentStatus, tags};
use crate::readiness::{PollPolicy, PollStatus, poll_until};
use crate::transport::{
    ExecOutcome, ExecRequest, OutputCapture, RemoteExec, TransportCache, kill_group_command,
    wrap_command,
};

const META_IMAGE: &str = "image";

/// Maps a Docker container state onto the environment state machine.
pub fn map_docker_state(state: &str) -> EnvironmentStatus {
    match state {
        "created" => EnvironmentStatus::Creating,
        "restarting" => EnvironmentStatus::Starting,
        "running" => EnvironmentStatus::Running,
        "paused" | "removing" => EnvironmentStatus::Stopping,
        "exited" => EnvironmentStatus::Stopped,
        _ => EnvironmentStatus::Error,
    }
}

/// `<project>-<session>-<digest>` reduced to the characters Docker accepts
/// in names. The digest of the raw session ID keeps sessions that sanitize
/// to the same text apart.
pub fn container_name(project: &str, session_id: &str) -> String {
    let readable: String = format!("{}-{}", project, session_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = Sha256::digest(session_id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", readable, suffix)
}

fn docker_error(action: &str, e: DockerError) -> ProviderError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(format!("{}: {}", action, message)),
        DockerError::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => ProviderError::Denied(format!("{}: {}", action, message)),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ProviderError::Execution {
            message: format!("{}: {}", action, message),
            exit_code: None,
            stderr: format!("HTTP {}", status_code),
        },
        other => ProviderError::Connection(format!("{}: {}", action, other)),
    }
}

fn is_conflict(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

fn inspect_to_environment(inspect: &ContainerInspectResponse) -> Environment {
    let name = inspect
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let state = inspect
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let mut environment = Environment::new(name, ProviderKind::Docker, map_docker_state(&state));
    if let Some(created) = inspect
        .created
        .as_deref()
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
    {
        environment.created_at = created.with_timezone(&chrono::Utc);
    }
    if let Some(config) = &inspect.config {
        if let Some(labels) = &config.labels {
            environment
                .metadata
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(image) = &config.image {
            environment
                .metadata
                .insert(META_IMAGE.to_string(), image.clone());
        }
    }
    environment
}

/// A one-file tar archive, entry path relative to `/`.
fn file_archive(path: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, path.trim_start_matches('/'), content)?;
    archive.into_inner()
}

/// Contents of `path` from a download archive.
///
/// Docker archives a file under its base name. Anything else (a directory,
/// several entries, a different name) is treated like a missing file.
fn archived_file(archive: &[u8], path: &str) -> std::io::Result<Option<Vec<u8>>> {
    let Some(name) = Path::new(path.trim_end_matches('/')).file_name() else {
        return Ok(None);
    };
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive.entries()?;
    let Some(entry) = entries.next() else {
        return Ok(None);
    };
    let mut entry = entry?;
    if !entry.header().entry_type().is_file() || entry.path()?.as_os_str() != name {
        return Ok(None);
    }
    let mut content = Vec::new();
    entry.read_to_end(&mut content)?;
    drop(entry);
    if entries.next().is_some() {
        return Ok(None);
    }
    Ok(Some(content))
}

pub struct DockerDriver {
    docker: Docker,
    config: DockerProviderConfig,
    policy: PollPolicy,
    project: String,
    transports: TransportCache,
}

impl DockerDriver {
    pub fn new(config: DockerProviderConfig, core: &CoreConfig) -> ProviderResult<Self> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProviderError::Configuration(format!("docker_host {}: {}", host, e)))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| ProviderError::Configuration(format!("Docker daemon: {}", e)))?
        };

        Ok(Self {
            docker,
            config,
            policy: core.poll_policy(),
            project: core.project_tag.clone(),
            transports: TransportCache::new(),
        })
    }

    async fn ensure_image(&self, image: &str) -> ProviderResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) => match docker_error("inspect image", e) {
                ProviderError::NotFound(_) => {}
                other => debug!("Could not inspect {} ({}), pulling", image, other),
            },
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| docker_error("pull image", e))?;
            if let Some(status) = progress.status {
                debug!("{}: {}", image, status);
            }
        }
        Ok(())
    }

    fn container_config(&self, request: &EnvironmentRequest, image: &str) -> ContainerConfig<String> {
        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        env.push(format!("TASKLIFT_SESSION_ID={}", request.session_id));

        let mut host_config = bollard::models::HostConfig {
            binds: Some(self.config.volumes.clone()),
            network_mode: Some(self.config.network_mode.clone()),
            ..Default::default()
        };
        if let Some(cpu) = self.config.resources.cpu_limit {
            host_config.cpu_period = Some(100_000);
            host_config.cpu_quota = Some((cpu * 100_000.0) as i64);
        }
        if let Some(memory) = self.config.resources.memory_limit {
            host_config.memory = Some(memory);
        }

        let labels: HashMap<String, String> = request.tags(&self.project).into_iter().collect();
        ContainerConfig {
            image: Some(image.to_string()),
            env: Some(env),
            working_dir: self.config.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn inspect(&self, name: &str) -> ProviderResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_error("inspect container", e))
    }

    async fn remove(&self, name: &str) -> ProviderResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error("remove container", e))
    }

    async fn create_container(&self, name: &str, config: ContainerConfig<String>) -> ProviderResult<()> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        match self.docker.create_container(Some(options.clone()), config.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                // A leftover from an earlier session with the same ID.
                let existing = inspect_to_environment(&self.inspect(name).await?);
                if !existing.status.is_terminal() {
                    return Err(ProviderError::provisioning(
                        "Docker container",
                        format!("{} already exists and is {}", name, existing.status),
                    ));
                }
                info!("Removing stale container {}", name);
                self.remove(name).await?;
                self.docker
                    .create_container(Some(options), config)
                    .await
                    .map(|_| ())
                    .map_err(|e| docker_error("create container", e))
            }
            Err(e) => Err(docker_error("create container", e)),
        }
    }

    async fn wait_until_running(&self, name: &str) -> ProviderResult<Environment> {
        poll_until(&format!("container {}", name), &self.policy, None, |_| async move {
            let environment = inspect_to_environment(&self.inspect(name).await?);
            Ok(match environment.status {
                EnvironmentStatus::Running => PollStatus::Ready(environment),
                EnvironmentStatus::Creating | EnvironmentStatus::Starting => {
                    PollStatus::Pending(environment.status.to_string())
                }
                other => PollStatus::Terminal(other.to_string()),
            })
        })
        .await
    }
}

#[async_trait]
impl EnvironmentDriver for DockerDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn preflight(&self) -> ProviderResult<()> {
        self.docker.ping().await.map_err(|e| ProviderError::SetupRequired {
            message: format!("Docker daemon is not reachable: {}", e),
            remediation: "start Docker or set `docker_host`".to_string(),
        })?;
        self.ensure_image(&self.config.image).await?;
        info!("Docker provider ready with image {}", self.config.image);
        Ok(())
    }

    async fn create_environment(&self, request: &EnvironmentRequest) -> ProviderResult<Environment> {
        let image = request
            .resources
            .image
            .clone()
            .unwrap_or_else(|| self.config.image.clone());
        self.ensure_image(&image)
            .await
            .map_err(|e| e.into_provisioning("Docker image"))?;

        let name = container_name(&self.project, &request.session_id);
        info!("Creating container {} from {}", name, image);
        self.create_container(&name, self.container_config(request, &image))
            .await
            .map_err(|e| e.into_provisioning("Docker container"))?;

        let started = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_error("start container", e).into_provisioning("Docker container"));
        let ready = match started {
            Ok(()) => self.wait_until_running(&name).await,
            Err(e) => Err(e),
        };

        match ready {
            Ok(environment) => Ok(environment),
            Err(e) => {
                warn!("Container {} did not start: {}", name, e);
                if let Err(cleanup) = self.remove(&name).await {
                    warn!("Failed to remove container {}: {}", name, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn destroy_environment(&self, environment_id: &str) -> ProviderResult<()> {
        self.transports.evict(environment_id).await;
        match self.remove(environment_id).await {
            Ok(()) => {
                info!("Removed container {}", environment_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn environment_status(&self, environment_id: &str) -> ProviderResult<Environment> {
        Ok(inspect_to_environment(&self.inspect(environment_id).await?))
    }

    async fn list_environments(&self) -> ProviderResult<Vec<Environment>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", tags::PROJECT, self.project)],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c.names?.first()?.trim_start_matches('/').to_string();
                let mut environment = Environment::new(
                    name,
                    ProviderKind::Docker,
                    map_docker_state(c.state.as_deref().unwrap_or_default()),
                );
                if let Some(created) = c.created.and_then(|s| chrono::DateTime::from_timestamp(s, 0)) {
                    environment.created_at = created;
                }
                environment.metadata.extend(c.labels.unwrap_or_default());
                if let Some(image) = c.image {
                    environment.metadata.insert(META_IMAGE.to_string(), image);
                }
                Some(environment)
            })
            .collect())
    }

    async fn transport(&self, environment: &Environment) -> ProviderResult<Arc<dyn RemoteExec>> {
        self.transports
            .get_or_insert_with(&environment.id, || {
                Ok(Arc::new(DockerExec {
                    docker: self.docker.clone(),
                    container: environment.id.clone(),
                    exec_lock: Mutex::new(()),
                }) as Arc<dyn RemoteExec>)
            })
            .await
    }

    fn default_working_dir(&self, _environment: &Environment) -> Option<String> {
        self.config.working_dir.clone()
    }
}

/// Exec transport into one container.
pub struct DockerExec {
    docker: Docker,
    container: String,
    exec_lock: Mutex<()>,
}

impl DockerExec {
    async fn start(&self, script: String) -> ProviderResult<(String, StartExecResults)> {
        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error("create exec", e))?;
        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error("start exec", e))?;
        Ok((exec.id, results))
    }

    async fn exit_code(&self, exec_id: &str) -> ProviderResult<Option<i32>> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| docker_error("inspect exec", e))?;
        Ok(inspect.exit_code.map(|c| c as i32))
    }

    async fn kill_group(&self, pgid: i32) {
        debug!("Killing process group {} in {}", pgid, self.container);
        match self.start(kill_group_command(pgid)).await {
            Ok((_, StartExecResults::Attached { mut output, .. })) => {
                while output.next().await.is_some() {}
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
        }
    }
}

#[async_trait]
impl RemoteExec for DockerExec {
    fn describe(&self) -> String {
        format!("docker {}", self.container)
    }

    async fn exec(
        &self,
        request: &ExecRequest,
        sink: Option<&OutputCallback>,
    ) -> ProviderResult<ExecOutcome> {
        let _guard = self.exec_lock.lock().await;
        if request.interactive {
            debug!("Docker exec has no terminal attached, running {} non-interactively", self.container);
        }

        let started_at = Instant::now();
        let (exec_id, results) = self.start(wrap_command(request)?).await?;
        let mut capture = OutputCapture::new(sink, &[]);
        let StartExecResults::Attached { mut output, .. } = results else {
            return Err(ProviderError::Connection(format!(
                "exec in {} started detached",
                self.container
            )));
        };

        let drained = tokio::time::timeout(request.timeout, async {
            while let Some(message) = output.next().await {
                match message {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        capture.chunk(false, &message)
                    }
                    Ok(LogOutput::StdErr { message }) => capture.chunk(true, &message),
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => return Err(docker_error("exec output", e)),
                }
            }
            Ok(())
        })
        .await;

        match drained {
            Ok(Ok(())) => {
                capture.flush();
                let exit_code = match capture.exit {
                    Some(code) => Some(code),
                    None => self.exit_code(&exec_id).await?,
                };
                Ok(capture.into_outcome(exit_code, started_at.elapsed(), false))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                capture.flush();
                match capture.pgid {
                    Some(pgid) => self.kill_group(pgid).await,
                    None => warn!("Timed out before {} reported a process group", self.container),
                }
                Ok(capture.into_outcome(None, started_at.elapsed(), true))
            }
        }
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> ProviderResult<()> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let archive = file_archive(&path, content)?;
        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| docker_error("upload", e))
    }

    async fn download_file(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        let mut stream = self.docker.download_from_container(
            &self.container,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) => {
                    return match docker_error("download", e) {
                        ProviderError::NotFound(_) => Ok(None),
                        other => Err(other),
                    };
                }
            }
        }
        let file = archived_file(&archive, path)?;
        if file.is_none() {
            debug!("{} in {} is not a single regular file", path, self.container);
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const LIVE_TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_state_map() {
        assert_eq!(map_docker_state("created"), EnvironmentStatus::Creating);
        assert_eq!(map_docker_state("restarting"), EnvironmentStatus::Starting);
        assert_eq!(map_docker_state("running"), EnvironmentStatus::Running);
        assert_eq!(map_docker_state("paused"), EnvironmentStatus::Stopping);
        assert_eq!(map_docker_state("exited"), EnvironmentStatus::Stopped);
        assert_eq!(map_docker_state("dead"), EnvironmentStatus::Error);
        assert_eq!(map_docker_state(""), EnvironmentStatus::Error);
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let name = container_name("tasklift", "task 42/a");
        assert!(name.starts_with("tasklift-task-42-a-"));
        assert_eq!(name.len(), "tasklift-task-42-a-".len() + 8);
        assert!(container_name("tasklift", "s1.v2_x").starts_with("tasklift-s1.v2_x-"));
        assert_ne!(container_name("tasklift", "a/b"), container_name("tasklift", "a-b"));
        assert_eq!(container_name("tasklift", "a/b"), container_name("tasklift", "a/b"));
    }

    fn archive_of(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            match content {
                Some(bytes) => {
                    header.set_size(bytes.len() as u64);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, name, *bytes).unwrap();
                }
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder.append_data(&mut header, name, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_archived_file() {
        let single = archive_of(&[("result.txt", Some(&b"done\n"[..]))]);
        assert_eq!(
            archived_file(&single, "/work/out/result.txt").unwrap().as_deref(),
            Some(&b"done\n"[..])
        );
        assert_eq!(archived_file(&single, "/work/out/other.txt").unwrap(), None);

        let directory = archive_of(&[("out/", None), ("out/result.txt", Some(&b"done\n"[..]))]);
        assert_eq!(archived_file(&directory, "/work/out").unwrap(), None);
        assert_eq!(archived_file(&directory, "/work/out/").unwrap(), None);

        let several = archive_of(&[("result.txt", Some(&b"a"[..])), ("extra.txt", Some(&b"b"[..]))]);
        assert_eq!(archived_file(&several, "/work/result.txt").unwrap(), None);

        let empty = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert_eq!(archived_file(&empty, "/work/result.txt").unwrap(), None);
    }

    #[test]
    fn test_error_mapping() {
        let missing = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: x".to_string(),
        };
        assert!(docker_error("inspect", missing).is_not_found());

        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(is_conflict(&conflict));
        assert!(matches!(
            docker_error("create", conflict),
            ProviderError::Execution { .. }
        ));
    }

    /// Needs a Docker daemon and the `alpine` image; run with `--ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_live_exec_and_files() {
        let config: DockerProviderConfig = toml::from_str(r#"image = "alpine:3.20""#).unwrap();
        let driver = DockerDriver::new(config, &CoreConfig::default()).unwrap();
        driver.preflight().await.unwrap();
        let request = EnvironmentRequest {
            session_id: format!("test-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let environment = driver.create_environment(&request).await.unwrap();
        let transport = driver.transport(&environment).await.unwrap();

        let outcome = transport
            .exec(&ExecRequest::new("echo hi; exit 3", LIVE_TIMEOUT), None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "hi");
        assert_eq!(outcome.exit_code, Some(3));

        transport.upload_file("/tmp/a/b.txt", b"payload").await.unwrap();
        let back = transport.download_file("/tmp/a/b.txt").await.unwrap();
        assert_eq!(back.as_deref(), Some(&b"payload"[..]));
        assert_eq!(transport.download_file("/tmp/missing").await.unwrap(), None);

        let outcome = transport
            .exec(&ExecRequest::new("sleep 60", Duration::from_secs(1)), None)
            .await
            .unwrap();
        assert!(outcome.timed_out);

        driver.destroy_environment(&environment.id).await.unwrap();
        driver.destroy_environment(&environment.id).await.unwrap();
    }
}
