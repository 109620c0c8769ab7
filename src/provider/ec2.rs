//! EC2 driver: one instance per session, commands over SSH.
//!
//! Instances are launched with `aws ec2 run-instances`, tagged with the
//! project and session, and polled with `describe-instances` until they are
//! running with an address. A fixed grace period then gives sshd time to
//! start before the first command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::aws::{AwsCli, ec2_tags};
use super::{ProviderContext, ProviderError, ProviderKind, ProviderResult};
use crate::config::{CoreConfig, Ec2ProviderConfig};
use crate::credentials::KeyMaterial;
use crate::environment::{Environment, EnvironmentDriver, EnvironmentRequest, EnvironmentStatus, tags};
use crate::readiness::{PollPolicy, PollStatus, poll_until};
use crate::transport::{RemoteExec, SshTarget, SshTransport, TransportCache};

const META_PUBLIC_IP: &str = "public_ip";
const META_PRIVATE_IP: &str = "private_ip";
const META_INSTANCE_TYPE: &str = "instance_type";

/// Instance states listed for this project. Terminated ones are left out.
const LISTED_STATES: &str = "pending,running,shutting-down,stopping,stopped";

/// Maps an EC2 instance state name onto the environment state machine.
pub fn map_ec2_state(state: &str) -> EnvironmentStatus {
    match state {
        "pending" => EnvironmentStatus::Creating,
        "running" => EnvironmentStatus::Running,
        "shutting-down" | "stopping" => EnvironmentStatus::Stopping,
        "stopped" | "terminated" => EnvironmentStatus::Stopped,
        _ => EnvironmentStatus::Error,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    instance_type: Option<String>,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    launch_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

impl Instance {
    fn address(&self) -> Option<&str> {
        self.public_ip_address
            .as_deref()
            .or(self.private_ip_address.as_deref())
    }

    fn to_environment(&self) -> Environment {
        let mut environment = Environment::new(
            self.instance_id.clone(),
            ProviderKind::Ec2,
            map_ec2_state(&self.state.name),
        );
        if let Some(launched) = self.launch_time {
            environment.created_at = launched;
        }
        for tag in &self.tags {
            environment.metadata.insert(tag.key.clone(), tag.value.clone());
        }
        let extra = [
            (META_PUBLIC_IP, &self.public_ip_address),
            (META_PRIVATE_IP, &self.private_ip_address),
            (META_INSTANCE_TYPE, &self.instance_type),
        ];
        for (key, value) in extra {
            if let Some(value) = value {
                environment.metadata.insert(key.to_string(), value.clone());
            }
        }
        environment
    }
}

pub struct Ec2Driver {
    config: Ec2ProviderConfig,
    aws: AwsCli,
    policy: PollPolicy,
    ssh_grace: Duration,
    project: String,
    key: Option<KeyMaterial>,
    transports: TransportCache,
}

impl Ec2Driver {
    pub fn new(
        config: Ec2ProviderConfig,
        core: &CoreConfig,
        ctx: &ProviderContext,
        key: Option<KeyMaterial>,
    ) -> Self {
        let aws = AwsCli::new(ctx.connector.clone(), &config.region, &ctx.credentials);
        Self {
            config,
            aws,
            policy: core.poll_policy(),
            ssh_grace: core.ssh_grace(),
            project: core.project_tag.clone(),
            key,
            transports: TransportCache::new(),
        }
    }

    async fn resolve_ami(&self, request: &EnvironmentRequest) -> ProviderResult<String> {
        if let Some(ami) = request.resources.image.as_ref().or(self.config.ami.as_ref()) {
            return Ok(ami.clone());
        }
        debug!("Resolving AMI from {}", self.config.ami_parameter);
        let output: serde_json::Value = self
            .aws
            .call_json(
                "ssm get-parameter",
                ["ssm", "get-parameter", "--name", self.config.ami_parameter.as_str()],
            )
            .await?;
        output["Parameter"]["Value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::SetupRequired {
                    message: format!("SSM parameter {} holds no AMI ID", self.config.ami_parameter),
                    remediation: "set `ami` in the provider config".to_string(),
                }
            })
    }

    fn run_instances_args(&self, request: &EnvironmentRequest, ami: &str) -> Vec<String> {
        let instance_type = request
            .resources
            .machine
            .clone()
            .unwrap_or_else(|| self.config.instance_type.clone());

        let mut labels = request.tags(&self.project);
        labels.push(("Name".to_string(), format!("{}-{}", self.project, request.session_id)));
        let tag_specifications = json!([
            { "ResourceType": "instance", "Tags": ec2_tags(&labels) },
            { "ResourceType": "volume", "Tags": ec2_tags(&labels) },
        ]);
        let block_devices = json!([{
            "DeviceName": "/dev/sda1",
            "Ebs": {
                "VolumeSize": self.config.volume_size_gb,
                "VolumeType": "gp3",
                "DeleteOnTermination": true,
            }
        }]);

        let mut args: Vec<String> = vec![
            "ec2".into(),
            "run-instances".into(),
            "--image-id".into(),
            ami.to_string(),
            "--instance-type".into(),
            instance_type,
            "--count".into(),
            "1".into(),
            "--tag-specifications".into(),
            tag_specifications.to_string(),
            "--block-device-mappings".into(),
            block_devices.to_string(),
        ];
        if !self.config.key_name.is_empty() {
            args.push("--key-name".into());
            args.push(self.config.key_name.clone());
        }
        if !self.config.security_group_ids.is_empty() {
            args.push("--security-group-ids".into());
            args.extend(self.config.security_group_ids.iter().cloned());
        }
        if let Some(subnet) = &self.config.subnet_id {
            args.push("--subnet-id".into());
            args.push(subnet.clone());
        }
        if let Some(profile) = &self.config.iam_instance_profile {
            args.push("--iam-instance-profile".into());
            args.push(format!("Name={}", profile));
        }
        if request.resources.spot.unwrap_or(self.config.use_spot) {
            let mut spot = json!({
                "SpotInstanceType": "one-time",
                "InstanceInterruptionBehavior": "terminate",
            });
            if let Some(price) = &self.config.spot_max_price {
                spot["MaxPrice"] = json!(price);
            }
            args.push("--instance-market-options".into());
            args.push(json!({ "MarketType": "spot", "SpotOptions": spot }).to_string());
        }
        if let Some(user_data) = &self.config.user_data {
            args.push("--user-data".into());
            args.push(user_data.clone());
        }
        args
    }

    async fn describe(&self, instance_id: &str) -> ProviderResult<Instance> {
        let output: DescribeInstancesOutput = self
            .aws
            .call_json(
                "ec2 describe-instances",
                ["ec2", "describe-instances", "--instance-ids", instance_id],
            )
            .await?;
        output
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))
    }

    async fn wait_until_running(&self, instance_id: &str) -> ProviderResult<Instance> {
        poll_until(
            &format!("instance {}", instance_id),
            &self.policy,
            None,
            |_| async move {
                let instance = match self.describe(instance_id).await {
                    Ok(instance) => instance,
                    // Freshly launched IDs can lag behind in describe calls.
                    Err(e) if e.is_not_found() => {
                        return Ok(PollStatus::Pending("not yet visible".to_string()));
                    }
                    Err(e) => return Err(e),
                };
                let state = instance.state.name.clone();
                Ok(match map_ec2_state(&state) {
                    EnvironmentStatus::Running if instance.address().is_some() => {
                        PollStatus::Ready(instance)
                    }
                    EnvironmentStatus::Creating
                    | EnvironmentStatus::Starting
                    | EnvironmentStatus::Running => PollStatus::Pending(state),
                    _ => PollStatus::Terminal(state),
                })
            },
        )
        .await
    }

    async fn terminate(&self, instance_id: &str) -> ProviderResult<()> {
        self.aws
            .call(
                "ec2 terminate-instances",
                ["ec2", "terminate-instances", "--instance-ids", instance_id],
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl EnvironmentDriver for Ec2Driver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ec2
    }

    async fn preflight(&self) -> ProviderResult<()> {
        let identity: serde_json::Value = self
            .aws
            .call_json("sts get-caller-identity", ["sts", "get-caller-identity"])
            .await?;
        debug!(
            "AWS identity: {}",
            identity["Arn"].as_str().unwrap_or("unknown")
        );

        if !self.config.key_name.is_empty() {
            let result = self
                .aws
                .call(
                    "ec2 describe-key-pairs",
                    ["ec2", "describe-key-pairs", "--key-names", self.config.key_name.as_str()],
                )
                .await;
            if let Err(e) = result {
                return Err(match e {
                    ProviderError::NotFound(_) => ProviderError::SetupRequired {
                        message: format!(
                            "key pair '{}' does not exist in {}",
                            self.config.key_name,
                            self.aws.region()
                        ),
                        remediation: "create or import the key pair, or fix `key_name`".to_string(),
                    },
                    other => other,
                });
            }
        }

        if !self.config.security_group_ids.is_empty() {
            let mut args = vec![
                "ec2".to_string(),
                "describe-security-groups".to_string(),
                "--group-ids".to_string(),
            ];
            args.extend(self.config.security_group_ids.iter().cloned());
            if let Err(e) = self.aws.call("ec2 describe-security-groups", args).await {
                return Err(match e {
                    ProviderError::NotFound(message) => ProviderError::SetupRequired {
                        message,
                        remediation: "create the security groups or fix `security_group_ids`"
                            .to_string(),
                    },
                    other => other,
                });
            }
        }

        info!("EC2 provider ready in {}", self.aws.region());
        Ok(())
    }

    async fn create_environment(&self, request: &EnvironmentRequest) -> ProviderResult<Environment> {
        let ami = self.resolve_ami(request).await?;
        let args = self.run_instances_args(request, &ami);

        info!("Launching EC2 instance for session {}", request.session_id);
        let launched: RunInstancesOutput = self
            .aws
            .call_json("ec2 run-instances", args)
            .await
            .map_err(|e| e.into_provisioning("EC2 instance"))?;
        let instance_id = launched
            .instances
            .first()
            .map(|i| i.instance_id.clone())
            .ok_or_else(|| ProviderError::provisioning("EC2 instance", "run-instances returned no instance"))?;
        info!("Launched {}, waiting for it to run", instance_id);

        let instance = match self.wait_until_running(&instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!("Instance {} did not become ready: {}", instance_id, e);
                if let Err(cleanup) = self.terminate(&instance_id).await {
                    warn!("Failed to terminate {}: {}", instance_id, cleanup);
                }
                return Err(e);
            }
        };

        if !self.ssh_grace.is_zero() {
            info!(
                "Instance {} is running, waiting {}s for sshd",
                instance_id,
                self.ssh_grace.as_secs()
            );
            tokio::time::sleep(self.ssh_grace).await;
        }

        let mut environment = instance.to_environment();
        // Tags only show up on describe once propagated; keep the request's.
        environment.metadata.extend(request.tags(&self.project));
        Ok(environment)
    }

    async fn destroy_environment(&self, environment_id: &str) -> ProviderResult<()> {
        self.transports.evict(environment_id).await;
        match self.terminate(environment_id).await {
            Ok(()) => {
                info!("Terminated instance {}", environment_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn environment_status(&self, environment_id: &str) -> ProviderResult<Environment> {
        Ok(self.describe(environment_id).await?.to_environment())
    }

    async fn list_environments(&self) -> ProviderResult<Vec<Environment>> {
        let output: DescribeInstancesOutput = self
            .aws
            .call_json(
                "ec2 describe-instances",
                [
                    "ec2".to_string(),
                    "describe-instances".to_string(),
                    "--filters".to_string(),
                    format!("Name=tag:{},Values={}", tags::PROJECT, self.project),
                    format!("Name=instance-state-name,Values={}", LISTED_STATES),
                ],
            )
            .await?;
        Ok(output
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|i| i.to_environment())
            .collect())
    }

    async fn transport(&self, environment: &Environment) -> ProviderResult<Arc<dyn RemoteExec>> {
        let host = environment
            .meta(META_PUBLIC_IP)
            .or(environment.meta(META_PRIVATE_IP))
            .ok_or_else(|| {
                ProviderError::Connection(format!("instance {} has no IP address", environment.id))
            })?
            .to_string();
        let target = SshTarget {
            host,
            port: self.config.ssh_port,
            user: self.config.ssh_user.clone(),
        };
        self.transports
            .get_or_insert_with(&environment.id, || {
                Ok(Arc::new(SshTransport::new(target, self.key.as_ref())?) as Arc<dyn RemoteExec>)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::{ScriptedConnector, fail, ok};
    use crate::credentials::Credentials;
    use crate::provider::Resources;

    fn config() -> Ec2ProviderConfig {
        toml::from_str(
            r#"
            region = "us-east-1"
            key_name = "agents"
            security_group_ids = ["sg-1"]
            "#,
        )
        .unwrap()
    }

    fn driver(connector: &Arc<ScriptedConnector>, config: Ec2ProviderConfig) -> Ec2Driver {
        let core = CoreConfig {
            poll_interval_secs: 0,
            max_poll_attempts: 5,
            ssh_grace_secs: 0,
            ..Default::default()
        };
        let ctx = ProviderContext::new(Credentials::default()).with_connector(connector.clone());
        Ec2Driver::new(config, &core, &ctx, None)
    }

    fn instance_json(state: &str, ip: Option<&str>) -> String {
        let mut instance = json!({
            "InstanceId": "i-0abc",
            "State": { "Name": state },
            "InstanceType": "t3.medium",
            "LaunchTime": "2024-05-01T12:00:00+00:00",
            "Tags": [{ "Key": "tasklift:session", "Value": "s1" }],
        });
        if let Some(ip) = ip {
            instance["PublicIpAddress"] = json!(ip);
        }
        json!({ "Reservations": [{ "Instances": [instance] }] }).to_string()
    }

    fn request() -> EnvironmentRequest {
        EnvironmentRequest {
            session_id: "s1".into(),
            user_id: Some("u1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_map() {
        assert_eq!(map_ec2_state("pending"), EnvironmentStatus::Creating);
        assert_eq!(map_ec2_state("running"), EnvironmentStatus::Running);
        assert_eq!(map_ec2_state("stopping"), EnvironmentStatus::Stopping);
        assert_eq!(map_ec2_state("shutting-down"), EnvironmentStatus::Stopping);
        assert_eq!(map_ec2_state("terminated"), EnvironmentStatus::Stopped);
        assert_eq!(map_ec2_state("rebooting"), EnvironmentStatus::Error);
    }

    #[tokio::test]
    async fn test_create_polls_until_running_with_address() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["ssm get-parameter"], json!({ "Parameter": { "Value": "ami-123" } }))
            .on(&["ec2 run-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 describe-instances"], fail(254, "InvalidInstanceID.NotFound"))
            .on(&["ec2 describe-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 describe-instances"], ok(instance_json("running", None)))
            .on(&["ec2 describe-instances"], ok(instance_json("running", Some("3.4.5.6"))));
        let driver = driver(&connector, config());

        let environment = driver.create_environment(&request()).await.unwrap();
        assert_eq!(environment.id, "i-0abc");
        assert_eq!(environment.status, EnvironmentStatus::Running);
        assert_eq!(environment.meta(META_PUBLIC_IP), Some("3.4.5.6"));
        assert_eq!(environment.meta(tags::USER), Some("u1"));
        assert_eq!(connector.calls_matching(&["ec2 describe-instances"]), 4);

        let launch = connector
            .calls()
            .into_iter()
            .find(|c| c.args.contains(&"run-instances".to_string()))
            .unwrap();
        let line = launch.display();
        assert!(line.contains("--image-id ami-123"));
        assert!(line.contains("tasklift:session"));
        assert!(line.contains("--key-name agents"));
        assert!(!line.contains("--instance-market-options"));

        let transport = driver.transport(&environment).await.unwrap();
        assert_eq!(transport.describe(), "ssh ubuntu@3.4.5.6");
    }

    #[tokio::test]
    async fn test_spot_and_overrides() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on(&["ec2 run-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 describe-instances"], ok(instance_json("running", Some("3.4.5.6"))));
        let mut config = config();
        config.spot_max_price = Some("0.05".into());
        let driver = driver(&connector, config);

        let mut request = request();
        request.resources = Resources {
            machine: Some("c6i.xlarge".into()),
            image: Some("ami-custom".into()),
            spot: Some(true),
            ..Default::default()
        };
        driver.create_environment(&request).await.unwrap();

        assert_eq!(connector.calls_matching(&["ssm get-parameter"]), 0);
        let line = connector.calls()[0].display();
        assert!(line.contains("--image-id ami-custom"));
        assert!(line.contains("--instance-type c6i.xlarge"));
        assert!(line.contains("--instance-market-options"));
        assert!(line.contains("0.05"));
    }

    #[tokio::test]
    async fn test_terminal_state_aborts_and_cleans_up() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on(&["ec2 run-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 describe-instances"], ok(instance_json("terminated", None)))
            .on(&["ec2 terminate-instances"], ok("{}"));
        let driver = driver(&connector, config());

        let err = driver.create_environment(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::TerminalState { ref state, .. } if state == "terminated"));
        assert_eq!(connector.calls_matching(&["ec2 describe-instances"]), 1);
        assert_eq!(connector.calls_matching(&["ec2 terminate-instances", "i-0abc"]), 1);
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on(&["ec2 run-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 describe-instances"], ok(instance_json("pending", None)))
            .on(&["ec2 terminate-instances"], ok("{}"));
        let driver = driver(&connector, config());

        let err = driver.create_environment(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ReadinessTimeout { attempts: 5, .. }));
        assert_eq!(connector.calls_matching(&["ec2 describe-instances"]), 5);
    }

    #[tokio::test]
    async fn test_quota_error_on_launch() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on(
            &["ec2 run-instances"],
            fail(254, "An error occurred (VcpuLimitExceeded) when calling the RunInstances operation"),
        );
        let driver = driver(&connector, config());
        let err = driver.create_environment(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Denied(_)));
        assert_eq!(connector.calls_matching(&["ec2 run-instances"]), 1);
    }

    #[tokio::test]
    async fn test_destroy_missing_instance_is_ok() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on(
            &["ec2 terminate-instances"],
            fail(254, "An error occurred (InvalidInstanceID.NotFound)"),
        );
        let driver = driver(&connector, config());
        driver.destroy_environment("i-gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_reports_missing_key_pair() {
        let connector = Arc::new(ScriptedConnector::new());
        connector
            .on_json(&["sts get-caller-identity"], json!({ "Arn": "arn:aws:iam::1:user/x" }))
            .on(
                &["ec2 describe-key-pairs"],
                fail(254, "An error occurred (InvalidKeyPair.NotFound) when calling DescribeKeyPairs"),
            );
        let driver = driver(&connector, config());
        let err = driver.preflight().await.unwrap_err();
        assert!(matches!(err, ProviderError::SetupRequired { .. }));
    }

    #[tokio::test]
    async fn test_list_filters_by_project_tag() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on(&["ec2 describe-instances"], ok(instance_json("running", Some("1.1.1.1"))));
        let driver = driver(&connector, config());
        let environments = driver.list_environments().await.unwrap();
        assert_eq!(environments.len(), 1);
        assert_eq!(environments[0].session_id(), Some("s1"));
        let line = connector.calls()[0].display();
        assert!(line.contains("Name=tag:tasklift:project,Values=tasklift"));
    }
}
