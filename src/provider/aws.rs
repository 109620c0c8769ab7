//! Thin helper over the `aws` CLI shared by the EC2 and ECS providers.
//!
//! Every call appends `--output json --region <region>` and runs with the
//! credential environment from [`Credentials::aws_env`]. A non-zero exit is
//! classified into the error taxonomy here, so drivers only handle the
//! successful JSON.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;

use crate::connector::{CliCommand, CliOutput, Connector, classify_cli_failure};
use crate::credentials::Credentials;
use crate::provider::ProviderResult;

#[derive(Clone)]
pub struct AwsCli {
    connector: Arc<dyn Connector>,
    region: String,
    env: Vec<(String, String)>,
}

impl AwsCli {
    pub fn new(connector: Arc<dyn Connector>, region: &str, credentials: &Credentials) -> Self {
        Self {
            connector,
            region: region.to_string(),
            env: credentials.aws_env(region),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Environment for `aws` child processes outside the connector
    /// (`ecs execute-command` runs through the exec transport).
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    fn command<I, S>(&self, args: I) -> CliCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CliCommand::new("aws")
            .args(args)
            .args(["--output", "json", "--region"])
            .arg(self.region.clone())
            .envs(self.env.iter().cloned())
    }

    /// Runs one call. `action` names it in error messages (`ecs run-task`).
    pub async fn call<I, S>(&self, action: &str, args: I) -> ProviderResult<CliOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = self.connector.run(&self.command(args)).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_cli_failure(action, &output))
        }
    }

    pub async fn call_json<T, I, S>(&self, action: &str, args: I) -> ProviderResult<T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.call(action, args).await?.json()
    }
}

/// `[{"Key": .., "Value": ..}]`, as EC2 expects tags.
pub fn ec2_tags(labels: &[(String, String)]) -> serde_json::Value {
    labels
        .iter()
        .map(|(k, v)| json!({ "Key": k, "Value": v }))
        .collect()
}

/// `[{"key": .., "value": ..}]`, as ECS expects tags.
pub fn ecs_tags(labels: &[(String, String)]) -> serde_json::Value {
    labels
        .iter()
        .map(|(k, v)| json!({ "key": k, "value": v }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::{ScriptedConnector, fail, ok};
    use crate::provider::ProviderError;

    #[tokio::test]
    async fn test_call_appends_region_and_output() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on(&["sts get-caller-identity"], ok(r#"{"Account": "123"}"#));
        let aws = AwsCli::new(
            connector.clone(),
            "eu-west-1",
            &Credentials::default().set("AWS_PROFILE", "agents"),
        );

        let identity: serde_json::Value = aws
            .call_json("sts get-caller-identity", ["sts", "get-caller-identity"])
            .await
            .unwrap();
        assert_eq!(identity["Account"], "123");

        let calls = connector.calls();
        assert_eq!(
            calls[0].display(),
            "aws sts get-caller-identity --output json --region eu-west-1"
        );
        assert!(calls[0].env.contains(&("AWS_PROFILE".to_string(), "agents".to_string())));
        assert!(calls[0].env.contains(&("AWS_REGION".to_string(), "eu-west-1".to_string())));
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.on(
            &["ec2 run-instances"],
            fail(254, "An error occurred (UnauthorizedOperation) when calling the RunInstances operation"),
        );
        let aws = AwsCli::new(connector, "us-east-1", &Credentials::default());
        let err = aws
            .call("ec2 run-instances", ["ec2", "run-instances"])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Denied(_)));
    }

    #[test]
    fn test_tag_shapes() {
        let labels = vec![("tasklift:session".to_string(), "s1".to_string())];
        assert_eq!(ec2_tags(&labels)[0]["Key"], "tasklift:session");
        assert_eq!(ecs_tags(&labels)[0]["value"], "s1");
    }
}
