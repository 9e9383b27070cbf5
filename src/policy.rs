use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

use crate::context::DeploymentContext;
use crate::template::{self, TemplateRenderer};

pub const POLICY_VERSION: &str = "2012-10-17";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Resource pattern `{0}` is not fully qualified")]
    Unqualified(String),

    #[error("Policy template {path} is not a valid policy document: {reason}")]
    InvalidDocument { path: String, reason: String },

    #[error(transparent)]
    Template(#[from] template::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "Service")]
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    pub effect: Effect,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,

    #[serde(rename = "Action", deserialize_with = "one_or_many")]
    pub actions: Vec<String>,

    #[serde(
        rename = "Resource",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resources: Vec<String>,
}

impl PolicyStatement {
    pub fn allow<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        return Self {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        };
    }

    pub fn deny<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        return Self {
            effect: Effect::Deny,
            ..Self::allow(actions, resources)
        };
    }

    /// Trust statement letting an AWS service assume a role.
    pub fn assume_role(service: &str) -> Self {
        return Self {
            sid: None,
            effect: Effect::Allow,
            principal: Some(Principal {
                service: service.to_string(),
            }),
            actions: vec![String::from("sts:AssumeRole")],
            resources: vec![],
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(rename = "Statement", deserialize_with = "one_or_many")]
    pub statements: Vec<PolicyStatement>,
}

fn default_version() -> String {
    return String::from(POLICY_VERSION);
}

impl PolicyDocument {
    pub fn new(statements: Vec<PolicyStatement>) -> Self {
        return Self {
            version: default_version(),
            statements,
        };
    }

    /// Fails on the first resource that is neither `*` nor an ARN, or that
    /// still carries a placeholder.
    pub fn check_qualified(&self) -> Result<(), Error> {
        for resource in self.statements.iter().flat_map(|s| s.resources.iter()) {
            if !is_qualified(resource) {
                return Err(Error::Unqualified(resource.clone()));
            }
        }
        return Ok(());
    }
}

pub fn is_qualified(resource: &str) -> bool {
    if resource == "*" {
        return true;
    }
    if !resource.starts_with("arn:") || template::has_placeholder(resource) {
        return false;
    }
    // arn:partition:service:region:account:resource
    return resource.splitn(6, ':').count() == 6;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InlinePolicy {
    pub policy_name: String,
    pub policy_document: PolicyDocument,
}

/// Inline policies in declaration order. Names are not deduplicated.
pub type NamedPolicies = Vec<InlinePolicy>;

pub fn named(name: &str, statements: Vec<PolicyStatement>) -> InlinePolicy {
    return InlinePolicy {
        policy_name: name.to_string(),
        policy_document: PolicyDocument::new(statements),
    };
}

pub fn managed_policy_arn(name: &str) -> String {
    if name.starts_with("arn:") {
        return name.to_string();
    }
    return format!("arn:aws:iam::aws:policy/{}", name);
}

pub fn log_writer(ctx: &DeploymentContext) -> InlinePolicy {
    return named(
        "AllowLogWriting",
        vec![PolicyStatement::allow(
            [
                "logs:CreateLogGroup",
                "logs:CreateLogStream",
                "logs:DescribeLogStreams",
                "logs:PutLogEvents",
            ],
            [ctx.arn("logs", "log-group:/Gitlab/*")],
        )],
    );
}

pub fn parameter_reader(ctx: &DeploymentContext) -> InlinePolicy {
    return named(
        "AllowSSMRead",
        vec![PolicyStatement::allow(
            ["ssm:GetParameter"],
            [ctx.arn("ssm", "parameter/Gitlab/*")],
        )],
    );
}

pub fn secret_reader(ctx: &DeploymentContext, secret_names: &[&str]) -> InlinePolicy {
    let resources: Vec<String> = secret_names
        .iter()
        .map(|name| ctx.arn("secretsmanager", &format!("secret:{}*", name)))
        .collect();
    return named(
        "AllowSecretRetrieve",
        vec![PolicyStatement::allow(
            ["secretsmanager:GetSecretValue"],
            resources,
        )],
    );
}

/// Permissions the runner manager needs to drive Fargate tasks.
pub fn task_launcher(ctx: &DeploymentContext, cluster_name: &str) -> InlinePolicy {
    return named(
        "AllowTaskLaunch",
        vec![
            PolicyStatement::allow(
                ["ecs:RunTask", "ecs:StopTask", "ecs:DescribeTasks"],
                [
                    ctx.arn("ecs", "task-definition/*"),
                    ctx.arn("ecs", &format!("task/{}/*", cluster_name)),
                ],
            ),
            PolicyStatement::allow(
                ["ecs:ListTaskDefinitions", "ec2:DescribeNetworkInterfaces"],
                ["*"],
            ),
            PolicyStatement::allow(
                ["iam:PassRole"],
                [format!("arn:aws:iam::{}:role/*", ctx.account)],
            ),
        ],
    );
}

pub fn bucket_user(bucket_arn: &str) -> InlinePolicy {
    return named(
        "AllowCacheBucket",
        vec![PolicyStatement::allow(
            ["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
            [bucket_arn.to_string(), format!("{}/*", bucket_arn)],
        )],
    );
}

/// Reads an external policy template and renders it with the account and
/// region. An unreadable template is skipped with a warning.
pub fn load_inline_template(
    renderer: &TemplateRenderer,
    path: &Path,
    ctx: &DeploymentContext,
) -> Result<Option<PolicyDocument>, Error> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                %error,
                "inline policy template unreadable, continuing without it"
            );
            return Ok(None);
        }
    };

    let rendered = renderer.render_named(&path.display().to_string(), &text, &ctx.placeholders())?;
    let document: PolicyDocument = match serde_json::from_str(&rendered) {
        Ok(document) => document,
        Err(error) => {
            return Err(Error::InvalidDocument {
                path: path.display().to_string(),
                reason: error.to_string(),
            })
        }
    };
    document.check_qualified()?;

    tracing::debug!(
        path = %path.display(),
        statements = document.statements.len(),
        "loaded inline policy template"
    );
    return Ok(Some(document));
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    return match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => Ok(vec![item]),
        OneOrMany::Many(items) => Ok(items),
    };
}
