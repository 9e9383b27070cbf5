//! The "declare resource, get handle" capability.
//!
//! Builders never talk to a cloud API directly. They hand declarations to a
//! [`CloudProvider`] and wire dependencies through the returned [`Handle`]s.
//! [`RecordingProvider`] records every declaration into a [`ResourceGraph`]
//! that is written out once assembly finishes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::context::{DeploymentContext, Network, NetworkCatalog};
use crate::resources::{
    AutoScalingGroupSpec, BucketSpec, ClusterSpec, ImageAssetSpec, LogGroupSpec, ParameterSpec,
    RoleSpec, SecurityGroupSpec, ServiceSpec, TaskDefinitionSpec,
};

pub const ROLE: &str = "AWS::IAM::Role";
pub const SECURITY_GROUP: &str = "AWS::EC2::SecurityGroup";
pub const CLUSTER: &str = "AWS::ECS::Cluster";
pub const TASK_DEFINITION: &str = "AWS::ECS::TaskDefinition";
pub const SERVICE: &str = "AWS::ECS::Service";
pub const BUCKET: &str = "AWS::S3::Bucket";
pub const LOG_GROUP: &str = "AWS::Logs::LogGroup";
pub const AUTOSCALING_GROUP: &str = "AWS::AutoScaling::AutoScalingGroup";
pub const PARAMETER: &str = "AWS::SSM::Parameter";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Resource {0} is already declared")]
    Conflict(String),

    #[error("Reference to undeclared resource {0}")]
    InvalidReference(String),

    #[error("Network {0} not found")]
    NetworkNotFound(String),

    #[error("Unable to serialize declaration: {0}")]
    Serialization(String),

    #[error("{0}")]
    Remote(String),
}

/// Opaque reference to a declared or imported resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Handle {
    /// The resource itself, inside the graph that declared it.
    Ref {
        #[serde(rename = "Ref")]
        logical_id: String,
    },
    /// An attribute of a resource inside the graph that declared it.
    Attribute {
        #[serde(rename = "Fn::GetAtt")]
        target: (String, String),
    },
    /// A value exported by another stack.
    Import {
        #[serde(rename = "Fn::ImportValue")]
        export_name: String,
    },
    /// A physical value known before deployment.
    Literal(String),
}

impl Handle {
    pub fn reference(logical_id: &str) -> Self {
        return Handle::Ref {
            logical_id: logical_id.to_string(),
        };
    }

    /// Attribute of the referenced resource. Imported and literal handles
    /// already carry a resolved value and are returned unchanged.
    pub fn attribute(&self, name: &str) -> Self {
        return match self {
            Handle::Ref { logical_id } | Handle::Attribute { target: (logical_id, _) } => {
                Handle::Attribute {
                    target: (logical_id.clone(), name.to_string()),
                }
            }
            other => other.clone(),
        };
    }

    pub fn logical_id(&self) -> Option<&str> {
        return match self {
            Handle::Ref { logical_id } => Some(logical_id.as_str()),
            Handle::Attribute { target } => Some(target.0.as_str()),
            _ => None,
        };
    }

    pub fn literal(&self) -> Option<&str> {
        return match self {
            Handle::Literal(value) => Some(value.as_str()),
            _ => None,
        };
    }

    /// Form of this handle inside a deployment-time substitution string.
    pub fn substitution_token(&self) -> Result<String, Error> {
        return match self {
            Handle::Ref { logical_id } => Ok(format!("${{{}}}", logical_id)),
            Handle::Attribute {
                target: (logical_id, attribute),
            } => Ok(format!("${{{}.{}}}", logical_id, attribute)),
            Handle::Literal(value) => Ok(value.clone()),
            Handle::Import { export_name } => Err(Error::InvalidReference(format!(
                "imported value {} cannot be substituted",
                export_name
            ))),
        };
    }
}

pub trait CloudProvider {
    fn lookup_network(&mut self, vpc_id: &str) -> Result<Network, Error>;

    fn declare_role(&mut self, id: &str, spec: &RoleSpec) -> Result<Handle, Error>;

    fn declare_security_group(&mut self, id: &str, spec: &SecurityGroupSpec)
        -> Result<Handle, Error>;

    fn declare_cluster(&mut self, id: &str, spec: &ClusterSpec) -> Result<Handle, Error>;

    fn declare_task_definition(
        &mut self,
        id: &str,
        spec: &TaskDefinitionSpec,
    ) -> Result<Handle, Error>;

    fn declare_service(&mut self, id: &str, spec: &ServiceSpec) -> Result<Handle, Error>;

    fn declare_bucket(&mut self, id: &str, spec: &BucketSpec) -> Result<Handle, Error>;

    /// Reference to an existing secret, by name.
    fn declare_secret_reference(&mut self, id: &str, secret_name: &str) -> Result<Handle, Error>;

    fn declare_log_group(&mut self, id: &str, spec: &LogGroupSpec) -> Result<Handle, Error>;

    fn declare_autoscaling_group(
        &mut self,
        id: &str,
        spec: &AutoScalingGroupSpec,
    ) -> Result<Handle, Error>;

    fn declare_parameter(&mut self, id: &str, spec: &ParameterSpec) -> Result<Handle, Error>;

    /// Container image built from a local directory. The handle resolves to
    /// the image URI.
    fn declare_image_asset(&mut self, id: &str, spec: &ImageAssetSpec) -> Result<Handle, Error>;

    fn declare_output(
        &mut self,
        key: &str,
        value: &Handle,
        export_name: Option<String>,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Declaration {
    #[serde(rename = "Type")]
    pub kind: String,
    pub properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Handle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

/// Everything declared for one stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceGraph {
    pub stack_name: String,
    pub account: String,
    pub region: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_lookups: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_references: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, ImageAssetSpec>,
    pub resources: BTreeMap<String, Declaration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl ResourceGraph {
    pub fn resources_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Declaration)> + 'a {
        return self
            .resources
            .iter()
            .filter(move |(_, declaration)| declaration.kind == kind);
    }

    pub fn properties(&self, logical_id: &str) -> Option<&Value> {
        return self
            .resources
            .get(logical_id)
            .map(|declaration| &declaration.properties);
    }
}

pub struct RecordingProvider {
    ctx: DeploymentContext,
    catalog: NetworkCatalog,
    graph: ResourceGraph,
}

impl RecordingProvider {
    pub fn new(stack_name: &str, ctx: &DeploymentContext, catalog: NetworkCatalog) -> Self {
        let graph = ResourceGraph {
            stack_name: stack_name.to_string(),
            account: ctx.account.clone(),
            region: ctx.region.clone(),
            ..ResourceGraph::default()
        };
        return Self {
            ctx: ctx.clone(),
            catalog,
            graph,
        };
    }

    /// Tags applied to every resource declared from now on.
    pub fn with_tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.graph.tags = tags.clone();
        return self;
    }

    pub fn graph(&self) -> &ResourceGraph {
        return &self.graph;
    }

    pub fn into_graph(self) -> ResourceGraph {
        return self.graph;
    }

    fn is_declared(&self, logical_id: &str) -> bool {
        return self.graph.resources.contains_key(logical_id);
    }

    fn reserve(&self, id: &str) -> Result<(), Error> {
        if self.is_declared(id)
            || self.graph.secret_references.contains_key(id)
            || self.graph.assets.contains_key(id)
        {
            return Err(Error::Conflict(id.to_string()));
        }
        return Ok(());
    }

    fn record<T: Serialize>(&mut self, id: &str, kind: &str, spec: &T) -> Result<Handle, Error> {
        self.reserve(id)?;
        let mut properties = match serde_json::to_value(spec) {
            Ok(properties) => properties,
            Err(error) => return Err(Error::Serialization(error.to_string())),
        };
        self.check_references(&properties)?;
        if let Value::Object(map) = &mut properties {
            apply_tags(kind, &self.graph.tags, map);
        }

        tracing::debug!(logical_id = id, kind, "declared resource");
        self.graph.resources.insert(
            id.to_string(),
            Declaration {
                kind: kind.to_string(),
                properties,
            },
        );
        return Ok(Handle::reference(id));
    }

    /// Every `Ref`/`Fn::GetAtt` inside a declaration must point at a resource
    /// declared earlier in this graph. Pseudo parameters are always allowed.
    fn check_references(&self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(target)) = map.get("Ref") {
                    if !target.starts_with("AWS::") && !self.is_declared(target) {
                        return Err(Error::InvalidReference(target.clone()));
                    }
                }
                if let Some(Value::Array(parts)) = map.get("Fn::GetAtt") {
                    if let Some(Value::String(target)) = parts.first() {
                        if !self.is_declared(target) {
                            return Err(Error::InvalidReference(target.clone()));
                        }
                    }
                }
                if let Some(Value::String(template)) = map.get("Fn::Sub") {
                    for target in substitution_targets(template) {
                        if !target.starts_with("AWS::") && !self.is_declared(target) {
                            return Err(Error::InvalidReference(target.to_string()));
                        }
                    }
                }
                for nested in map.values() {
                    self.check_references(nested)?;
                }
            }
            Value::Array(items) => {
                for nested in items {
                    self.check_references(nested)?;
                }
            }
            _ => (),
        }
        return Ok(());
    }
}

static SUBSTITUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^!}.][^}.]*)(?:\.[^}]*)?\}").unwrap());

/// Logical ids referenced as `${Id}` or `${Id.Attribute}` in a substitution
/// string. `${!...}` escapes are skipped.
fn substitution_targets(template: &str) -> Vec<&str> {
    return SUBSTITUTION
        .captures_iter(template)
        .filter_map(|captures| captures.get(1))
        .map(|target| target.as_str())
        .collect();
}

/// Merges the stack tags into a declaration's `Tags` property. Tags already
/// set on the declaration win. Autoscaling groups propagate tags to their
/// instances and SSM parameters take a plain map.
fn apply_tags(kind: &str, tags: &BTreeMap<String, String>, properties: &mut Map<String, Value>) {
    if tags.is_empty() {
        return;
    }

    if kind == PARAMETER {
        let entry = properties
            .entry("Tags")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = entry {
            for (key, value) in tags {
                existing
                    .entry(key.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
        return;
    }

    let entry = properties
        .entry("Tags")
        .or_insert_with(|| Value::Array(vec![]));
    if let Value::Array(existing) = entry {
        for (key, value) in tags {
            if existing.iter().any(|tag| tag["Key"] == key.as_str()) {
                continue;
            }
            let tag = match kind {
                AUTOSCALING_GROUP => json!({ "Key": key, "Value": value, "PropagateAtLaunch": true }),
                _ => json!({ "Key": key, "Value": value }),
            };
            existing.push(tag);
        }
    }
}

impl CloudProvider for RecordingProvider {
    fn lookup_network(&mut self, vpc_id: &str) -> Result<Network, Error> {
        let network = match self.catalog.find(vpc_id) {
            Some(network) => network.clone(),
            None => return Err(Error::NetworkNotFound(vpc_id.to_string())),
        };
        if !self.graph.network_lookups.iter().any(|seen| seen == vpc_id) {
            self.graph.network_lookups.push(vpc_id.to_string());
        }
        return Ok(network);
    }

    fn declare_role(&mut self, id: &str, spec: &RoleSpec) -> Result<Handle, Error> {
        return self.record(id, ROLE, spec);
    }

    fn declare_security_group(
        &mut self,
        id: &str,
        spec: &SecurityGroupSpec,
    ) -> Result<Handle, Error> {
        return self.record(id, SECURITY_GROUP, spec);
    }

    fn declare_cluster(&mut self, id: &str, spec: &ClusterSpec) -> Result<Handle, Error> {
        return self.record(id, CLUSTER, spec);
    }

    fn declare_task_definition(
        &mut self,
        id: &str,
        spec: &TaskDefinitionSpec,
    ) -> Result<Handle, Error> {
        return self.record(id, TASK_DEFINITION, spec);
    }

    fn declare_service(&mut self, id: &str, spec: &ServiceSpec) -> Result<Handle, Error> {
        return self.record(id, SERVICE, spec);
    }

    fn declare_bucket(&mut self, id: &str, spec: &BucketSpec) -> Result<Handle, Error> {
        return self.record(id, BUCKET, spec);
    }

    fn declare_secret_reference(&mut self, id: &str, secret_name: &str) -> Result<Handle, Error> {
        self.reserve(id)?;
        let arn = self
            .ctx
            .arn("secretsmanager", &format!("secret:{}", secret_name));
        self.graph
            .secret_references
            .insert(id.to_string(), arn.clone());
        return Ok(Handle::Literal(arn));
    }

    fn declare_log_group(&mut self, id: &str, spec: &LogGroupSpec) -> Result<Handle, Error> {
        return self.record(id, LOG_GROUP, spec);
    }

    fn declare_autoscaling_group(
        &mut self,
        id: &str,
        spec: &AutoScalingGroupSpec,
    ) -> Result<Handle, Error> {
        return self.record(id, AUTOSCALING_GROUP, spec);
    }

    fn declare_parameter(&mut self, id: &str, spec: &ParameterSpec) -> Result<Handle, Error> {
        return self.record(id, PARAMETER, spec);
    }

    fn declare_image_asset(&mut self, id: &str, spec: &ImageAssetSpec) -> Result<Handle, Error> {
        self.reserve(id)?;
        let uri = format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}:{}",
            self.ctx.account, self.ctx.region, spec.repository, spec.tag
        );
        self.graph.assets.insert(id.to_string(), spec.clone());
        return Ok(Handle::Literal(uri));
    }

    fn declare_output(
        &mut self,
        key: &str,
        value: &Handle,
        export_name: Option<String>,
    ) -> Result<(), Error> {
        if self.graph.outputs.contains_key(key) {
            return Err(Error::Conflict(format!("output {}", key)));
        }
        if let Some(logical_id) = value.logical_id() {
            if !self.is_declared(logical_id) {
                return Err(Error::InvalidReference(logical_id.to_string()));
            }
        }
        self.graph.outputs.insert(
            key.to_string(),
            Output {
                value: value.clone(),
                export: export_name,
            },
        );
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Subnet;
    use crate::policy::{PolicyDocument, PolicyStatement};

    fn provider() -> RecordingProvider {
        let ctx = DeploymentContext::new("123456789012", "eu-west-1").unwrap();
        let catalog = NetworkCatalog::default().with_network(Network {
            vpc_id: String::from("vpc-1"),
            cidr: None,
            subnets: vec![Subnet {
                subnet_id: String::from("subnet-a"),
                availability_zone: String::from("eu-west-1a"),
                kind: Default::default(),
            }],
        });
        RecordingProvider::new("TestStack", &ctx, catalog)
    }

    fn log_group() -> LogGroupSpec {
        LogGroupSpec {
            log_group_name: String::from("/Gitlab/Runner/"),
            retention_in_days: 30,
        }
    }

    #[test]
    fn handles_serialize_as_intrinsics() {
        let handle = Handle::reference("Cluster");
        assert_eq!(
            serde_json::to_value(&handle).unwrap(),
            serde_json::json!({ "Ref": "Cluster" })
        );
        assert_eq!(
            serde_json::to_value(handle.attribute("Arn")).unwrap(),
            serde_json::json!({ "Fn::GetAtt": ["Cluster", "Arn"] })
        );
        let imported: Handle =
            serde_json::from_value(serde_json::json!({ "Fn::ImportValue": "Stack-Cluster" }))
                .unwrap();
        assert_eq!(
            imported,
            Handle::Import {
                export_name: String::from("Stack-Cluster")
            }
        );
        let literal: Handle = serde_json::from_value(serde_json::json!("sg-123")).unwrap();
        assert_eq!(literal.attribute("GroupId"), Handle::Literal(String::from("sg-123")));
    }

    #[test]
    fn rejects_duplicate_logical_ids() {
        let mut provider = provider();
        provider.declare_log_group("Logs", &log_group()).unwrap();
        assert_eq!(
            provider.declare_log_group("Logs", &log_group()),
            Err(Error::Conflict(String::from("Logs")))
        );
    }

    #[test]
    fn rejects_references_to_undeclared_resources() {
        let mut provider = provider();
        let spec = ParameterSpec {
            name: String::from("/Gitlab/x"),
            value: String::from("x"),
            description: String::from("x"),
        };
        provider.declare_parameter("Param", &spec).unwrap();

        let role = RoleSpec {
            assume_role_policy_document: PolicyDocument::new(vec![PolicyStatement::assume_role(
                "ec2.amazonaws.com",
            )]),
            managed_policy_arns: vec![],
            inline_policies: vec![],
        };
        let handle = provider.declare_role("Role", &role).unwrap();
        assert!(provider
            .declare_output("RoleArn", &handle.attribute("Arn"), None)
            .is_ok());
        assert_eq!(
            provider.declare_output("Missing", &Handle::reference("Nope"), None),
            Err(Error::InvalidReference(String::from("Nope")))
        );
    }

    #[test]
    fn stack_tags_land_on_every_declaration() {
        let tags = BTreeMap::from([
            (String::from("project"), String::from("ci")),
            (String::from("team"), String::from("platform")),
        ]);
        let mut provider = provider().with_tags(&tags);
        provider.declare_log_group("Logs", &log_group()).unwrap();
        provider
            .declare_parameter(
                "Param",
                &ParameterSpec {
                    name: String::from("/Gitlab/x"),
                    value: String::from("x"),
                    description: String::from("x"),
                },
            )
            .unwrap();

        let graph = provider.graph();
        assert_eq!(
            graph.properties("Logs").unwrap()["Tags"],
            serde_json::json!([
                { "Key": "project", "Value": "ci" },
                { "Key": "team", "Value": "platform" }
            ])
        );
        assert_eq!(
            graph.properties("Param").unwrap()["Tags"],
            serde_json::json!({ "project": "ci", "team": "platform" })
        );
    }

    #[test]
    fn autoscaling_tags_propagate_and_explicit_tags_win() {
        let tags = BTreeMap::from([(String::from("project"), String::from("ci"))]);
        let mut properties = serde_json::json!({
            "Tags": [{ "Key": "project", "Value": "runner", "PropagateAtLaunch": true }]
        });
        let map = properties.as_object_mut().unwrap();
        apply_tags(AUTOSCALING_GROUP, &tags, map);
        assert_eq!(map["Tags"].as_array().unwrap().len(), 1);
        assert_eq!(map["Tags"][0]["Value"], "runner");

        let mut properties = serde_json::json!({});
        let map = properties.as_object_mut().unwrap();
        apply_tags(AUTOSCALING_GROUP, &tags, map);
        assert_eq!(
            map["Tags"],
            serde_json::json!([{ "Key": "project", "Value": "ci", "PropagateAtLaunch": true }])
        );
    }

    #[test]
    fn untagged_stacks_add_no_tags_property() {
        let mut provider = provider();
        provider.declare_log_group("Logs", &log_group()).unwrap();
        assert!(provider.graph().properties("Logs").unwrap().get("Tags").is_none());
    }

    #[test]
    fn finds_substitution_targets() {
        assert_eq!(
            substitution_targets("sg=${Group.GroupId} td=${TaskDef} home=${!HOME} ${AWS::Region}"),
            vec!["Group", "TaskDef", "AWS::Region"]
        );
        assert!(substitution_targets("no tokens ${unterminated").is_empty());
    }

    #[test]
    fn network_lookup() {
        let mut provider = provider();
        let network = provider.lookup_network("vpc-1").unwrap();
        assert_eq!(network.subnets.len(), 1);
        assert_eq!(
            provider.lookup_network("vpc-2"),
            Err(Error::NetworkNotFound(String::from("vpc-2")))
        );
        assert_eq!(provider.graph().network_lookups, vec!["vpc-1"]);
    }

    #[test]
    fn secret_references_resolve_to_partial_arns() {
        let mut provider = provider();
        let handle = provider
            .declare_secret_reference("RunnerToken", "gitlab-runner-token")
            .unwrap();
        assert_eq!(
            handle.literal(),
            Some("arn:aws:secretsmanager:eu-west-1:123456789012:secret:gitlab-runner-token")
        );
        assert_eq!(
            provider.declare_secret_reference("RunnerToken", "other"),
            Err(Error::Conflict(String::from("RunnerToken")))
        );
    }

    #[test]
    fn image_assets_resolve_to_repository_uri() {
        let mut provider = provider();
        let handle = provider
            .declare_image_asset(
                "CoordinatorImage",
                &ImageAssetSpec {
                    directory: String::from("./docker_images/ci-coordinator"),
                    repository: String::from("runner-images"),
                    tag: String::from("ci-coordinator"),
                },
            )
            .unwrap();
        assert_eq!(
            handle.literal(),
            Some("123456789012.dkr.ecr.eu-west-1.amazonaws.com/runner-images:ci-coordinator")
        );
    }
}
