//! Declarations handed to a [`CloudProvider`](crate::provider::CloudProvider).
//!
//! Each spec describes one resource. Serialized properties use the provider's
//! PascalCase naming so that recorded graphs read like the deployed resources.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::policy::{NamedPolicies, PolicyDocument};
use crate::provider::Handle;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleSpec {
    pub assume_role_policy_document: PolicyDocument,

    #[serde(rename = "ManagedPolicyArns", skip_serializing_if = "Vec::is_empty")]
    pub managed_policy_arns: Vec<String>,

    #[serde(rename = "Policies", skip_serializing_if = "Vec::is_empty")]
    pub inline_policies: NamedPolicies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Peer {
    /// The security group the rule belongs to.
    SelfGroup,
    Cidr(String),
}

impl Peer {
    pub fn any_ipv4() -> Self {
        return Peer::Cidr(String::from("0.0.0.0/0"));
    }

    pub fn is_unrestricted(&self) -> bool {
        return matches!(self, Peer::Cidr(cidr) if cidr == "0.0.0.0/0" || cidr == "::/0");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroupRule {
    pub peer: Peer,
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub description: String,
}

impl SecurityGroupRule {
    pub fn tcp(peer: Peer, port: u16, description: &str) -> Self {
        return Self {
            peer,
            protocol: Protocol::Tcp,
            from_port: port,
            to_port: port,
            description: description.to_string(),
        };
    }

    pub fn port_count(&self) -> u32 {
        return u32::from(self.to_port.saturating_sub(self.from_port)) + 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroupSpec {
    pub group_description: String,
    pub vpc_id: String,
    pub allow_all_outbound: bool,
    #[serde(rename = "SecurityGroupIngress")]
    pub ingress: Vec<SecurityGroupRule>,
    #[serde(rename = "SecurityGroupEgress")]
    pub egress: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapacityProviderStrategyItem {
    pub capacity_provider: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterSetting {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub capacity_providers: Vec<String>,
    pub default_capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    pub cluster_settings: Vec<ClusterSetting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfiguration {
    pub log_driver: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValuePair {
    pub name: String,
    pub value: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSecret {
    pub name: String,
    pub value_from: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDefinition {
    pub name: String,
    pub image: Handle,
    pub essential: bool,
    pub port_mappings: Vec<PortMapping>,
    pub log_configuration: LogConfiguration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<ContainerSecret>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<KeyValuePair>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskDefinitionSpec {
    pub family: String,
    pub cpu: String,
    pub memory: String,
    pub network_mode: String,
    pub requires_compatibilities: Vec<String>,
    pub task_role_arn: Handle,
    pub execution_role_arn: Handle,
    pub container_definitions: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreaker {
    pub enable: bool,
    pub rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentConfiguration {
    pub minimum_healthy_percent: u32,
    pub maximum_percent: u32,
    pub deployment_circuit_breaker: CircuitBreaker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AwsVpcConfiguration {
    pub subnets: Vec<String>,
    pub security_groups: Vec<Handle>,
    pub assign_public_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfiguration {
    pub awsvpc_configuration: AwsVpcConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    pub service_name: String,
    pub cluster: Handle,
    pub task_definition: Handle,
    pub desired_count: u32,
    pub capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    pub deployment_configuration: DeploymentConfiguration,
    pub network_configuration: NetworkConfiguration,
    pub enable_execute_command: bool,
}

/// What happens to the resource when it is removed from the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalPolicy {
    Destroy,
    Retain,
}

impl RemovalPolicy {
    pub fn retain_if(retain: bool) -> Self {
        return match retain {
            true => RemovalPolicy::Retain,
            false => RemovalPolicy::Destroy,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketSpec {
    pub bucket_name: String,
    pub block_public_access: bool,
    /// `aws:kms` for KMS-managed keys.
    pub encryption: String,
    pub enforce_ssl: bool,
    pub removal_policy: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogGroupSpec {
    pub log_group_name: String,
    pub retention_in_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterSpec {
    pub name: String,
    pub value: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageAssetSpec {
    /// Build context directory of the image.
    pub directory: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDevice {
    pub device_name: String,
    pub volume_size: u32,
    pub encrypted: bool,
    pub delete_on_termination: bool,
}

/// File or command text. `Substitution` text is resolved at deployment time:
/// `${LogicalId}` and `${LogicalId.Attribute}` are replaced by the provider and
/// `${!Literal}` stands for a literal `${Literal}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Substitution {
        #[serde(rename = "Fn::Sub")]
        template: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "Type")]
pub enum InitElement {
    Command {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Command")]
        command: Content,
    },
    Package {
        #[serde(rename = "Manager")]
        manager: String,
        #[serde(rename = "Name")]
        name: String,
    },
    File {
        #[serde(rename = "Path")]
        path: String,
        #[serde(rename = "Content")]
        content: Content,
        #[serde(rename = "Owner")]
        owner: String,
        #[serde(rename = "Group")]
        group: String,
        #[serde(rename = "Mode")]
        mode: String,
    },
}

impl InitElement {
    pub fn shell(key: &str, command: Content) -> Self {
        return InitElement::Command {
            key: key.to_string(),
            command,
        };
    }

    pub fn yum(name: impl Into<String>) -> Self {
        return InitElement::Package {
            manager: String::from("yum"),
            name: name.into(),
        };
    }

    /// Root-owned, world-readable file.
    pub fn root_file(path: &str, content: Content) -> Self {
        return InitElement::File {
            path: path.to_string(),
            content,
            owner: String::from("root"),
            group: String::from("root"),
            mode: String::from("0644"),
        };
    }
}

/// Instance bootstrap split into ordered config sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct InitConfigSets {
    pub config_sets: BTreeMap<String, Vec<String>>,
    pub configs: BTreeMap<String, Vec<InitElement>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AutoScalingGroupSpec {
    pub instance_type: String,
    pub machine_image: String,
    pub subnets: Vec<String>,
    pub min_size: u32,
    pub max_size: u32,
    pub role: Handle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    pub block_devices: Vec<BlockDevice>,
    pub security_groups: Vec<Handle>,
    pub allow_all_outbound: bool,
    /// Wait for every instance to signal success.
    pub signals_wait_for_all: bool,
    pub init: InitConfigSets,
}
