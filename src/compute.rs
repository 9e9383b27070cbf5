//! Cluster, task definition, runner fleet and service declarations.

use std::collections::BTreeMap;

use crate::config::{BastionProps, ServiceProps};
use crate::context::{DeploymentContext, Network};
use crate::error::{ProviderContext, Result};
use crate::network;
use crate::provider::{CloudProvider, Handle};
use crate::resources::{
    AutoScalingGroupSpec, AwsVpcConfiguration, BlockDevice, CapacityProviderStrategyItem,
    CircuitBreaker, ClusterSetting, ClusterSpec, ContainerDefinition, ContainerSecret, Content,
    DeploymentConfiguration, ImageAssetSpec, InitConfigSets, InitElement, KeyValuePair,
    LogConfiguration, NetworkConfiguration, PortMapping, Protocol, ServiceSpec,
    TaskDefinitionSpec,
};
use crate::template::{self, BootstrapTemplates, PlaceholderMap, TemplateRenderer};

pub const FARGATE: &str = "FARGATE";
pub const FARGATE_SPOT: &str = "FARGATE_SPOT";

/// The Fargate executor expects the job container under this name.
pub const COORDINATOR_CONTAINER: &str = "ci-coordinator";
pub const COORDINATOR_PORT: u16 = 22;

pub const LOG_STREAM_PREFIX: &str = "fargate";
pub const IMAGE_REPOSITORY: &str = "runner-images";
pub const MACHINE_IMAGE: &str = "amazon-linux-2";

const RUNNER_REPO_COMMAND: &str =
    "curl -s https://packages.gitlab.com/install/repositories/runner/gitlab-runner/script.rpm.sh | bash";
const RSYSLOG_RULE: &str =
    ":programname, isequal, \"gitlab-runner\" /var/log/gitlab-runner.log";

/// Relative preference between spot and on-demand Fargate capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityWeights {
    pub spot: u32,
    pub on_demand: u32,
}

impl Default for CapacityWeights {
    fn default() -> Self {
        return Self {
            spot: 100,
            on_demand: 10,
        };
    }
}

pub fn capacity_strategy(weights: CapacityWeights) -> Vec<CapacityProviderStrategyItem> {
    return vec![
        CapacityProviderStrategyItem {
            capacity_provider: String::from(FARGATE_SPOT),
            weight: weights.spot,
        },
        CapacityProviderStrategyItem {
            capacity_provider: String::from(FARGATE),
            weight: weights.on_demand,
        },
    ];
}

pub fn cluster_spec(cluster_name: &str, weights: CapacityWeights) -> ClusterSpec {
    return ClusterSpec {
        cluster_name: cluster_name.to_string(),
        capacity_providers: vec![String::from(FARGATE), String::from(FARGATE_SPOT)],
        default_capacity_provider_strategy: capacity_strategy(weights),
        cluster_settings: vec![ClusterSetting {
            name: String::from("containerInsights"),
            value: String::from("enabled"),
        }],
    };
}

pub fn declare_cluster(
    provider: &mut dyn CloudProvider,
    id: &str,
    cluster_name: &str,
    weights: CapacityWeights,
) -> Result<Handle> {
    return provider
        .declare_cluster(id, &cluster_spec(cluster_name, weights))
        .context(format!("declaring cluster {}", cluster_name));
}

/// `ci-coordinator` -> `CiCoordinator`, usable as part of a logical id.
pub fn logical_name(name: &str) -> String {
    return name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect();
}

/// A prebuilt image when `image_uri` is given, otherwise an image built from
/// `./docker_images/{image_name}`.
pub fn container_image(
    provider: &mut dyn CloudProvider,
    image_name: &str,
    image_uri: Option<&str>,
) -> Result<Handle> {
    if let Some(uri) = image_uri {
        return Ok(Handle::Literal(uri.to_string()));
    }

    let spec = ImageAssetSpec {
        directory: format!("./docker_images/{}", image_name),
        repository: String::from(IMAGE_REPOSITORY),
        tag: image_name.to_string(),
    };
    return provider
        .declare_image_asset(&format!("{}Image", logical_name(image_name)), &spec)
        .context(format!("declaring image {}", image_name));
}

pub fn awslogs(ctx: &DeploymentContext, log_group: &str) -> LogConfiguration {
    let mut options = BTreeMap::new();
    options.insert(String::from("awslogs-group"), log_group.to_string());
    options.insert(String::from("awslogs-region"), ctx.region.clone());
    options.insert(
        String::from("awslogs-stream-prefix"),
        String::from(LOG_STREAM_PREFIX),
    );
    return LogConfiguration {
        log_driver: String::from("awslogs"),
        options,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSettings {
    pub name: String,
    pub image: Handle,
    pub ports: Vec<u16>,
    pub log_group: String,
    pub secrets: Vec<ContainerSecret>,
    pub environment: Vec<KeyValuePair>,
}

impl ContainerSettings {
    /// The job container the Fargate executor connects to over SSH.
    pub fn coordinator(image: Handle, log_group: &str) -> Self {
        return Self {
            name: String::from(COORDINATOR_CONTAINER),
            image,
            ports: vec![COORDINATOR_PORT],
            log_group: log_group.to_string(),
            secrets: vec![],
            environment: vec![],
        };
    }
}

pub fn container_definition(ctx: &DeploymentContext, settings: ContainerSettings) -> ContainerDefinition {
    return ContainerDefinition {
        name: settings.name,
        image: settings.image,
        essential: true,
        port_mappings: settings
            .ports
            .into_iter()
            .map(|container_port| PortMapping {
                container_port,
                protocol: Protocol::Tcp,
            })
            .collect(),
        log_configuration: awslogs(ctx, &settings.log_group),
        secrets: settings.secrets,
        environment: settings.environment,
    };
}

pub fn environment(variables: &BTreeMap<String, String>) -> Vec<KeyValuePair> {
    return variables
        .iter()
        .map(|(name, value)| KeyValuePair {
            name: name.clone(),
            value: Handle::Literal(value.clone()),
        })
        .collect();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSizing {
    pub cpu: u32,
    pub memory: u32,
}

pub fn task_definition_spec(
    family: &str,
    sizing: TaskSizing,
    task_role: &Handle,
    execution_role: &Handle,
    containers: Vec<ContainerDefinition>,
) -> TaskDefinitionSpec {
    return TaskDefinitionSpec {
        family: family.to_string(),
        cpu: sizing.cpu.to_string(),
        memory: sizing.memory.to_string(),
        network_mode: String::from("awsvpc"),
        requires_compatibilities: vec![String::from(FARGATE)],
        task_role_arn: task_role.attribute("Arn"),
        execution_role_arn: execution_role.attribute("Arn"),
        container_definitions: containers,
    };
}

pub fn declare_task_definition(
    provider: &mut dyn CloudProvider,
    id: &str,
    spec: &TaskDefinitionSpec,
) -> Result<Handle> {
    return provider
        .declare_task_definition(id, spec)
        .context(format!("declaring task definition {}", spec.family));
}

/// Where a service's tasks run.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePlacement {
    pub cluster: Handle,
    pub subnets: Vec<String>,
    pub security_groups: Vec<Handle>,
}

pub fn service_spec(
    service_name: &str,
    task_definition: &Handle,
    placement: &ServicePlacement,
    props: &ServiceProps,
    weights: CapacityWeights,
) -> ServiceSpec {
    return ServiceSpec {
        service_name: service_name.to_string(),
        cluster: placement.cluster.clone(),
        task_definition: task_definition.clone(),
        desired_count: props.desired_count,
        capacity_provider_strategy: capacity_strategy(weights),
        deployment_configuration: DeploymentConfiguration {
            minimum_healthy_percent: props.minimum_healthy_percent,
            maximum_percent: props.maximum_percent,
            deployment_circuit_breaker: CircuitBreaker {
                enable: props.circuit_breaker,
                rollback: props.circuit_breaker && props.rollback,
            },
        },
        network_configuration: NetworkConfiguration {
            awsvpc_configuration: AwsVpcConfiguration {
                subnets: placement.subnets.clone(),
                security_groups: placement.security_groups.clone(),
                assign_public_ip: String::from("DISABLED"),
            },
        },
        enable_execute_command: props.enable_execute_command,
    };
}

pub fn declare_service(
    provider: &mut dyn CloudProvider,
    id: &str,
    spec: &ServiceSpec,
) -> Result<Handle> {
    return provider
        .declare_service(id, spec)
        .context(format!("declaring service {}", spec.service_name));
}

/// Inputs shared by every zone of the autoscaling runner fleet.
#[derive(Debug, Clone, Copy)]
pub struct FleetSettings<'a> {
    pub stack_name: &'a str,
    pub props: &'a BastionProps,
    pub network: &'a Network,
    pub security_group: &'a Handle,
    pub role: &'a Handle,
    pub cluster_name: &'a str,
    pub task_definition: &'a Handle,
    pub cache_bucket: &'a str,
    pub cloudwatch_parameter: &'a str,
}

/// Placeholder values for one zone, ready for [`render_deferred`]. Security
/// group and task definition are only known at deployment time and are
/// embedded as substitution tokens. Every other value is escaped so that it
/// stays literal at deployment time.
pub fn zone_placeholders(
    ctx: &DeploymentContext,
    settings: &FleetSettings,
    zone: &str,
    subnet_id: &str,
) -> Result<PlaceholderMap> {
    let props = settings.props;
    let security_group = deferred_token(&settings.security_group.attribute("GroupId"))
        .context("embedding the security group in runner configuration")?;
    let task_definition = deferred_token(settings.task_definition)
        .context("embedding the task definition in runner configuration")?;

    let literals = [
        ("__ACCOUNT_ID__", ctx.account.clone()),
        ("__REGION__", ctx.region.clone()),
        ("__GITLAB_SERVER__", props.gitlab_server.clone()),
        ("__RUNNER_NAME__", format!("{}-{}-runner", settings.stack_name, zone)),
        (
            "__GITLAB_RUNNER_TOKEN_SECRET_NAME__",
            props.gitlab_runner_token_secret_name.clone(),
        ),
        ("__GITLAB_RUNNER_TAGS__", props.runner_tags.clone()),
        (
            "__GITLAB_LOG_OUTPUT_LIMIT__",
            props.runner_log_output_limit.to_string(),
        ),
        (
            "__SSM_CLOUDWATCH_AGENT_CONFIG__",
            settings.cloudwatch_parameter.to_string(),
        ),
        ("__CACHE_BUCKET__", settings.cache_bucket.to_string()),
        ("__GITLAB_RUNNER_VERSION__", props.gitlab_runner_version.clone()),
        ("__ECS_CLUSTER__", settings.cluster_name.to_string()),
        ("__SUBNET_ID__", subnet_id.to_string()),
        ("__CONCURRENT_JOBS__", props.concurrent_jobs.to_string()),
        ("__SSH_USERNAME__", props.default_ssh_username.clone()),
    ];

    let mut placeholders = PlaceholderMap::new()
        .with("__SECURITY_GROUP_ID__", security_group)
        .with("__TASK_DEFINITION__", task_definition);
    for (token, value) in literals {
        placeholders.insert(token, escape_substitution(&value));
    }
    return Ok(placeholders);
}

/// `${` starts a reference in deployment-time substitution; `${!` is its
/// literal form.
pub fn escape_substitution(text: &str) -> String {
    return text.replace("${", "${!");
}

fn deferred_token(handle: &Handle) -> std::result::Result<String, crate::provider::Error> {
    return match handle.literal() {
        Some(value) => Ok(escape_substitution(value)),
        None => handle.substitution_token(),
    };
}

/// Renders a template whose result is resolved again at deployment time.
/// Literal `${...}` sequences in the template (shell variables) are escaped
/// first so that only the inserted tokens are substituted. Placeholder values
/// are inserted as given and must already be escaped.
pub fn render_deferred(
    renderer: &TemplateRenderer,
    name: &str,
    text: &str,
    placeholders: &PlaceholderMap,
) -> Result<Content> {
    let escaped = escape_substitution(text);
    let rendered = renderer.render_named(name, &escaped, placeholders)?;
    return Ok(Content::Substitution { template: rendered });
}

/// cfn-init style bootstrap: add the package repository, install the runner,
/// write its configuration and register it.
pub fn bootstrap(
    renderer: &TemplateRenderer,
    templates: &BootstrapTemplates,
    placeholders: &PlaceholderMap,
    runner_version: &str,
) -> Result<InitConfigSets> {
    let mut init = InitConfigSets::default();
    init.config_sets.insert(
        String::from("default"),
        ["setup", "packages", "config", "register"]
            .iter()
            .map(|name| name.to_string())
            .collect(),
    );

    init.configs.insert(
        String::from("setup"),
        vec![InitElement::shell(
            "add_gitlab_runner_repo",
            Content::Text(String::from(RUNNER_REPO_COMMAND)),
        )],
    );
    init.configs.insert(
        String::from("packages"),
        vec![InitElement::yum(format!("gitlab-runner-{}", runner_version))],
    );
    init.configs.insert(
        String::from("config"),
        vec![
            InitElement::root_file(
                "/etc/gitlab-runner/config.toml",
                render_deferred(
                    renderer,
                    template::RUNNER_CONFIG,
                    &templates.runner_config,
                    placeholders,
                )?,
            ),
            InitElement::root_file(
                "/etc/gitlab-runner/fargate.toml",
                render_deferred(
                    renderer,
                    template::FARGATE_CONFIG,
                    &templates.fargate_config,
                    placeholders,
                )?,
            ),
            InitElement::root_file(
                "/etc/systemd/system/gitlab-runner.service",
                Content::Text(templates.service_unit.clone()),
            ),
            InitElement::root_file(
                "/etc/rsyslog.d/25-gitlab-runner.conf",
                Content::Text(String::from(RSYSLOG_RULE)),
            ),
        ],
    );
    init.configs.insert(
        String::from("register"),
        vec![InitElement::shell(
            "register-runner",
            render_deferred(
                renderer,
                template::REGISTER_SCRIPT,
                &templates.register_script,
                placeholders,
            )?,
        )],
    );

    return Ok(init);
}

pub fn root_volume() -> BlockDevice {
    return BlockDevice {
        device_name: String::from("/dev/sda1"),
        volume_size: 10,
        encrypted: true,
        delete_on_termination: true,
    };
}

/// One single-instance autoscaling group per configured zone, each pinned to
/// the first private subnet of its zone.
pub fn declare_fleet(
    ctx: &DeploymentContext,
    provider: &mut dyn CloudProvider,
    renderer: &TemplateRenderer,
    templates: &BootstrapTemplates,
    settings: &FleetSettings,
) -> Result<Vec<Handle>> {
    let props = settings.props;
    let zones = network::zone_subnets(ctx, settings.network, &props.availability_zones)?;

    let mut groups = vec![];
    for (zone, subnet) in zones {
        let placeholders = zone_placeholders(ctx, settings, &zone, &subnet.subnet_id)?;
        let init = bootstrap(
            renderer,
            templates,
            &placeholders,
            &props.gitlab_runner_version,
        )?;

        let spec = AutoScalingGroupSpec {
            instance_type: props.instance_type.clone(),
            machine_image: String::from(MACHINE_IMAGE),
            subnets: vec![subnet.subnet_id.clone()],
            min_size: 1,
            max_size: 1,
            role: settings.role.clone(),
            key_name: props
                .ssh_key_name
                .clone()
                .filter(|key_name| !key_name.is_empty()),
            block_devices: vec![root_volume()],
            security_groups: vec![settings.security_group.clone()],
            allow_all_outbound: false,
            signals_wait_for_all: true,
            init,
        };

        let id = format!("RunnerAsg{}", logical_name(&zone));
        let handle = provider
            .declare_autoscaling_group(&id, &spec)
            .context(format!("declaring autoscaling group for zone {}", zone))?;
        tracing::info!(
            zone = %ctx.zone(&zone),
            subnet = %subnet.subnet_id,
            "declared runner autoscaling group"
        );
        groups.push(handle);
    }

    return Ok(groups);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NetworkCatalog, Subnet, SubnetKind};
    use crate::provider::{RecordingProvider, AUTOSCALING_GROUP};
    use crate::template::Strictness;

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("123456789012", "eu-west-1").unwrap()
    }

    fn network() -> Network {
        Network {
            vpc_id: String::from("vpc-1"),
            cidr: None,
            subnets: ["a", "b"]
                .iter()
                .map(|zone| Subnet {
                    subnet_id: format!("subnet-{}", zone),
                    availability_zone: format!("eu-west-1{}", zone),
                    kind: SubnetKind::Private,
                })
                .collect(),
        }
    }

    fn templates() -> BootstrapTemplates {
        BootstrapTemplates {
            register_script: String::from(
                "#!/bin/bash\nTOKEN=$(aws secretsmanager get-secret-value --secret-id __GITLAB_RUNNER_TOKEN_SECRET_NAME__ --region __REGION__)\necho ${HOME} __RUNNER_NAME__ __CACHE_BUCKET__\n",
            ),
            runner_config: String::from("concurrent = __CONCURRENT_JOBS__\n"),
            fargate_config: String::from(
                "Cluster = \"__ECS_CLUSTER__\"\nSubnet = \"__SUBNET_ID__\"\nSecurityGroup = \"__SECURITY_GROUP_ID__\"\nTaskDefinition = \"__TASK_DEFINITION__\"\n",
            ),
            cloudwatch_agent_config: String::from("{}"),
            service_unit: String::from("[Unit]\nDescription=GitLab Runner\n"),
        }
    }

    fn provider() -> RecordingProvider {
        let catalog = NetworkCatalog::default().with_network(network());
        RecordingProvider::new("RunnerStack", &ctx(), catalog)
    }

    #[test]
    fn spot_capacity_is_preferred() {
        let spec = cluster_spec("RunnerStack-cluster", CapacityWeights::default());
        let strategy = &spec.default_capacity_provider_strategy;
        assert_eq!(strategy[0].capacity_provider, FARGATE_SPOT);
        assert_eq!(strategy[0].weight, 100);
        assert_eq!(strategy[1].capacity_provider, FARGATE);
        assert_eq!(strategy[1].weight, 10);
        assert_eq!(spec.cluster_settings[0].name, "containerInsights");
    }

    #[test]
    fn coordinator_task_definition() {
        let image = Handle::Literal(String::from("registry.example.com/ci-coordinator:latest"));
        let container = container_definition(
            &ctx(),
            ContainerSettings::coordinator(image, "/Gitlab/Runner/"),
        );
        let spec = task_definition_spec(
            "ci-coordinator",
            TaskSizing {
                cpu: 256,
                memory: 512,
            },
            &Handle::reference("TaskRole"),
            &Handle::reference("ExecutionRole"),
            vec![container],
        );

        assert_eq!(spec.cpu, "256");
        assert_eq!(spec.memory, "512");
        assert_eq!(spec.network_mode, "awsvpc");
        assert_eq!(spec.container_definitions.len(), 1);
        let container = &spec.container_definitions[0];
        assert_eq!(container.name, "ci-coordinator");
        assert_eq!(container.port_mappings.len(), 1);
        assert_eq!(container.port_mappings[0].container_port, 22);
        assert_eq!(
            container.log_configuration.options.get("awslogs-region"),
            Some(&String::from("eu-west-1"))
        );
        assert_eq!(
            spec.task_role_arn,
            Handle::Attribute {
                target: (String::from("TaskRole"), String::from("Arn"))
            }
        );
    }

    #[test]
    fn local_images_become_assets() {
        let mut provider = provider();
        let handle = container_image(&mut provider, "ci-coordinator", None).unwrap();
        assert!(handle.literal().unwrap().ends_with("/runner-images:ci-coordinator"));
        assert!(provider.graph().assets.contains_key("CiCoordinatorImage"));

        let prebuilt = container_image(&mut provider, "other", Some("public.ecr.aws/x/y:1")).unwrap();
        assert_eq!(prebuilt, Handle::Literal(String::from("public.ecr.aws/x/y:1")));
    }

    #[test]
    fn logical_names() {
        assert_eq!(logical_name("ci-coordinator"), "CiCoordinator");
        assert_eq!(logical_name("a"), "A");
        assert_eq!(logical_name("my_image.v2"), "MyImageV2");
        assert_eq!(logical_name("API_TOKEN"), "ApiToken");
    }

    #[test]
    fn service_deployment_policy() {
        let props = ServiceProps {
            desired_count: 2,
            minimum_healthy_percent: 50,
            maximum_percent: 200,
            circuit_breaker: false,
            rollback: true,
            enable_execute_command: true,
        };
        let placement = ServicePlacement {
            cluster: Handle::reference("Cluster"),
            subnets: vec![String::from("subnet-a")],
            security_groups: vec![Handle::reference("Group")],
        };
        let spec = service_spec(
            "runner-manager",
            &Handle::reference("TaskDefinition"),
            &placement,
            &props,
            CapacityWeights::default(),
        );

        assert_eq!(spec.desired_count, 2);
        assert_eq!(spec.deployment_configuration.minimum_healthy_percent, 50);
        assert!(!spec.deployment_configuration.deployment_circuit_breaker.enable);
        assert!(!spec.deployment_configuration.deployment_circuit_breaker.rollback);
        assert!(spec.enable_execute_command);
        assert_eq!(
            spec.network_configuration.awsvpc_configuration.assign_public_ip,
            "DISABLED"
        );
    }

    #[test]
    fn deferred_rendering_escapes_shell_variables() {
        let placeholders = PlaceholderMap::new().with("__SECURITY_GROUP_ID__", "${Group.GroupId}");
        let content = render_deferred(
            &TemplateRenderer::default(),
            "fargate.toml",
            "sg=__SECURITY_GROUP_ID__ home=${HOME}",
            &placeholders,
        )
        .unwrap();
        assert_eq!(
            content,
            Content::Substitution {
                template: String::from("sg=${Group.GroupId} home=${!HOME}")
            }
        );
    }

    #[test]
    fn zone_placeholders_escape_literal_values_only() {
        let mut props = BastionProps::default();
        props.gitlab_server = String::from("https://${GITLAB_HOST}");
        props.runner_tags = String::from("fargate,${TAG}");
        let network = network();
        let security_group = Handle::reference("BastionSecurityGroup");
        let task_definition = Handle::Literal(String::from("family-${X}"));
        let role = Handle::Literal(String::from("arn:aws:iam::123456789012:role/runner"));
        let settings = FleetSettings {
            stack_name: "RunnerStack",
            props: &props,
            network: &network,
            security_group: &security_group,
            role: &role,
            cluster_name: "RunnerStack-cluster",
            task_definition: &task_definition,
            cache_bucket: "runner-cache",
            cloudwatch_parameter: "/Gitlab/Runner/CloudWatchAgentConfig",
        };

        let placeholders = zone_placeholders(&ctx(), &settings, "a", "subnet-a").unwrap();
        assert_eq!(
            placeholders.get("__GITLAB_SERVER__"),
            Some("https://${!GITLAB_HOST}")
        );
        assert_eq!(placeholders.get("__GITLAB_RUNNER_TAGS__"), Some("fargate,${!TAG}"));
        assert_eq!(placeholders.get("__TASK_DEFINITION__"), Some("family-${!X}"));
        assert_eq!(
            placeholders.get("__SECURITY_GROUP_ID__"),
            Some("${BastionSecurityGroup.GroupId}")
        );
        assert_eq!(placeholders.get("__REGION__"), Some("eu-west-1"));
    }

    #[test]
    fn fleet_has_one_group_per_zone_with_rendered_bootstrap() {
        let ctx = ctx();
        let mut provider = provider();
        let network = provider.lookup_network("vpc-1").unwrap();
        let props = BastionProps::default();
        let security_group = network::security_group(
            &mut provider,
            "BastionSecurityGroup",
            &network,
            &network::SecurityGroupOptions::default(),
        )
        .unwrap();
        let task_definition = Handle::Literal(String::from("ci-coordinator"));
        let role = Handle::Literal(String::from("arn:aws:iam::123456789012:role/runner"));
        let settings = FleetSettings {
            stack_name: "RunnerStack",
            props: &props,
            network: &network,
            security_group: &security_group,
            role: &role,
            cluster_name: "RunnerStack-cluster",
            task_definition: &task_definition,
            cache_bucket: "runner-cache",
            cloudwatch_parameter: "/Gitlab/Runner/CloudWatchAgentConfig",
        };

        let groups = declare_fleet(
            &ctx,
            &mut provider,
            &TemplateRenderer::new(Strictness::Strict),
            &templates(),
            &settings,
        )
        .unwrap();
        assert_eq!(groups.len(), 2);

        let graph = provider.graph();
        assert_eq!(graph.resources_of_kind(AUTOSCALING_GROUP).count(), 2);
        let group_b = graph.properties("RunnerAsgB").unwrap();
        assert_eq!(group_b["Subnets"], serde_json::json!(["subnet-b"]));
        assert_eq!(group_b["AllowAllOutbound"], false);

        let rendered = serde_json::to_string(&group_b["Init"]).unwrap();
        assert!(!rendered.contains("__"));
        assert!(rendered.contains("RunnerStack-b-runner"));
        assert!(rendered.contains("Subnet = \\\"subnet-b\\\""));
        assert!(rendered.contains("${BastionSecurityGroup.GroupId}"));
        assert!(rendered.contains("${!HOME}"));
        assert!(rendered.contains("gitlab-runner-15.11.0"));
    }

    #[test]
    fn fleet_fails_on_unresolved_placeholder() {
        let ctx = ctx();
        let mut provider = provider();
        let network = network();
        let props = BastionProps::default();
        let handle = Handle::Literal(String::from("sg-1"));
        let settings = FleetSettings {
            stack_name: "RunnerStack",
            props: &props,
            network: &network,
            security_group: &handle,
            role: &handle,
            cluster_name: "cluster",
            task_definition: &handle,
            cache_bucket: "bucket",
            cloudwatch_parameter: "param",
        };
        let mut templates = templates();
        templates.runner_config.push_str("token = \"__UNKNOWN_TOKEN__\"\n");

        match declare_fleet(&ctx, &mut provider, &TemplateRenderer::default(), &templates, &settings) {
            Err(crate::error::Error::Template(source)) => {
                assert!(source.to_string().contains("__UNKNOWN_TOKEN__"))
            }
            other => panic!("Expected `Template` error, got {:?}", other),
        }
        assert_eq!(provider.graph().resources_of_kind(AUTOSCALING_GROUP).count(), 0);
    }
}
