//! Stack assembly.
//!
//! The runner stack owns the network wiring, the cluster and the runner fleet
//! (or the runner manager service). The task definition stack only adds a job
//! image and, when configured, a service on the runner cluster; everything it
//! needs from the runner stack arrives as [`StackOutputs`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::compute::{
    self, CapacityWeights, ContainerSettings, FleetSettings, ServicePlacement, TaskSizing,
};
use crate::config::{self, Config, FleetMode};
use crate::context::{DeploymentContext, NetworkCatalog};
use crate::error::{ProviderContext, Result};
use crate::network::{self, SecurityGroupOptions};
use crate::policy::{self, InlinePolicy, NamedPolicies, PolicyDocument, PolicyStatement};
use crate::provider::{CloudProvider, Handle, RecordingProvider, ResourceGraph};
use crate::resources::{
    BucketSpec, ContainerSecret, KeyValuePair, LogGroupSpec, ParameterSpec, RemovalPolicy,
    RoleSpec,
};
use crate::template::{BootstrapTemplates, TemplateRenderer};

pub const CLOUDWATCH_AGENT_PARAMETER: &str = "/Gitlab/Runner/CloudWatchAgentConfig";
pub const LOG_RETENTION_DAYS: u32 = 30;

pub const EC2_PRINCIPAL: &str = "ec2.amazonaws.com";
pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

pub const BASTION_ROLE: &str = "GitlabBastionRole";
pub const EXECUTION_ROLE: &str = "GitlabExecutionRole";
pub const TASK_ROLE: &str = "GitlabTaskRole";
pub const MANAGER_TASK_ROLE: &str = "RunnerManagerTaskRole";
pub const SECURITY_GROUP: &str = "BastionSecurityGroup";
pub const CLUSTER: &str = "FargateCluster";
pub const CACHE_BUCKET: &str = "CacheBucket";
pub const RUNNER_TOKEN_SECRET: &str = "RunnerTokenSecret";

pub const OUTPUT_VPC: &str = "VpcId";
pub const OUTPUT_SECURITY_GROUP: &str = "SecurityGroupId";
pub const OUTPUT_CLUSTER: &str = "ClusterName";
pub const OUTPUT_TASK_DEFINITION: &str = "TaskDefinitionArn";
pub const OUTPUT_BUCKET: &str = "CacheBucketName";
pub const OUTPUT_LOG_GROUP: &str = "LogGroupName";

const INLINE_POLICY_NAME: &str = "TaskInlinePolicy";
const MANAGER_IMAGE: &str = "gitlab/gitlab-runner";

/// What one stack hands to the stacks that depend on it: the configuration it
/// was built from and the handles it resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub stack_name: String,
    pub config: Config,
    /// Identifier of the looked-up VPC.
    pub network: Option<String>,
    pub security_group: Option<Handle>,
    pub cluster: Option<Handle>,
    pub cluster_name: Option<String>,
    pub task_definition: Option<Handle>,
    pub bucket_name: Option<String>,
    pub log_group_name: Option<String>,
}

pub fn export_name(stack_name: &str, key: &str) -> String {
    return format!("{}-{}", stack_name, key);
}

impl StackOutputs {
    /// The same outputs as seen from another stack: handles into this stack's
    /// graph become imports of the matching exports.
    pub fn exported(&self) -> Self {
        let import = |handle: &Option<Handle>, key: &str| -> Option<Handle> {
            handle.as_ref().map(|handle| match handle {
                Handle::Ref { .. } | Handle::Attribute { .. } => Handle::Import {
                    export_name: export_name(&self.stack_name, key),
                },
                other => other.clone(),
            })
        };

        return Self {
            security_group: import(&self.security_group, OUTPUT_SECURITY_GROUP),
            cluster: import(&self.cluster, OUTPUT_CLUSTER),
            task_definition: import(&self.task_definition, OUTPUT_TASK_DEFINITION),
            ..self.clone()
        };
    }

    /// Outputs of an already deployed stack, keyed by output name.
    pub fn from_deployed(
        stack_name: &str,
        config: &Config,
        outputs: &BTreeMap<String, String>,
    ) -> Self {
        let literal = |key: &str| outputs.get(key).map(|value| Handle::Literal(value.clone()));

        return Self {
            stack_name: stack_name.to_string(),
            config: config.clone(),
            network: outputs.get(OUTPUT_VPC).cloned(),
            security_group: literal(OUTPUT_SECURITY_GROUP),
            cluster: literal(OUTPUT_CLUSTER),
            cluster_name: outputs.get(OUTPUT_CLUSTER).cloned(),
            task_definition: literal(OUTPUT_TASK_DEFINITION),
            bucket_name: outputs.get(OUTPUT_BUCKET).cloned(),
            log_group_name: outputs.get(OUTPUT_LOG_GROUP).cloned(),
        };
    }
}

/// A recorded stack together with what it exposes to dependent stacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesized {
    pub graph: ResourceGraph,
    pub outputs: StackOutputs,
}

pub fn synth_runner(
    ctx: &DeploymentContext,
    config: &Config,
    renderer: &TemplateRenderer,
    templates: &BootstrapTemplates,
    catalog: NetworkCatalog,
) -> Result<Synthesized> {
    let mut provider =
        RecordingProvider::new(&config.bastion_stack_name(), ctx, catalog).with_tags(&config.tags);
    let outputs = build_runner_stack(ctx, config, renderer, templates, &mut provider)?;
    return Ok(Synthesized {
        graph: provider.into_graph(),
        outputs,
    });
}

pub fn synth_task_definition(
    ctx: &DeploymentContext,
    config: &Config,
    renderer: &TemplateRenderer,
    catalog: NetworkCatalog,
    prior: Option<&StackOutputs>,
) -> Result<Synthesized> {
    let mut provider = RecordingProvider::new(&config.task_definition_stack_name()?, ctx, catalog)
        .with_tags(&config.tags);
    let outputs = build_task_definition_stack(ctx, config, renderer, &mut provider, prior)?;
    return Ok(Synthesized {
        graph: provider.into_graph(),
        outputs,
    });
}

const DEFAULT_BUCKET_PREFIX: &str = "gitlab";

/// S3 bucket names are global, lower-case, at most 63 characters and start
/// with a letter or digit.
pub fn cache_bucket_name(ctx: &DeploymentContext, app_name: &str) -> String {
    let app: String = app_name
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let app = match app.trim_start_matches('-') {
        "" => DEFAULT_BUCKET_PREFIX,
        trimmed => trimmed,
    };
    let mut name = format!("{}-runner-cache-{}-{}", app, ctx.account, ctx.region);
    name.truncate(63);
    return name.trim_end_matches('-').to_string();
}

fn declare_role(
    provider: &mut dyn CloudProvider,
    id: &str,
    principal: &str,
    managed_policies: &[String],
    inline_policies: NamedPolicies,
) -> Result<Handle> {
    for inline in &inline_policies {
        inline.policy_document.check_qualified()?;
    }
    let spec = RoleSpec {
        assume_role_policy_document: PolicyDocument::new(vec![PolicyStatement::assume_role(
            principal,
        )]),
        managed_policy_arns: managed_policies
            .iter()
            .map(|name| policy::managed_policy_arn(name))
            .collect(),
        inline_policies,
    };
    return provider
        .declare_role(id, &spec)
        .context(format!("declaring role {}", id));
}

fn declare_log_group(
    provider: &mut dyn CloudProvider,
    id: &str,
    log_group_name: &str,
) -> Result<Handle> {
    let spec = LogGroupSpec {
        log_group_name: log_group_name.to_string(),
        retention_in_days: LOG_RETENTION_DAYS,
    };
    return provider
        .declare_log_group(id, &spec)
        .context(format!("declaring log group {}", log_group_name));
}

fn declare_outputs(
    provider: &mut dyn CloudProvider,
    stack_name: &str,
    outputs: Vec<(&str, Handle)>,
) -> Result<()> {
    for (key, value) in outputs {
        provider
            .declare_output(key, &value, Some(export_name(stack_name, key)))
            .context(format!("declaring output {}", key))?;
    }
    return Ok(());
}

fn names(values: &[&str]) -> Vec<String> {
    return values.iter().map(|value| value.to_string()).collect();
}

/// Declares the runner stack: cache bucket, roles, security group, cluster,
/// job task definition and either the autoscaling fleet or the runner
/// manager service.
pub fn build_runner_stack(
    ctx: &DeploymentContext,
    config: &Config,
    renderer: &TemplateRenderer,
    templates: &BootstrapTemplates,
    provider: &mut dyn CloudProvider,
) -> Result<StackOutputs> {
    config.check_required()?;
    let props = &config.bastion;
    let stack_name = config.bastion_stack_name();
    let vpc_id = props.network_id()?;

    let network = network::lookup(provider, vpc_id)?;

    let bucket_name = cache_bucket_name(ctx, &config.app_name);
    let bucket_arn = format!("arn:aws:s3:::{}", bucket_name);
    provider
        .declare_bucket(
            CACHE_BUCKET,
            &BucketSpec {
                bucket_name: bucket_name.clone(),
                block_public_access: true,
                encryption: String::from("aws:kms"),
                enforce_ssl: true,
                removal_policy: RemovalPolicy::retain_if(props.retain_cache_bucket),
            },
        )
        .context("declaring cache bucket")?;

    let token_secret = props.gitlab_runner_token_secret_name.as_str();
    let execution_inline = match props.fleet {
        FleetMode::Service => vec![policy::secret_reader(ctx, &[token_secret])],
        FleetMode::Autoscaling => vec![],
    };
    let execution_role = declare_role(
        provider,
        EXECUTION_ROLE,
        ECS_TASKS_PRINCIPAL,
        &names(&["service-role/AmazonECSTaskExecutionRolePolicy"]),
        execution_inline,
    )?;
    let task_role = declare_role(
        provider,
        TASK_ROLE,
        ECS_TASKS_PRINCIPAL,
        &names(&["AmazonEC2ContainerRegistryReadOnly"]),
        vec![policy::log_writer(ctx)],
    )?;

    let security_group = network::security_group(
        provider,
        SECURITY_GROUP,
        &network,
        &SecurityGroupOptions {
            description: format!("{} runner security group", stack_name),
            allow_http_egress: props.allow_http_egress,
        },
    )?;

    let cluster_name = format!("{}-cluster", stack_name);
    let weights = CapacityWeights::default();
    let cluster = compute::declare_cluster(provider, CLUSTER, &cluster_name, weights)?;

    declare_log_group(provider, "RunnerLogGroup", &props.log_group)?;

    let image = compute::container_image(
        provider,
        &props.docker_image_name,
        props.docker_image_uri.as_deref(),
    )?;
    let task_definition_spec = compute::task_definition_spec(
        &props.docker_image_name,
        TaskSizing {
            cpu: props.task_definition_cpu,
            memory: props.task_definition_memory,
        },
        &task_role,
        &execution_role,
        vec![compute::container_definition(
            ctx,
            ContainerSettings::coordinator(image, &props.log_group),
        )],
    );
    let task_definition = compute::declare_task_definition(
        provider,
        &format!("{}TaskDefinition", compute::logical_name(&props.docker_image_name)),
        &task_definition_spec,
    )?;

    match props.fleet {
        FleetMode::Autoscaling => {
            let bastion_role = declare_role(
                provider,
                BASTION_ROLE,
                EC2_PRINCIPAL,
                &names(&["service-role/AmazonEC2RoleforSSM", "AmazonECS_FullAccess"]),
                vec![
                    policy::parameter_reader(ctx),
                    policy::log_writer(ctx),
                    policy::secret_reader(ctx, &[token_secret]),
                    policy::bucket_user(&bucket_arn),
                ],
            )?;
            provider
                .declare_parameter(
                    "CloudWatchAgentConfig",
                    &ParameterSpec {
                        name: String::from(CLOUDWATCH_AGENT_PARAMETER),
                        value: templates.cloudwatch_agent_config.clone(),
                        description: String::from("CloudWatch agent configuration"),
                    },
                )
                .context("declaring CloudWatch agent parameter")?;

            let settings = FleetSettings {
                stack_name: &stack_name,
                props,
                network: &network,
                security_group: &security_group,
                role: &bastion_role,
                cluster_name: &cluster_name,
                task_definition: &task_definition,
                cache_bucket: &bucket_name,
                cloudwatch_parameter: CLOUDWATCH_AGENT_PARAMETER,
            };
            compute::declare_fleet(ctx, provider, renderer, templates, &settings)?;
        }
        FleetMode::Service => {
            let manager = ManagerSettings {
                stack_name: &stack_name,
                config,
                cluster: &cluster,
                cluster_name: &cluster_name,
                security_group: &security_group,
                task_definition: &task_definition,
                execution_role: &execution_role,
                bucket_name: &bucket_name,
                bucket_arn: &bucket_arn,
            };
            let subnets: Vec<String> =
                network::zone_subnets(ctx, &network, &props.availability_zones)?
                    .into_iter()
                    .map(|(_, subnet)| subnet.subnet_id.clone())
                    .collect();
            declare_manager_service(ctx, provider, &manager, subnets, weights)?;
        }
    }

    declare_outputs(
        provider,
        &stack_name,
        vec![
            (OUTPUT_VPC, Handle::Literal(network.vpc_id.clone())),
            (OUTPUT_SECURITY_GROUP, security_group.attribute("GroupId")),
            (OUTPUT_CLUSTER, cluster.clone()),
            (OUTPUT_TASK_DEFINITION, task_definition.clone()),
            (OUTPUT_BUCKET, Handle::Literal(bucket_name.clone())),
            (OUTPUT_LOG_GROUP, Handle::Literal(props.log_group.clone())),
        ],
    )?;

    tracing::info!(stack = %stack_name, fleet = ?props.fleet, "assembled runner stack");
    return Ok(StackOutputs {
        stack_name,
        config: config.clone(),
        network: Some(network.vpc_id.clone()),
        security_group: Some(security_group),
        cluster: Some(cluster),
        cluster_name: Some(cluster_name),
        task_definition: Some(task_definition),
        bucket_name: Some(bucket_name),
        log_group_name: Some(props.log_group.clone()),
    });
}

struct ManagerSettings<'a> {
    stack_name: &'a str,
    config: &'a Config,
    cluster: &'a Handle,
    cluster_name: &'a str,
    security_group: &'a Handle,
    task_definition: &'a Handle,
    execution_role: &'a Handle,
    bucket_name: &'a str,
    bucket_arn: &'a str,
}

/// Runs the runner manager itself as a Fargate service. The registration
/// token is injected as a container secret.
fn declare_manager_service(
    ctx: &DeploymentContext,
    provider: &mut dyn CloudProvider,
    manager: &ManagerSettings,
    subnets: Vec<String>,
    weights: CapacityWeights,
) -> Result<Handle> {
    let props = &manager.config.bastion;
    let token = provider
        .declare_secret_reference(RUNNER_TOKEN_SECRET, &props.gitlab_runner_token_secret_name)
        .context("referencing runner token secret")?;

    let manager_role = declare_role(
        provider,
        MANAGER_TASK_ROLE,
        ECS_TASKS_PRINCIPAL,
        &[],
        vec![
            policy::task_launcher(ctx, manager.cluster_name),
            policy::bucket_user(manager.bucket_arn),
            policy::log_writer(ctx),
        ],
    )?;

    let security_group_id = manager.security_group.attribute("GroupId");
    let literal = |value: &str| Handle::Literal(value.to_string());
    let mut environment = vec![
        ("GITLAB_SERVER", literal(&props.gitlab_server)),
        ("RUNNER_NAME", literal(&format!("{}-runner", manager.stack_name))),
        ("RUNNER_TAGS", literal(&props.runner_tags)),
        (
            "RUNNER_OUTPUT_LIMIT",
            literal(&props.runner_log_output_limit.to_string()),
        ),
        ("CONCURRENT_JOBS", literal(&props.concurrent_jobs.to_string())),
        ("CACHE_BUCKET", literal(manager.bucket_name)),
        ("AWS_REGION", literal(&ctx.region)),
        ("FARGATE_CLUSTER", literal(manager.cluster_name)),
        ("FARGATE_SECURITY_GROUP", security_group_id.clone()),
        ("FARGATE_TASK_DEFINITION", manager.task_definition.clone()),
        ("SSH_USERNAME", literal(&props.default_ssh_username)),
    ];
    if let Some(subnet) = subnets.first() {
        environment.push(("FARGATE_SUBNET", literal(subnet)));
    }

    let mut settings = ContainerSettings {
        name: String::from("runner-manager"),
        image: Handle::Literal(format!("{}:alpine-v{}", MANAGER_IMAGE, props.gitlab_runner_version)),
        ports: vec![],
        log_group: props.log_group.clone(),
        secrets: vec![ContainerSecret {
            name: String::from("RUNNER_TOKEN"),
            value_from: token,
        }],
        environment: vec![],
    };
    settings.environment = environment
        .into_iter()
        .map(|(name, value)| KeyValuePair {
            name: name.to_string(),
            value,
        })
        .collect();

    let family = format!("{}-runner-manager", manager.stack_name);
    let spec = compute::task_definition_spec(
        &family,
        TaskSizing {
            cpu: props.task_definition_cpu,
            memory: props.task_definition_memory,
        },
        &manager_role,
        manager.execution_role,
        vec![compute::container_definition(ctx, settings)],
    );
    let manager_task = compute::declare_task_definition(provider, "RunnerManagerTaskDefinition", &spec)?;

    let placement = ServicePlacement {
        cluster: manager.cluster.clone(),
        subnets,
        security_groups: vec![security_group_id],
    };
    let service = compute::service_spec(&family, &manager_task, &placement, &props.service, weights);
    return compute::declare_service(provider, "RunnerManagerService", &service);
}

/// Handles the task definition stack borrows from the runner stack.
struct PriorPlacement {
    vpc_id: String,
    cluster: Handle,
    security_group: Handle,
}

fn require<'a, T>(value: &'a Option<T>, name: &str) -> std::result::Result<&'a T, config::Error> {
    return value
        .as_ref()
        .ok_or_else(|| config::Error::MissingReference(name.to_string()));
}

fn prior_placement(prior: Option<&StackOutputs>) -> std::result::Result<PriorPlacement, config::Error> {
    let prior = match prior {
        Some(prior) => prior,
        None => return Err(config::Error::MissingReference(String::from("runner stack outputs"))),
    };
    return Ok(PriorPlacement {
        vpc_id: require(&prior.network, "network")?.clone(),
        cluster: require(&prior.cluster, "cluster")?.clone(),
        security_group: require(&prior.security_group, "security_group")?.clone(),
    });
}

/// Declares a job image task definition, optionally run as a service on the
/// runner cluster. Cross-stack references are resolved before anything is
/// declared.
pub fn build_task_definition_stack(
    ctx: &DeploymentContext,
    config: &Config,
    renderer: &TemplateRenderer,
    provider: &mut dyn CloudProvider,
    prior: Option<&StackOutputs>,
) -> Result<StackOutputs> {
    config.check_required()?;
    let props = &config.task_definition;
    let image_name = props.image_name()?;
    let stack_name = config.task_definition_stack_name()?;
    let log_group_name = props.log_group_name()?;
    let logical = compute::logical_name(image_name);

    let placement = match &props.service {
        Some(service) => Some((service, prior_placement(prior)?)),
        None => None,
    };

    let secret_names: Vec<&str> = props.secrets.values().map(String::as_str).collect();
    let execution_inline = if secret_names.is_empty() {
        vec![]
    } else {
        vec![policy::secret_reader(ctx, &secret_names)]
    };
    let execution_role = declare_role(
        provider,
        EXECUTION_ROLE,
        ECS_TASKS_PRINCIPAL,
        &names(&["service-role/AmazonECSTaskExecutionRolePolicy"]),
        execution_inline,
    )?;

    let inline_policies = match &props.iam_policy_template {
        Some(path) => match policy::load_inline_template(renderer, path, ctx)? {
            Some(document) => vec![InlinePolicy {
                policy_name: String::from(INLINE_POLICY_NAME),
                policy_document: document,
            }],
            None => vec![],
        },
        None => vec![],
    };
    let mut managed_policies = names(&["AmazonEC2ContainerRegistryReadOnly"]);
    managed_policies.extend(props.managed_policies.iter().cloned());
    let task_role = declare_role(
        provider,
        TASK_ROLE,
        ECS_TASKS_PRINCIPAL,
        &managed_policies,
        inline_policies,
    )?;

    declare_log_group(provider, &format!("{}LogGroup", logical), &log_group_name)?;

    let mut secrets = vec![];
    for (variable, secret_name) in &props.secrets {
        let value_from = provider
            .declare_secret_reference(
                &format!("{}Secret", compute::logical_name(variable)),
                secret_name,
            )
            .context(format!("referencing secret {}", secret_name))?;
        secrets.push(ContainerSecret {
            name: variable.clone(),
            value_from,
        });
    }

    let image = compute::container_image(provider, image_name, props.docker_image_uri.as_deref())?;
    let mut container = ContainerSettings::coordinator(image, &log_group_name);
    container.secrets = secrets;
    container.environment = compute::environment(&props.environment);

    let spec = compute::task_definition_spec(
        image_name,
        TaskSizing {
            cpu: props.task_definition_cpu,
            memory: props.task_definition_memory,
        },
        &task_role,
        &execution_role,
        vec![compute::container_definition(ctx, container)],
    );
    let task_definition =
        compute::declare_task_definition(provider, &format!("{}TaskDefinition", logical), &spec)?;

    if let Some((service, borrowed)) = placement {
        let network = network::lookup(provider, &borrowed.vpc_id)?;
        let placement = ServicePlacement {
            cluster: borrowed.cluster,
            subnets: network.all_private_subnet_ids(),
            security_groups: vec![borrowed.security_group.attribute("GroupId")],
        };
        let spec = compute::service_spec(
            &format!("{}-service", image_name),
            &task_definition,
            &placement,
            service,
            CapacityWeights::default(),
        );
        compute::declare_service(provider, &format!("{}Service", logical), &spec)?;
    }

    declare_outputs(
        provider,
        &stack_name,
        vec![
            (OUTPUT_TASK_DEFINITION, task_definition.clone()),
            (OUTPUT_LOG_GROUP, Handle::Literal(log_group_name.clone())),
        ],
    )?;

    tracing::info!(stack = %stack_name, image = image_name, "assembled task definition stack");
    return Ok(StackOutputs {
        stack_name,
        config: config.clone(),
        network: prior.and_then(|prior| prior.network.clone()),
        security_group: None,
        cluster: None,
        cluster_name: None,
        task_definition: Some(task_definition),
        bucket_name: None,
        log_group_name: Some(log_group_name),
    });
}
