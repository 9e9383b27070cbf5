use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::{fs, io, path::Path, path::PathBuf};
use validator::Validate;

/// Fargate accepts only these task CPU units.
pub const FARGATE_CPU_UNITS: [u32; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

/// Stack names start with a letter and hold at most 128 alphanumerics and
/// hyphens.
pub static STACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").unwrap());

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Missing required key `{0}`")]
    MissingKey(String),

    #[error("Unknown override `{0}`")]
    UnknownOverride(String),

    #[error("Invalid value `{value}` for override `{key}`")]
    InvalidOverride { key: String, value: String },

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Missing cross-stack reference `{0}`")]
    MissingReference(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FleetMode {
    /// One autoscaling group per zone, bootstrapped from rendered templates.
    #[default]
    Autoscaling,
    /// Runner manager running as a managed Fargate service.
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServiceProps {
    #[validate(range(max = 1000))]
    pub desired_count: u32,

    #[validate(range(max = 100))]
    pub minimum_healthy_percent: u32,

    #[validate(range(min = 100, max = 400))]
    pub maximum_percent: u32,

    pub circuit_breaker: bool,
    pub rollback: bool,
    pub enable_execute_command: bool,
}

impl Default for ServiceProps {
    fn default() -> Self {
        return Self {
            desired_count: 1,
            minimum_healthy_percent: 100,
            maximum_percent: 200,
            circuit_breaker: true,
            rollback: true,
            enable_execute_command: true,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BastionProps {
    #[serde(rename = "VpcId", alias = "vpc_id")]
    pub vpc_id: Option<String>,

    #[validate(regex = "STACK_NAME")]
    pub stack_name: Option<String>,

    pub ssh_key_name: Option<String>,

    #[validate(length(min = 1))]
    pub gitlab_server: String,

    #[validate(length(min = 1))]
    pub gitlab_runner_token_secret_name: String,

    #[validate(length(min = 1))]
    pub gitlab_runner_version: String,

    pub runner_tags: String,

    #[validate(range(min = 1))]
    pub runner_log_output_limit: u32,

    #[validate(range(min = 1))]
    pub concurrent_jobs: u32,

    #[validate(length(min = 1))]
    pub default_ssh_username: String,

    #[validate(length(min = 1))]
    pub docker_image_name: String,

    pub docker_image_uri: Option<String>,

    pub task_definition_cpu: u32,

    #[validate(range(min = 512, max = 122880))]
    pub task_definition_memory: u32,

    pub fleet: FleetMode,

    #[validate(length(min = 1))]
    pub availability_zones: Vec<String>,

    #[validate(length(min = 1))]
    pub instance_type: String,

    #[validate(length(min = 1))]
    pub log_group: String,

    pub allow_http_egress: bool,

    /// Keep the cache bucket when the stack is deleted.
    pub retain_cache_bucket: bool,

    #[validate]
    pub service: ServiceProps,
}

impl Default for BastionProps {
    fn default() -> Self {
        return Self {
            vpc_id: None,
            stack_name: None,
            ssh_key_name: None,
            gitlab_server: String::from("https://gitlab.com"),
            gitlab_runner_token_secret_name: String::from("gitlab-runner-token"),
            gitlab_runner_version: String::from("15.11.0"),
            runner_tags: String::from("fargate"),
            runner_log_output_limit: 4096,
            concurrent_jobs: 10,
            default_ssh_username: String::from("root"),
            docker_image_name: String::from("ci-coordinator"),
            docker_image_uri: None,
            task_definition_cpu: 256,
            task_definition_memory: 512,
            fleet: FleetMode::default(),
            availability_zones: vec![String::from("a"), String::from("b")],
            instance_type: String::from("t3.nano"),
            log_group: String::from("/Gitlab/Runner/"),
            allow_http_egress: false,
            retain_cache_bucket: false,
            service: ServiceProps::default(),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TaskDefinitionProps {
    #[validate(regex = "STACK_NAME")]
    pub stack_name: Option<String>,

    pub docker_image_name: Option<String>,

    pub docker_image_uri: Option<String>,

    pub task_definition_cpu: u32,

    #[validate(range(min = 512, max = 122880))]
    pub task_definition_memory: u32,

    pub managed_policies: Vec<String>,

    pub iam_policy_template: Option<PathBuf>,

    pub environment: BTreeMap<String, String>,

    /// Container variable name to secret name.
    pub secrets: BTreeMap<String, String>,

    pub log_group: Option<String>,

    #[validate]
    pub service: Option<ServiceProps>,
}

impl Default for TaskDefinitionProps {
    fn default() -> Self {
        return Self {
            stack_name: None,
            docker_image_name: None,
            docker_image_uri: None,
            task_definition_cpu: 256,
            task_definition_memory: 512,
            managed_policies: vec![],
            iam_policy_template: None,
            environment: BTreeMap::new(),
            secrets: BTreeMap::new(),
            log_group: None,
            service: None,
        };
    }
}

impl TaskDefinitionProps {
    pub fn image_name(&self) -> Result<&str, Error> {
        return match self.docker_image_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(Error::MissingKey(String::from(
                "task_definition.docker_image_name",
            ))),
        };
    }

    pub fn log_group_name(&self) -> Result<String, Error> {
        return match &self.log_group {
            Some(log_group) => Ok(log_group.clone()),
            None => Ok(format!("/Gitlab/{}/", self.image_name()?)),
        };
    }
}

impl BastionProps {
    pub fn network_id(&self) -> Result<&str, Error> {
        return match self.vpc_id.as_deref() {
            Some(vpc_id) if !vpc_id.trim().is_empty() => Ok(vpc_id),
            _ => Err(Error::MissingKey(String::from("bastion.VpcId"))),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(length(min = 1))]
    pub app_name: String,

    pub tags: BTreeMap<String, String>,

    #[validate]
    pub bastion: BastionProps,

    #[validate]
    pub task_definition: TaskDefinitionProps,
}

impl Default for Config {
    fn default() -> Self {
        return Self {
            app_name: String::from("GitlabRunner"),
            tags: BTreeMap::new(),
            bastion: BastionProps::default(),
            task_definition: TaskDefinitionProps::default(),
        };
    }
}

impl Config {
    pub fn bastion_stack_name(&self) -> String {
        return match &self.bastion.stack_name {
            Some(name) => name.clone(),
            None => format!("{}BastionStack", self.app_name),
        };
    }

    pub fn task_definition_stack_name(&self) -> Result<String, Error> {
        return match &self.task_definition.stack_name {
            Some(name) => Ok(name.clone()),
            None => Ok(format!(
                "{}TaskDefinitionStack",
                self.task_definition.image_name()?
            )),
        };
    }

    /// Checks the keys that must resolve before any resource is declared.
    pub fn check_required(&self) -> Result<(), Error> {
        self.bastion.network_id()?;
        self.task_definition.image_name()?;
        return Ok(());
    }

    /// Stack names derived from `app_name` and the image name must be valid
    /// too, not only the explicitly configured ones.
    pub fn check_stack_names(&self) -> Result<(), Error> {
        for stack_name in [self.bastion_stack_name(), self.task_definition_stack_name()?] {
            if !STACK_NAME.is_match(&stack_name) {
                return Err(Error::ValidationError(format!(
                    "stack name `{}` must start with a letter and contain only alphanumerics and hyphens",
                    stack_name
                )));
            }
        }
        return Ok(());
    }
}

/// Key/value overrides supplied at invocation time, e.g. `-c Memory=1024`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides(BTreeMap<String, String>);

impl Overrides {
    pub fn new() -> Self {
        return Self::default();
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        return self;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        return self.0.iter();
    }
}

impl FromIterator<(String, String)> for Overrides {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        return Self(iter.into_iter().collect());
    }
}

/// Parses a single `Key=Value` pair.
pub fn parse_override(raw: &str) -> Result<(String, String), Error> {
    return match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(Error::ParsingError(format!(
            "override `{}` is not of the form Key=Value",
            raw
        ))),
    };
}

/// Loads the configuration document, applies overrides and validates it.
///
/// A missing document is not fatal: defaults apply and the overrides must
/// supply whatever is required.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Config, Error> {
    let mut config = match path {
        Some(path) => read(path)?,
        None => Config::default(),
    };

    apply_overrides(&mut config, overrides)?;
    config.check_required()?;
    check_sizes(&config)?;
    config.check_stack_names()?;

    match config.validate() {
        Ok(_) => (),
        Err(error) => return Err(Error::ValidationError(error.to_string())),
    }

    tracing::debug!(
        app_name = %config.app_name,
        image = ?config.task_definition.docker_image_name,
        "configuration loaded"
    );
    return Ok(config);
}

fn read(path: &Path) -> Result<Config, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => raw_contents,
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "stack config file not found, using defaults"
                );
                return Ok(Config::default());
            }
            _ => return Err(Error::Unknown(error.to_string())),
        },
    };

    let config: Option<Config> = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    // An empty document deserializes to `None`.
    return Ok(config.unwrap_or_default());
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) -> Result<(), Error> {
    for (key, value) in overrides.iter() {
        tracing::debug!(%key, %value, "applying override");
        match key.as_str() {
            "DockerImageName" => config.task_definition.docker_image_name = Some(value.clone()),
            "Memory" => config.task_definition.task_definition_memory = parse_number(key, value)?,
            "CPU" => config.task_definition.task_definition_cpu = parse_number(key, value)?,
            "TaskManagedPolicies" => {
                config.task_definition.managed_policies = value
                    .split(',')
                    .map(str::trim)
                    .filter(|policy| !policy.is_empty())
                    .map(String::from)
                    .collect()
            }
            "TaskInlinePolicy" => {
                config.task_definition.iam_policy_template = Some(PathBuf::from(value))
            }
            "TaskDefinitionStackName" => config.task_definition.stack_name = Some(value.clone()),
            "BastionStackName" => config.bastion.stack_name = Some(value.clone()),
            "VpcId" => config.bastion.vpc_id = Some(value.clone()),
            _ => return Err(Error::UnknownOverride(key.clone())),
        }
    }

    return Ok(());
}

fn parse_number(key: &str, value: &str) -> Result<u32, Error> {
    return value.parse::<u32>().map_err(|_| Error::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    });
}

fn check_sizes(config: &Config) -> Result<(), Error> {
    let sizes = [
        ("bastion.task_definition_cpu", config.bastion.task_definition_cpu),
        (
            "task_definition.task_definition_cpu",
            config.task_definition.task_definition_cpu,
        ),
    ];
    for (key, cpu) in sizes {
        if !FARGATE_CPU_UNITS.contains(&cpu) {
            return Err(Error::ValidationError(format!(
                "{}: {} is not a valid Fargate CPU value",
                key, cpu
            )));
        }
    }

    return Ok(());
}
