use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};

use crate::config;
use crate::template::PlaceholderMap;

/// Account and region every builder works against.
///
/// Resolved once at the edge of the program and passed explicitly, never read
/// from the environment by the builders themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub account: String,
    pub region: String,
}

impl DeploymentContext {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Result<Self, config::Error> {
        let account = account.into();
        let region = region.into();
        if account.trim().is_empty() {
            return Err(config::Error::MissingKey(String::from("account")));
        }
        if region.trim().is_empty() {
            return Err(config::Error::MissingKey(String::from("region")));
        }

        return Ok(Self { account, region });
    }

    /// `arn:aws:{service}:{region}:{account}:{resource}`
    pub fn arn(&self, service: &str, resource: &str) -> String {
        return format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account, resource
        );
    }

    /// Full availability-zone name for a zone suffix such as `a`.
    pub fn zone(&self, suffix: &str) -> String {
        return format!("{}{}", self.region, suffix);
    }

    pub fn placeholders(&self) -> PlaceholderMap {
        return PlaceholderMap::new()
            .with("__ACCOUNT_ID__", &self.account)
            .with("__REGION__", &self.region);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    #[default]
    Private,
    Public,
    /// No route out of the VPC. Never selected for runners, which need to
    /// reach the GitLab server.
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet_id: String,
    pub availability_zone: String,
    #[serde(default)]
    pub kind: SubnetKind,
}

/// Result of looking up an existing VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub vpc_id: String,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

impl Network {
    /// Private subnets in the given availability zone, in declaration order.
    pub fn private_subnets(&self, availability_zone: &str) -> Vec<&Subnet> {
        return self.subnets
            .iter()
            .filter(|subnet| subnet.kind == SubnetKind::Private)
            .filter(|subnet| subnet.availability_zone == availability_zone)
            .collect();
    }

    pub fn all_private_subnet_ids(&self) -> Vec<String> {
        return self.subnets
            .iter()
            .filter(|subnet| subnet.kind == SubnetKind::Private)
            .map(|subnet| subnet.subnet_id.clone())
            .collect();
    }
}

/// Cached results of network lookups, kept next to the configuration so that
/// assembly never has to reach the cloud API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCatalog {
    #[serde(default)]
    pub vpcs: Vec<Network>,
}

impl NetworkCatalog {
    pub fn with_network(mut self, network: Network) -> Self {
        self.vpcs.push(network);
        return self;
    }

    pub fn find(&self, vpc_id: &str) -> Option<&Network> {
        return self.vpcs.iter().find(|network| network.vpc_id == vpc_id);
    }
}

/// Reads the lookup cache. A missing file yields an empty catalog, so every
/// lookup will then fail with a not-found error naming the VPC.
pub fn load_catalog(path: &Path) -> Result<NetworkCatalog, config::Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => raw_contents,
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "network context file not found");
                return Ok(NetworkCatalog::default());
            }
            _ => return Err(config::Error::Unknown(error.to_string())),
        },
    };

    return match serde_yaml::from_str(&contents) {
        Ok(catalog) => Ok(catalog),
        Err(error) => Err(config::Error::ParsingError(error.to_string())),
    };
}
