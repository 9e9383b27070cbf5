use crate::context::{DeploymentContext, Network, Subnet};
use crate::error::{Error, ProviderContext, Result};
use crate::provider::{CloudProvider, Handle};
use crate::resources::{Peer, SecurityGroupRule, SecurityGroupSpec};

pub const SSH_PORT: u16 = 22;
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupOptions {
    pub description: String,
    pub allow_http_egress: bool,
}

impl Default for SecurityGroupOptions {
    fn default() -> Self {
        return Self {
            description: String::from("Runner fleet security group"),
            allow_http_egress: false,
        };
    }
}

/// Resolves an existing network by its identifier.
pub fn lookup(provider: &mut dyn CloudProvider, vpc_id: &str) -> Result<Network> {
    let network = provider
        .lookup_network(vpc_id)
        .context(format!("looking up network {}", vpc_id))?;
    tracing::info!(
        vpc_id,
        subnets = network.subnets.len(),
        "resolved network"
    );
    return Ok(network);
}

/// Group with outbound traffic disabled except for the explicit allow-list:
/// SSH between members of the group, HTTPS out, and optionally HTTP out.
pub fn restrictive_group(network: &Network, options: &SecurityGroupOptions) -> SecurityGroupSpec {
    let ingress = vec![SecurityGroupRule::tcp(
        Peer::SelfGroup,
        SSH_PORT,
        "SSH from runner manager to job tasks",
    )];

    let mut egress = vec![
        SecurityGroupRule::tcp(Peer::SelfGroup, SSH_PORT, "SSH to job tasks"),
        SecurityGroupRule::tcp(Peer::any_ipv4(), HTTPS_PORT, "HTTPS out"),
    ];
    if options.allow_http_egress {
        egress.push(SecurityGroupRule::tcp(Peer::any_ipv4(), HTTP_PORT, "HTTP out"));
    }

    return SecurityGroupSpec {
        group_description: options.description.clone(),
        vpc_id: network.vpc_id.clone(),
        allow_all_outbound: false,
        ingress,
        egress,
    };
}

pub fn security_group(
    provider: &mut dyn CloudProvider,
    id: &str,
    network: &Network,
    options: &SecurityGroupOptions,
) -> Result<Handle> {
    let spec = restrictive_group(network, options);
    return provider
        .declare_security_group(id, &spec)
        .context(format!("declaring security group {}", id));
}

/// First private subnet of each zone suffix (`a`, `b`, ...), in order.
pub fn zone_subnets<'a>(
    ctx: &DeploymentContext,
    network: &'a Network,
    zones: &[String],
) -> Result<Vec<(String, &'a Subnet)>> {
    let mut selected = vec![];
    for zone in zones {
        let availability_zone = ctx.zone(zone);
        match network.private_subnets(&availability_zone).first() {
            Some(subnet) => selected.push((zone.clone(), *subnet)),
            None => {
                return Err(Error::ResourceNotFound(format!(
                    "private subnet in {} of {}",
                    availability_zone, network.vpc_id
                )))
            }
        }
    }
    return Ok(selected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NetworkCatalog, SubnetKind};
    use crate::provider::RecordingProvider;
    use crate::resources::Protocol;

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("123456789012", "eu-west-1").unwrap()
    }

    fn network() -> Network {
        let subnet = |id: &str, zone: &str, kind: SubnetKind| Subnet {
            subnet_id: id.to_string(),
            availability_zone: zone.to_string(),
            kind,
        };
        Network {
            vpc_id: String::from("vpc-1"),
            cidr: Some(String::from("10.0.0.0/16")),
            subnets: vec![
                subnet("subnet-pub-a", "eu-west-1a", SubnetKind::Public),
                subnet("subnet-a", "eu-west-1a", SubnetKind::Private),
                subnet("subnet-b", "eu-west-1b", SubnetKind::Private),
            ],
        }
    }

    #[test]
    fn default_group_only_allows_listed_egress() {
        let spec = restrictive_group(&network(), &SecurityGroupOptions::default());

        assert!(!spec.allow_all_outbound);
        assert_eq!(spec.egress.len(), 2);
        for rule in &spec.egress {
            assert_eq!(rule.protocol, Protocol::Tcp);
            assert_eq!(rule.port_count(), 1);
            if rule.peer.is_unrestricted() {
                assert_eq!(rule.from_port, HTTPS_PORT);
            } else {
                assert_eq!(rule.peer, Peer::SelfGroup);
                assert_eq!(rule.from_port, SSH_PORT);
            }
        }
        assert_eq!(spec.ingress.len(), 1);
        assert_eq!(spec.ingress[0].peer, Peer::SelfGroup);
    }

    #[test]
    fn http_egress_is_opt_in() {
        let options = SecurityGroupOptions {
            allow_http_egress: true,
            ..SecurityGroupOptions::default()
        };
        let spec = restrictive_group(&network(), &options);
        let ports: Vec<u16> = spec.egress.iter().map(|rule| rule.from_port).collect();
        assert_eq!(ports, vec![SSH_PORT, HTTPS_PORT, HTTP_PORT]);
    }

    #[test]
    fn unknown_network_is_not_found() {
        let mut provider = RecordingProvider::new("Test", &ctx(), NetworkCatalog::default());
        match lookup(&mut provider, "vpc-missing").err().unwrap() {
            Error::ResourceNotFound(message) => assert!(message.contains("vpc-missing")),
            other => panic!("Expected `ResourceNotFound` error, got {:?}", other),
        }
    }

    #[test]
    fn declares_group_in_network() {
        let catalog = NetworkCatalog::default().with_network(network());
        let mut provider = RecordingProvider::new("Test", &ctx(), catalog);
        let network = lookup(&mut provider, "vpc-1").unwrap();

        let handle = security_group(
            &mut provider,
            "BastionSecurityGroup",
            &network,
            &SecurityGroupOptions::default(),
        )
        .unwrap();
        assert_eq!(handle, Handle::reference("BastionSecurityGroup"));
        let properties = provider.graph().properties("BastionSecurityGroup").unwrap();
        assert_eq!(properties["VpcId"], "vpc-1");
        assert_eq!(properties["AllowAllOutbound"], false);
    }

    #[test]
    fn selects_private_subnet_per_zone() {
        let network = network();
        let zones = vec![String::from("a"), String::from("b")];
        let selected = zone_subnets(&ctx(), &network, &zones).unwrap();
        let ids: Vec<&str> = selected
            .iter()
            .map(|(_, subnet)| subnet.subnet_id.as_str())
            .collect();
        assert_eq!(ids, vec!["subnet-a", "subnet-b"]);

        let missing = zone_subnets(&ctx(), &network, &[String::from("c")]);
        match missing.err().unwrap() {
            Error::ResourceNotFound(_) => {}
            other => panic!("Expected `ResourceNotFound` error, got {:?}", other),
        }
    }
}
