//! Security classes derived from the network foundation

use crate::config::SecurityClass;
use crate::error::Result;
use crate::forge::{NetworkHandle, SecurityGroups};
use crate::rules::{Peer, PortSpec, Protocol, RuleDescriptor, RuleRegistry};
use crate::stack::{ResourceRef, Stack};
use serde_json::json;

fn declare_group(
    stack: &Stack,
    network: &NetworkHandle,
    logical_id: &str,
    description: &str,
) -> Result<ResourceRef> {
    stack.add_resource(
        logical_id,
        "AWS::EC2::SecurityGroup",
        json!({
            "GroupDescription": description,
            "VpcId": network.vpc.to_value(),
            "Tags": [{ "Key": "Name", "Value": format!("{}-{}", stack.name(), logical_id) }],
        }),
    )
}

/// Create the public, private and isolated security groups with their baseline rules.
///
/// Baseline: private accepts all traffic from public and from itself, isolated
/// accepts all traffic from private. Every group may send anywhere, over IPv6
/// too on dual stack networks. The returned `default` is the private group.
pub fn create_security_groups(
    stack: &Stack,
    rules: &RuleRegistry,
    network: &NetworkHandle,
) -> Result<SecurityGroups> {
    let public = declare_group(stack, network, "PublicSecurityGroup", "Allow HTTP and SSH access")?;
    let private = declare_group(
        stack,
        network,
        "PrivateSecurityGroup",
        "Allow access from public subnet",
    )?;
    let isolated = declare_group(
        stack,
        network,
        "IsolatedSecurityGroup",
        "Allow access from private subnet",
    )?;

    let writer = rules.writer(stack);
    writer.all_traffic_from_group(&private, &public, "Allow access from public subnet")?;
    writer.all_traffic_from_group(&private, &private, "Allow access within private subnet")?;
    writer.all_traffic_from_group(&isolated, &private, "Allow access from private subnet")?;

    for group in [&public, &private, &isolated] {
        writer.all_traffic_egress(group, "Allow all outbound traffic")?;
        if network.dual_stack {
            writer.apply(
                &RuleDescriptor::egress(
                    group,
                    Peer::Ipv6("::/0".into()),
                    Protocol::All,
                    PortSpec::All,
                )
                .with_description("Allow all outbound IPv6 traffic"),
            )?;
        }
    }

    tracing::info!("Security groups ready for network {}", network.id);
    let groups = SecurityGroups {
        default: private.clone(),
        public,
        private,
        isolated,
    };
    Ok(groups.with_default(SecurityClass::Private))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn network(dual_stack: bool) -> NetworkHandle {
        NetworkHandle {
            id: "main".into(),
            vpc: ResourceRef::created("Vpc"),
            cidr: "10.0.0.0/16".into(),
            existing: false,
            dual_stack,
            availability_zones: vec!["us-east-1a".into()],
            subnets: BTreeMap::new(),
        }
    }

    #[test]
    fn test_baseline_rules() {
        let stack = Stack::new("demo", "");
        let rules = RuleRegistry::new();
        let groups = create_security_groups(&stack, &rules, &network(false)).unwrap();

        assert_eq!(groups.default, groups.private);
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroup").len(), 3);
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroupIngress").len(), 3);
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroupEgress").len(), 3);

        let private_from_public = RuleDescriptor::ingress(
            &groups.private,
            Peer::Group(groups.public.clone()),
            Protocol::All,
            PortSpec::All,
        );
        assert!(rules.contains(&private_from_public));
    }

    #[test]
    fn test_dual_stack_adds_ipv6_egress() {
        let stack = Stack::new("demo", "");
        let rules = RuleRegistry::new();
        create_security_groups(&stack, &rules, &network(true)).unwrap();
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroupEgress").len(), 6);
        assert_eq!(rules.len(), 9);
    }
}
