//! Network access rules and their deduplication registry
//!
//! Every rule is reduced to a canonical signature. The registry records the
//! signatures it has applied, so a rule regenerated by a later configuration
//! pass never reaches the stack twice.

use crate::error::Result;
use crate::stack::ResourceRef;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// The other end of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Group(ResourceRef),
    Ipv4(String),
    Ipv6(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    /// Wire value used by the EC2 API
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "-1",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" => Some(Protocol::Icmp),
            "all" | "-1" => Some(Protocol::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    All,
    Single(u16),
    Range(u16, u16),
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSpec::All => f.write_str("all"),
            PortSpec::Single(port) => write!(f, "{}", port),
            PortSpec::Range(from, to) => write!(f, "{}-{}", from, to),
        }
    }
}

/// Discriminator for rules that would otherwise look alike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuleVariant {
    #[default]
    Standard,
    SelfEgress,
}

impl RuleVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleVariant::Standard => "standard",
            RuleVariant::SelfEgress => "self-egress",
        }
    }
}

/// A single network access rule on a security group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescriptor {
    pub direction: Direction,
    pub target: ResourceRef,
    pub peer: Peer,
    pub protocol: Protocol,
    pub ports: PortSpec,
    pub variant: RuleVariant,

    /// Human readable; never part of the signature
    pub description: Option<String>,
}

impl RuleDescriptor {
    pub fn ingress(target: &ResourceRef, peer: Peer, protocol: Protocol, ports: PortSpec) -> Self {
        Self {
            direction: Direction::Ingress,
            target: target.clone(),
            peer,
            protocol,
            ports,
            variant: RuleVariant::Standard,
            description: None,
        }
    }

    pub fn egress(target: &ResourceRef, peer: Peer, protocol: Protocol, ports: PortSpec) -> Self {
        Self {
            direction: Direction::Egress,
            ..Self::ingress(target, peer, protocol, ports)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_variant(mut self, variant: RuleVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Ports as they take effect: all protocols open all ports, a one-port
    /// range is a single port and reversed bounds are swapped.
    pub fn normalized_ports(&self) -> PortSpec {
        if self.protocol == Protocol::All {
            return PortSpec::All;
        }
        match self.ports {
            PortSpec::Range(from, to) if from == to => PortSpec::Single(from),
            PortSpec::Range(from, to) if from > to => PortSpec::Range(to, from),
            other => other,
        }
    }

    /// Canonical signature used for deduplication.
    ///
    /// Free-text components are escaped so that distinct rules never share a
    /// signature.
    pub fn signature(&self) -> String {
        let target = match &self.target {
            ResourceRef::Created { logical_id } => format!("c:{}", escape(logical_id)),
            ResourceRef::Imported { physical_id } => format!("i:{}", escape(physical_id)),
        };
        let peer = match &self.peer {
            Peer::Group(ResourceRef::Created { logical_id }) => {
                format!("sg:c:{}", escape(logical_id))
            }
            Peer::Group(ResourceRef::Imported { physical_id }) => {
                format!("sg:i:{}", escape(physical_id))
            }
            Peer::Ipv4(cidr) => format!("v4:{}", escape(cidr.trim())),
            Peer::Ipv6(cidr) => format!("v6:{}", escape(cidr.trim())),
        };
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.direction.as_str(),
            target,
            peer,
            self.protocol.as_str(),
            self.normalized_ports(),
            self.variant.as_str()
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

/// Receives the side effect of a newly applied rule
pub trait RuleSink: Send + Sync {
    fn apply_rule(&self, rule: &RuleDescriptor, signature: &str) -> Result<()>;
}

/// Signatures of every rule applied during a run
#[derive(Debug, Default)]
pub struct RuleRegistry {
    applied: Mutex<HashSet<String>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `rule` through `sink` unless an identical rule was applied before.
    ///
    /// Returns `true` when the side effect ran. The check, the side effect and
    /// the record happen under one lock; a failed side effect is not recorded.
    pub fn apply_safely(&self, rule: &RuleDescriptor, sink: &dyn RuleSink) -> Result<bool> {
        let signature = rule.signature();
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if applied.contains(&signature) {
            tracing::debug!("Skipped duplicate rule {}", signature);
            return Ok(false);
        }

        sink.apply_rule(rule, &signature)?;
        tracing::debug!("Applied rule {}", signature);
        applied.insert(signature);
        Ok(true)
    }

    pub fn contains(&self, rule: &RuleDescriptor) -> bool {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&rule.signature())
    }

    pub fn len(&self) -> usize {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every recorded signature
    pub fn reset(&self) {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Bind the registry to a sink for the convenience writers
    pub fn writer<'a>(&'a self, sink: &'a dyn RuleSink) -> RuleWriter<'a> {
        RuleWriter {
            registry: self,
            sink,
        }
    }
}

/// Shorthand rule constructors applied through a [`RuleRegistry`]
pub struct RuleWriter<'a> {
    registry: &'a RuleRegistry,
    sink: &'a dyn RuleSink,
}

impl RuleWriter<'_> {
    pub fn apply(&self, rule: &RuleDescriptor) -> Result<bool> {
        self.registry.apply_safely(rule, self.sink)
    }

    /// Allow `protocol`/`ports` into `target` from members of `source`
    pub fn from_group(
        &self,
        target: &ResourceRef,
        source: &ResourceRef,
        protocol: Protocol,
        ports: PortSpec,
        description: &str,
    ) -> Result<bool> {
        self.apply(
            &RuleDescriptor::ingress(target, Peer::Group(source.clone()), protocol, ports)
                .with_description(description),
        )
    }

    pub fn from_ipv4(
        &self,
        target: &ResourceRef,
        cidr: &str,
        protocol: Protocol,
        ports: PortSpec,
        description: &str,
    ) -> Result<bool> {
        self.apply(
            &RuleDescriptor::ingress(target, Peer::Ipv4(cidr.to_string()), protocol, ports)
                .with_description(description),
        )
    }

    pub fn from_ipv6(
        &self,
        target: &ResourceRef,
        cidr: &str,
        protocol: Protocol,
        ports: PortSpec,
        description: &str,
    ) -> Result<bool> {
        self.apply(
            &RuleDescriptor::ingress(target, Peer::Ipv6(cidr.to_string()), protocol, ports)
                .with_description(description),
        )
    }

    pub fn all_traffic_from_group(
        &self,
        target: &ResourceRef,
        source: &ResourceRef,
        description: &str,
    ) -> Result<bool> {
        self.from_group(target, source, Protocol::All, PortSpec::All, description)
    }

    /// Allow all outbound IPv4 traffic
    pub fn all_traffic_egress(&self, target: &ResourceRef, description: &str) -> Result<bool> {
        self.apply(
            &RuleDescriptor::egress(
                target,
                Peer::Ipv4("0.0.0.0/0".into()),
                Protocol::All,
                PortSpec::All,
            )
            .with_description(description),
        )
    }

    /// EFA needs all traffic within its own group in both directions.
    ///
    /// Returns how many of the two rules were newly applied.
    pub fn efa_self_rules(&self, target: &ResourceRef) -> Result<usize> {
        let ingress = RuleDescriptor::ingress(
            target,
            Peer::Group(target.clone()),
            Protocol::All,
            PortSpec::All,
        )
        .with_description("Allow all EFA traffic within the group");
        let egress = RuleDescriptor::egress(
            target,
            Peer::Group(target.clone()),
            Protocol::All,
            PortSpec::All,
        )
        .with_variant(RuleVariant::SelfEgress)
        .with_description("Allow all EFA traffic within the group");

        let mut applied = 0;
        for rule in [ingress, egress] {
            if self.apply(&rule)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply `allowedPorts` style rules; IPv6 rules only on dual stack networks.
    pub fn apply_port_rules(
        &self,
        target: &ResourceRef,
        allowed_ports: Option<&str>,
        allowed_ports_ipv6: Option<&str>,
        dual_stack: bool,
    ) -> Result<usize> {
        let mut applied = 0;
        for rule in parse_allowed_ports(allowed_ports.unwrap_or_default()) {
            let description = rule.description("");
            if self.from_ipv4(target, &rule.cidr, rule.protocol, rule.ports, &description)? {
                applied += 1;
            }
        }

        if dual_stack {
            for rule in parse_allowed_ports(allowed_ports_ipv6.unwrap_or_default()) {
                let description = rule.description(" IPv6");
                if self.from_ipv6(target, &rule.cidr, rule.protocol, rule.ports, &description)? {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }
}

/// One entry of an `allowedPorts` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    pub protocol: Protocol,
    pub ports: PortSpec,
    pub cidr: String,
}

impl PortRule {
    fn description(&self, suffix: &str) -> String {
        match self.ports {
            PortSpec::Range(from, to) => format!("Allow ports {}-{}{}", from, to, suffix),
            ports => format!("Allow port {}{}", ports, suffix),
        }
    }
}

/// Parse `"22@10.0.0.0/8;80,443@0.0.0.0/0;8000-8999/udp@10.69.0.0/16"`.
///
/// Groups are separated by `;`, ports and CIDR by `@`. Each port item is a
/// port or `from-to` range with an optional `/protocol` suffix (tcp when
/// omitted). Malformed items and port 0 are skipped.
pub fn parse_allowed_ports(spec: &str) -> Vec<PortRule> {
    let mut rules = Vec::new();
    for group in spec.split(';') {
        let Some((ports, cidr)) = group.split_once('@') else {
            continue;
        };
        let cidr = cidr.trim();
        if cidr.is_empty() || cidr.contains('@') {
            continue;
        }

        for item in ports.split(',') {
            let item = item.trim();
            let (range, protocol) = match item.split_once('/') {
                Some((range, protocol)) => match Protocol::parse(protocol) {
                    Some(protocol) => (range, protocol),
                    None => continue,
                },
                None => (item, Protocol::Tcp),
            };

            let ports = match range.split_once('-') {
                Some((from, to)) => match (parse_port(from), parse_port(to)) {
                    (Some(from), Some(to)) => PortSpec::Range(from, to),
                    _ => continue,
                },
                None => match parse_port(range) {
                    Some(port) => PortSpec::Single(port),
                    None => continue,
                },
            };

            rules.push(PortRule {
                protocol,
                ports,
                cidr: cidr.to_string(),
            });
        }
    }
    rules
}

fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|port| *port > 0)
}
