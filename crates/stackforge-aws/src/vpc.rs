//! Network foundation forge
//!
//! Declares a VPC with public, private and isolated subnets in each
//! availability zone, or imports an existing VPC by id.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stackforge_core::merge::{Merge, set_if_present};
use stackforge_core::{
    BaseInstanceConfig, Forge, ForgeConfig, ForgeContext, ForgeError, InstanceConfig,
    NetworkHandle, Properties, PropertySource, ResourceRef, Result, Stack, SubnetClass,
    merge_typed,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const DEFAULT_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_AZ_COUNT: u32 = 2;
const MAX_AZ_COUNT: u32 = 6;

/// Extra prefix bits carved out of the VPC block for each subnet
const SUBNET_BITS: u8 = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    #[serde(flatten)]
    pub base: BaseInstanceConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,

    /// Import this VPC instead of declaring one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    #[serde(
        default,
        alias = "natGatewayPerAZ",
        skip_serializing_if = "Option::is_none"
    )]
    pub nat_gateway_per_az: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub az_count: Option<u32>,
}

impl Merge for VpcConfig {
    fn merge(&mut self, other: Self) {
        self.base.merge(other.base);
        set_if_present(&mut self.cidr_block, other.cidr_block);
        set_if_present(&mut self.vpc_id, other.vpc_id);
        set_if_present(&mut self.nat_gateway_per_az, other.nat_gateway_per_az);
        set_if_present(&mut self.az_count, other.az_count);
    }
}

impl ForgeConfig for VpcConfig {
    const KIND: &'static str = "vpc";

    fn base(&self) -> &BaseInstanceConfig {
        &self.base
    }
}

#[derive(Debug, Default)]
pub struct VpcForge {
    network: Option<NetworkHandle>,
}

impl PropertySource for VpcForge {
    fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(network) = &self.network {
            properties.insert("vpcId".into(), network.vpc.to_value());
            properties.insert("cidrBlock".into(), Value::String(network.cidr.clone()));
            properties.insert("isExisting".into(), Value::Bool(network.existing));
        }
        properties
    }
}

impl Forge for VpcForge {
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>> {
        let mut merged = merge_typed::<VpcConfig>(defaults, instance)?;
        merged.cidr_block.get_or_insert_with(|| DEFAULT_CIDR.to_string());
        merged.az_count.get_or_insert(DEFAULT_AZ_COUNT);
        Ok(Box::new(merged))
    }

    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<VpcConfig>()?;
        let cidr = config.cidr_block.as_deref().unwrap_or(DEFAULT_CIDR);
        let id = config.base.id.clone().unwrap_or_else(|| "default".to_string());

        if let Some(vpc_id) = &config.vpc_id {
            tracing::info!("Importing existing VPC {}", vpc_id);
            self.network = Some(NetworkHandle {
                id,
                vpc: ResourceRef::imported(vpc_id.clone()),
                cidr: cidr.to_string(),
                existing: true,
                dual_stack: ctx.dual_stack(),
                availability_zones: Vec::new(),
                subnets: BTreeMap::new(),
            });
            return Ok(());
        }

        let az_count = config.az_count.unwrap_or(DEFAULT_AZ_COUNT).clamp(1, MAX_AZ_COUNT);
        let zones = availability_zones(&ctx.settings.region, az_count);
        let nat_per_az = config.nat_gateway_per_az.unwrap_or(false);

        let network = declare_network(ctx.stack, &id, cidr, &zones, nat_per_az, ctx.dual_stack())?;
        tracing::info!(
            "Declared VPC {} ({}) across {} availability zones",
            id,
            cidr,
            zones.len()
        );
        self.network = Some(network);
        Ok(())
    }

    fn create_outputs(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let network = self
            .network
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(VpcConfig::KIND.to_string()))?;

        ctx.stack
            .add_output("VpcId", network.vpc.to_value(), "VPC id");
        for class in SubnetClass::ALL {
            let subnets = network.subnets(class);
            if subnets.is_empty() {
                continue;
            }
            let refs: Vec<Value> = subnets.iter().map(ResourceRef::to_value).collect();
            ctx.stack.add_output(
                format!("{}Subnets", class_name(class)),
                json!({ "Fn::Join": [",", refs] }),
                format!("{} subnet ids", class_name(class)),
            );
        }
        Ok(())
    }

    fn network(&self) -> Option<NetworkHandle> {
        self.network.clone()
    }
}

fn class_name(class: SubnetClass) -> &'static str {
    match class {
        SubnetClass::Public => "Public",
        SubnetClass::Private => "Private",
        SubnetClass::Isolated => "Isolated",
    }
}

/// Zone names `<region>a`, `<region>b`, ...
pub fn availability_zones(region: &str, count: u32) -> Vec<String> {
    (b'a'..=b'z')
        .take(count as usize)
        .map(|suffix| format!("{}{}", region, suffix as char))
        .collect()
}

/// The `index`-th block with `extra_bits` more prefix bits inside `cidr`
pub fn subnet_cidr(cidr: &str, extra_bits: u8, index: u32) -> Result<String> {
    let invalid = || ForgeError::invalid_config(VpcConfig::KIND, format!("invalid CIDR block '{}'", cidr));

    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    let subnet_prefix = prefix.saturating_add(u32::from(extra_bits));
    if subnet_prefix > 28 || u64::from(index) >= 1u64 << extra_bits {
        return Err(invalid());
    }

    let size = 1u32 << (32 - subnet_prefix);
    let base = u32::from(address) & u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    let start = Ipv4Addr::from(base + index * size);
    Ok(format!("{}/{}", start, subnet_prefix))
}

fn declare_network(
    stack: &Stack,
    id: &str,
    cidr: &str,
    zones: &[String],
    nat_per_az: bool,
    dual_stack: bool,
) -> Result<NetworkHandle> {
    let name = |suffix: &str| json!([{ "Key": "Name", "Value": format!("{}-{}", stack.name(), suffix) }]);

    let vpc = stack.add_resource(
        "Vpc",
        "AWS::EC2::VPC",
        json!({
            "CidrBlock": cidr,
            "EnableDnsHostnames": true,
            "EnableDnsSupport": true,
            "Tags": name(id),
        }),
    )?;
    if dual_stack {
        stack.add_resource(
            "VpcIpv6CidrBlock",
            "AWS::EC2::VPCCidrBlock",
            json!({ "VpcId": vpc.to_value(), "AmazonProvidedIpv6CidrBlock": true }),
        )?;
    }

    let igw = stack.add_resource(
        "InternetGateway",
        "AWS::EC2::InternetGateway",
        json!({ "Tags": name("igw") }),
    )?;
    stack.add_resource(
        "VpcGatewayAttachment",
        "AWS::EC2::VPCGatewayAttachment",
        json!({ "VpcId": vpc.to_value(), "InternetGatewayId": igw.to_value() }),
    )?;

    let mut subnets: BTreeMap<SubnetClass, Vec<ResourceRef>> = BTreeMap::new();
    let zone_count = zones.len() as u32;
    for (class_index, class) in SubnetClass::ALL.into_iter().enumerate() {
        for (zone_index, zone) in zones.iter().enumerate() {
            let index = class_index as u32 * zone_count + zone_index as u32;
            let logical_id = format!("{}Subnet{}", class_name(class), zone_index + 1);
            let subnet = stack.add_resource(
                logical_id.as_str(),
                "AWS::EC2::Subnet",
                json!({
                    "VpcId": vpc.to_value(),
                    "AvailabilityZone": zone,
                    "CidrBlock": subnet_cidr(cidr, SUBNET_BITS, index)?,
                    "MapPublicIpOnLaunch": class == SubnetClass::Public,
                    "Tags": name(&format!("{}-{}", class, zone)),
                }),
            )?;
            subnets.entry(class).or_default().push(subnet);
        }
    }

    // Public: one route table with a default route to the internet gateway.
    let public_table = stack.add_resource(
        "PublicRouteTable",
        "AWS::EC2::RouteTable",
        json!({ "VpcId": vpc.to_value() }),
    )?;
    stack.add_resource(
        "PublicDefaultRoute",
        "AWS::EC2::Route",
        json!({
            "RouteTableId": public_table.to_value(),
            "DestinationCidrBlock": "0.0.0.0/0",
            "GatewayId": igw.to_value(),
        }),
    )?;
    associate(stack, &public_table, subnets_of(&subnets, SubnetClass::Public), "Public")?;

    // Private: egress through NAT, either one per zone or a single shared one.
    let public_subnets = subnets_of(&subnets, SubnetClass::Public).to_vec();
    let nat_count = if nat_per_az { public_subnets.len() } else { 1 };
    let mut nat_gateways = Vec::new();
    for (i, subnet) in public_subnets.iter().take(nat_count).enumerate() {
        let eip = stack.add_resource(
            format!("NatEip{}", i + 1),
            "AWS::EC2::EIP",
            json!({ "Domain": "vpc" }),
        )?;
        nat_gateways.push(stack.add_resource(
            format!("NatGateway{}", i + 1),
            "AWS::EC2::NatGateway",
            json!({ "AllocationId": eip.attr("AllocationId"), "SubnetId": subnet.to_value() }),
        )?);
    }

    let private_subnets = subnets_of(&subnets, SubnetClass::Private).to_vec();
    for (i, subnet) in private_subnets.iter().enumerate() {
        let table = stack.add_resource(
            format!("PrivateRouteTable{}", i + 1),
            "AWS::EC2::RouteTable",
            json!({ "VpcId": vpc.to_value() }),
        )?;
        if let Some(nat) = nat_gateways.get(i).or_else(|| nat_gateways.first()) {
            stack.add_resource(
                format!("PrivateDefaultRoute{}", i + 1),
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": table.to_value(),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "NatGatewayId": nat.to_value(),
                }),
            )?;
        }
        associate(
            stack,
            &table,
            std::slice::from_ref(subnet),
            &format!("Private{}", i + 1),
        )?;
    }

    // Isolated: no default route.
    let isolated_table = stack.add_resource(
        "IsolatedRouteTable",
        "AWS::EC2::RouteTable",
        json!({ "VpcId": vpc.to_value() }),
    )?;
    associate(
        stack,
        &isolated_table,
        subnets_of(&subnets, SubnetClass::Isolated),
        "Isolated",
    )?;

    Ok(NetworkHandle {
        id: id.to_string(),
        vpc,
        cidr: cidr.to_string(),
        existing: false,
        dual_stack,
        availability_zones: zones.to_vec(),
        subnets,
    })
}

fn subnets_of(
    subnets: &BTreeMap<SubnetClass, Vec<ResourceRef>>,
    class: SubnetClass,
) -> &[ResourceRef] {
    subnets.get(&class).map(Vec::as_slice).unwrap_or_default()
}

fn associate(stack: &Stack, table: &ResourceRef, subnets: &[ResourceRef], prefix: &str) -> Result<()> {
    for (i, subnet) in subnets.iter().enumerate() {
        stack.add_resource(
            format!("{}RouteTableAssociation{}", prefix, i + 1),
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({ "RouteTableId": table.to_value(), "SubnetId": subnet.to_value() }),
        )?;
    }
    Ok(())
}
