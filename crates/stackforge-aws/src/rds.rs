//! Relational database forge
//!
//! Single instances for the classic engines, a cluster with a writer (and
//! optional readers) for Aurora. The master password comes from the
//! generated-secret cache, so instances sharing a parameter share a password.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stackforge_core::merge::{Merge, set_if_present};
use stackforge_core::stack::logical_id;
use stackforge_core::{
    BaseInstanceConfig, Forge, ForgeConfig, ForgeContext, ForgeError, InstanceConfig, PortSpec,
    Prerequisite, Properties, PropertySource, Protocol, ResourceRef, Result, merge_typed,
};

pub const DEFAULT_ENGINE: &str = "mysql";
pub const DEFAULT_INSTANCE_TYPE: &str = "db.t3.micro";
pub const DEFAULT_MYSQL_VERSION: &str = "8.4.6";
pub const DEFAULT_POSTGRES_VERSION: &str = "16.4";
pub const DEFAULT_MARIADB_VERSION: &str = "10.11.9";
pub const DEFAULT_AURORA_MYSQL_VERSION: &str = "8.0.mysql_aurora.3.10.0";
pub const DEFAULT_AURORA_POSTGRES_VERSION: &str = "17.5";
pub const PASSWORD_LENGTH: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RdsConfig {
    #[serde(flatten)]
    pub base: BaseInstanceConfig,

    /// `mysql`, `postgres`, `mariadb`, `aurora-mysql` or `aurora-postgresql`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// SSM parameter holding the master password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_parameter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_storage: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_encrypted: Option<bool>,

    #[serde(default, alias = "multiAZ", skip_serializing_if = "Option::is_none")]
    pub multi_az: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publicly_accessible: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_retention_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_protection: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Aurora reader instances besides the writer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_instances: Option<u32>,
}

impl Merge for RdsConfig {
    fn merge(&mut self, other: Self) {
        self.base.merge(other.base);
        set_if_present(&mut self.engine, other.engine);
        set_if_present(&mut self.engine_version, other.engine_version);
        set_if_present(&mut self.instance_type, other.instance_type);
        set_if_present(&mut self.database_name, other.database_name);
        set_if_present(&mut self.username, other.username);
        set_if_present(&mut self.password_parameter, other.password_parameter);
        set_if_present(&mut self.allocated_storage, other.allocated_storage);
        set_if_present(&mut self.storage_type, other.storage_type);
        set_if_present(&mut self.storage_encrypted, other.storage_encrypted);
        set_if_present(&mut self.multi_az, other.multi_az);
        set_if_present(&mut self.publicly_accessible, other.publicly_accessible);
        set_if_present(&mut self.backup_retention_days, other.backup_retention_days);
        set_if_present(&mut self.deletion_protection, other.deletion_protection);
        set_if_present(&mut self.port, other.port);
        set_if_present(&mut self.reader_instances, other.reader_instances);
    }
}

impl ForgeConfig for RdsConfig {
    const KIND: &'static str = "rds";

    fn base(&self) -> &BaseInstanceConfig {
        &self.base
    }

    fn prerequisites(&self) -> Vec<Prerequisite> {
        vec![Prerequisite::Secret {
            parameter: self.password_parameter(),
            length: PASSWORD_LENGTH,
        }]
    }
}

impl RdsConfig {
    pub fn engine(&self) -> &str {
        self.engine.as_deref().unwrap_or(DEFAULT_ENGINE)
    }

    pub fn is_aurora(&self) -> bool {
        self.engine().to_ascii_lowercase().starts_with("aurora")
    }

    pub fn engine_version(&self) -> &str {
        match self.engine_version.as_deref() {
            Some(version) if !version.is_empty() => version,
            _ => default_version(self.engine()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| default_port(self.engine()))
    }

    /// `postgres` for PostgreSQL engines, `admin` otherwise
    pub fn username(&self) -> &str {
        match self.username.as_deref() {
            Some(username) if !username.is_empty() => username,
            _ if self.engine().to_ascii_lowercase().contains("postgres") => "postgres",
            _ => "admin",
        }
    }

    pub fn password_parameter(&self) -> String {
        match self.password_parameter.as_deref() {
            Some(parameter) if !parameter.is_empty() => parameter.to_string(),
            _ => format!("/stackforge/rds/{}/password", self.base.id()),
        }
    }
}

pub fn default_version(engine: &str) -> &'static str {
    match engine.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => DEFAULT_POSTGRES_VERSION,
        "mariadb" => DEFAULT_MARIADB_VERSION,
        "aurora-mysql" => DEFAULT_AURORA_MYSQL_VERSION,
        "aurora-postgresql" => DEFAULT_AURORA_POSTGRES_VERSION,
        _ => DEFAULT_MYSQL_VERSION,
    }
}

pub fn default_port(engine: &str) -> u16 {
    match engine.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" | "aurora-postgresql" => 5432,
        "sqlserver" | "mssql" => 1433,
        "oracle" => 1521,
        _ => 3306,
    }
}

#[derive(Debug, Default)]
pub struct RdsForge {
    id: String,
    engine: String,
    port: u16,
    database_name: Option<String>,
    username: String,
    password_parameter: String,
    endpoint: Option<Value>,
    read_endpoint: Option<Value>,
    security_group: Option<ResourceRef>,
}

impl PropertySource for RdsForge {
    fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some(endpoint) = &self.endpoint {
            properties.insert("endpoint".into(), endpoint.clone());
        }
        if let Some(read_endpoint) = &self.read_endpoint {
            properties.insert("readEndpoint".into(), read_endpoint.clone());
        }
        properties.insert("port".into(), json!(self.port));
        properties.insert("engine".into(), Value::String(self.engine.clone()));
        if let Some(name) = &self.database_name {
            properties.insert("databaseName".into(), Value::String(name.clone()));
        }
        properties.insert("username".into(), Value::String(self.username.clone()));
        properties.insert(
            "passwordParameter".into(),
            Value::String(self.password_parameter.clone()),
        );
        properties
    }
}

impl Forge for RdsForge {
    fn merge_configs(
        &self,
        defaults: &dyn InstanceConfig,
        instance: &dyn InstanceConfig,
    ) -> Result<Box<dyn InstanceConfig>> {
        Ok(Box::new(merge_typed::<RdsConfig>(defaults, instance)?))
    }

    fn create(&mut self, ctx: &ForgeContext<'_>) -> Result<()> {
        let config = ctx.config::<RdsConfig>()?;
        self.id = config.base.id().to_string();
        self.engine = config.engine().to_string();
        self.port = config.port();
        self.database_name = config.database_name.clone().filter(|name| !name.is_empty());
        self.username = config.username().to_string();
        self.password_parameter = config.password_parameter();

        let secret = ctx.prerequisites.secret(&self.password_parameter)?;
        let group = ctx.require_security_groups()?.default.clone();
        let subnets: Vec<Value> = ctx
            .instance_subnets()?
            .iter()
            .map(ResourceRef::to_value)
            .collect();

        let prefix = logical_id(&["database", &self.id]);
        let subnet_group = ctx.stack.add_resource(
            format!("{}SubnetGroup", prefix),
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": format!("Subnets for {}", self.id),
                "SubnetIds": subnets,
            }),
        )?;

        let mut common = Map::new();
        common.insert("Engine".into(), Value::String(self.engine.clone()));
        common.insert("EngineVersion".into(), Value::String(config.engine_version().to_string()));
        common.insert("MasterUsername".into(), Value::String(self.username.clone()));
        common.insert("MasterUserPassword".into(), secret.resource.attr("Value"));
        common.insert("Port".into(), json!(self.port));
        common.insert("DBSubnetGroupName".into(), subnet_group.to_value());
        common.insert("VpcSecurityGroupIds".into(), json!([group.attr("GroupId")]));
        common.insert("StorageEncrypted".into(), json!(config.storage_encrypted.unwrap_or(true)));
        common.insert(
            "DeletionProtection".into(),
            json!(config.deletion_protection.unwrap_or(false)),
        );
        common.insert(
            "BackupRetentionPeriod".into(),
            json!(config.backup_retention_days.unwrap_or(7)),
        );
        if let Some(name) = &self.database_name {
            common.insert("DatabaseName".into(), Value::String(name.clone()));
        }

        let instance_type = config
            .instance_type
            .as_deref()
            .unwrap_or(DEFAULT_INSTANCE_TYPE);

        if config.is_aurora() {
            let cluster = ctx.stack.add_resource(
                format!("{}Cluster", prefix),
                "AWS::RDS::DBCluster",
                Value::Object(common),
            )?;
            let readers = config.reader_instances.unwrap_or(0);
            for i in 0..=readers {
                ctx.stack.add_resource(
                    format!("{}Instance{}", prefix, i + 1),
                    "AWS::RDS::DBInstance",
                    json!({
                        "DBClusterIdentifier": cluster.to_value(),
                        "DBInstanceClass": instance_type,
                        "Engine": self.engine,
                        "PubliclyAccessible": config.publicly_accessible.unwrap_or(false),
                    }),
                )?;
            }
            self.endpoint = Some(cluster.attr("Endpoint.Address"));
            self.read_endpoint = Some(cluster.attr("ReadEndpoint.Address"));
        } else {
            // Instances take the database name under a different key.
            if let Some(name) = common.remove("DatabaseName") {
                common.insert("DBName".into(), name);
            }
            common.insert("VPCSecurityGroups".into(), json!([group.attr("GroupId")]));
            common.remove("VpcSecurityGroupIds");
            common.insert("DBInstanceClass".into(), Value::String(instance_type.to_string()));
            common.insert(
                "AllocatedStorage".into(),
                Value::String(config.allocated_storage.unwrap_or(20).to_string()),
            );
            common.insert(
                "StorageType".into(),
                Value::String(config.storage_type.clone().unwrap_or_else(|| "gp3".into())),
            );
            common.insert("MultiAZ".into(), json!(config.multi_az.unwrap_or(false)));
            common.insert(
                "PubliclyAccessible".into(),
                json!(config.publicly_accessible.unwrap_or(false)),
            );
            let instance = ctx.stack.add_resource(
                format!("{}Instance", prefix),
                "AWS::RDS::DBInstance",
                Value::Object(common),
            )?;
            self.endpoint = Some(instance.attr("Endpoint.Address"));
        }

        tracing::info!(
            "Declared {} database {} on port {}",
            self.engine,
            self.id,
            self.port
        );
        self.security_group = Some(group);
        Ok(())
    }

    fn configure_rules(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let groups = ctx.require_security_groups()?;
        let target = self
            .security_group
            .as_ref()
            .ok_or_else(|| ForgeError::NotCreated(format!("rds {}", self.id)))?;
        let engine = self.engine.to_ascii_uppercase();

        let writer = ctx.rule_writer();
        writer.from_group(
            target,
            &groups.public,
            Protocol::Tcp,
            PortSpec::Single(self.port),
            &format!("Allow {} access from public subnet", engine),
        )?;
        writer.from_group(
            target,
            &groups.private,
            Protocol::Tcp,
            PortSpec::Single(self.port),
            &format!("Allow {} access from private subnet", engine),
        )?;
        Ok(())
    }

    fn create_outputs(&self, ctx: &ForgeContext<'_>) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| ForgeError::NotCreated(format!("rds {}", self.id)))?;
        ctx.stack.add_output(
            logical_id(&["rds-endpoint", &self.id]),
            endpoint,
            format!("{} endpoint", self.engine),
        );
        ctx.stack.add_output(
            logical_id(&["rds-password-parameter", &self.id]),
            Value::String(self.password_parameter.clone()),
            "SSM parameter holding the master password",
        );
        Ok(())
    }
}
