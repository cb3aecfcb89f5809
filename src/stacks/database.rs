use serde_json::{json, Value};

use super::network::{allow_all_outbound, NetworkHandle};
use super::{Error, SecurityGroupRef, StackId};
use crate::template::{get_att, join, reference, Export, RemovalPolicy, Resource, Stack};

pub const POSTGRES_PORT: u16 = 5432;
pub const DATABASE_NAME: &str = "book_management";
pub const MASTER_USERNAME: &str = "postgres";
pub const ENGINE_VERSION: &str = "14";
pub const INSTANCE_CLASS: &str = "db.t3.micro";
pub const ALLOCATED_STORAGE_GIB: u32 = 20;
pub const MAX_ALLOCATED_STORAGE_GIB: u32 = 100;
pub const BACKUP_RETENTION_DAYS: u32 = 7;

/// Characters RDS does not accept in a master password.
const EXCLUDED_PASSWORD_CHARACTERS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

/// A secret stored in Secrets Manager, addressable field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub arn: Export,
}

impl SecretRef {
    /// `ValueFrom` for a single JSON field of the secret, as ECS expects it.
    pub fn field(&self, stack: &mut Stack, field: &str) -> Value {
        let arn = stack.import(&self.arn);
        return join("", vec![arn, json!(format!(":{}::", field))]);
    }
}

/// The security group fronting a resource plus the port it listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connections {
    pub security_group: SecurityGroupRef,
    pub default_port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    pub secret: SecretRef,
    pub connections: Connections,
}

impl DatabaseHandle {
    /// Lets traffic from `from` reach the database on `port`. The rule is declared in
    /// `scope`, the stack asking for access; the database stack itself is never touched.
    pub fn authorize_ingress(
        &self,
        scope: &mut Stack,
        from: &SecurityGroupRef,
        port: u16,
    ) -> Result<Value, Error> {
        let group_id = scope.import(&self.connections.security_group.group_id);
        let source_group_id = scope.import(&from.group_id);

        let rule = scope.add_resource(
            &format!("DatabaseIngressFrom{}", port),
            Resource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "GroupId": group_id,
                    "SourceSecurityGroupId": source_group_id,
                    "IpProtocol": "tcp",
                    "FromPort": port,
                    "ToPort": port,
                    "Description": format!("Allow access to the database on port {}", port),
                }),
            ),
        )?;

        return Ok(rule);
    }
}

pub fn build(id: StackId, network: &NetworkHandle) -> Result<(Stack, DatabaseHandle), Error> {
    let mut stack = Stack::new(id.name(), id.description());

    let vpc_id = stack.import(&network.vpc_id);
    let private_subnets: Vec<Value> = network
        .private_subnets
        .iter()
        .map(|subnet| stack.import(subnet))
        .collect();

    // No ingress here: access is granted through `DatabaseHandle::authorize_ingress`.
    stack.add_resource(
        "BookManagementDBSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": "Security group for BookManagementDB database",
                "VpcId": vpc_id,
                "SecurityGroupEgress": [allow_all_outbound()],
            }),
        ),
    )?;

    let subnet_group = stack.add_resource(
        "BookManagementDBSubnetGroup",
        Resource::new(
            "AWS::RDS::DBSubnetGroup",
            json!({
                "DBSubnetGroupDescription": "Subnet group for BookManagementDB database",
                "SubnetIds": private_subnets,
            }),
        ),
    )?;

    let secret = stack.add_resource(
        "BookManagementDBSecret",
        Resource::new(
            "AWS::SecretsManager::Secret",
            json!({
                "Description": "Generated credentials for the Book Management database",
                "GenerateSecretString": {
                    "SecretStringTemplate": json!({ "username": MASTER_USERNAME }).to_string(),
                    "GenerateStringKey": "password",
                    "PasswordLength": 30,
                    "ExcludeCharacters": EXCLUDED_PASSWORD_CHARACTERS,
                },
            }),
        )
        .with_removal_policy(RemovalPolicy::Delete),
    )?;

    let instance = stack.add_resource(
        "BookManagementDB",
        Resource::new(
            "AWS::RDS::DBInstance",
            json!({
                "Engine": "postgres",
                "EngineVersion": ENGINE_VERSION,
                "DBInstanceClass": INSTANCE_CLASS,
                "AllocatedStorage": ALLOCATED_STORAGE_GIB.to_string(),
                "MaxAllocatedStorage": MAX_ALLOCATED_STORAGE_GIB,
                "StorageType": "gp2",
                "DBName": DATABASE_NAME,
                "MasterUsername": resolve_secret_field(&secret, "username"),
                "MasterUserPassword": resolve_secret_field(&secret, "password"),
                "DBSubnetGroupName": subnet_group,
                "VPCSecurityGroups": [get_att("BookManagementDBSecurityGroup", "GroupId")],
                "PubliclyAccessible": false,
                "MultiAZ": false,
                "AllowMajorVersionUpgrade": false,
                "AutoMinorVersionUpgrade": true,
                "BackupRetentionPeriod": BACKUP_RETENTION_DAYS,
                "DeleteAutomatedBackups": true,
                "DeletionProtection": false,
                "CopyTagsToSnapshot": true,
            }),
        )
        .with_removal_policy(RemovalPolicy::Snapshot),
    )?;

    // Adds host, port, dbname and engine to the generated secret once the instance exists.
    let attachment = stack.add_resource(
        "BookManagementDBSecretAttachment",
        Resource::new(
            "AWS::SecretsManager::SecretTargetAttachment",
            json!({
                "SecretId": secret,
                "TargetId": instance,
                "TargetType": "AWS::RDS::DBInstance",
            }),
        ),
    )?;

    stack.add_output(
        "DatabaseEndpoint",
        get_att("BookManagementDB", "Endpoint.Address"),
        "Database endpoint",
    )?;
    stack.add_output(
        "DatabasePort",
        get_att("BookManagementDB", "Endpoint.Port"),
        "Database port",
    )?;
    stack.add_output("DatabaseName", reference("BookManagementDB"), "Database name")?;
    let secret_arn = stack.export(
        "DatabaseSecretArn",
        attachment,
        "Database credentials secret ARN",
    )?;
    let group_id = stack.export(
        "DatabaseSecurityGroupId",
        get_att("BookManagementDBSecurityGroup", "GroupId"),
        "Database security group ID",
    )?;

    let handle = DatabaseHandle {
        secret: SecretRef { arn: secret_arn },
        connections: Connections {
            security_group: SecurityGroupRef { group_id },
            default_port: POSTGRES_PORT,
        },
    };
    return Ok((stack, handle));
}

/// `{{resolve:secretsmanager:<arn>:SecretString:<field>::}}`
fn resolve_secret_field(secret: &Value, field: &str) -> Value {
    return join(
        "",
        vec![
            json!("{{resolve:secretsmanager:"),
            secret.clone(),
            json!(format!(":SecretString:{}::}}}}", field)),
        ],
    );
}
