use serde_json::{json, Value};

use super::database::DatabaseHandle;
use super::network::NetworkHandle;
use super::platform::{self, PlatformHandle, CONTAINER_PORT};
use super::{Error, StackId};
use crate::secrets::SecretMap;
use crate::template::{get_att, join, managed_policy_arn, reference, sub, Resource, Stack};

pub const CONTAINER_NAME: &str = "web";
pub const IMAGE_TAG: &str = "latest";
pub const DESIRED_COUNT: u32 = 1;
pub const HEALTH_CHECK_GRACE_PERIOD_SECONDS: u32 = 60;
pub const LOG_RETENTION_DAYS: u32 = 7;

/// Fargate task size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSize {
    pub cpu: u32,
    pub memory_mib: u32,
}

pub const TASK_SIZE: TaskSize = TaskSize {
    cpu: 256,
    memory_mib: 512,
};

/// Target tracking on average service CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoScaling {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_cpu_percent: u32,
    pub scale_in_cooldown_seconds: u32,
    pub scale_out_cooldown_seconds: u32,
}

pub const AUTO_SCALING: AutoScaling = AutoScaling {
    min_capacity: 1,
    max_capacity: 4,
    target_cpu_percent: 70,
    scale_in_cooldown_seconds: 60,
    scale_out_cooldown_seconds: 60,
};

/// Container variables sourced field by field from the database secret.
pub const DATABASE_SECRET_FIELDS: [(&str, &str); 5] = [
    ("DATABASE_HOST", "host"),
    ("DATABASE_PORT", "port"),
    ("DATABASE_USERNAME", "username"),
    ("DATABASE_PASSWORD", "password"),
    ("DATABASE_NAME", "dbname"),
];

/// Runs the API on the platform's cluster and registers it with the existing target group.
pub fn build(
    id: StackId,
    network: &NetworkHandle,
    database: &DatabaseHandle,
    platform: &PlatformHandle,
    secrets: &SecretMap,
) -> Result<Stack, Error> {
    let mut stack = Stack::new(id.name(), id.description());

    let secret_arn = stack.import(&database.secret.arn);
    let cluster = stack.import(&platform.cluster_name);
    let target_group = stack.import(&platform.target_group_arn);
    let service_group = stack.import(&network.service_security_group.group_id);
    let public_subnets: Vec<Value> = network
        .public_subnets
        .iter()
        .map(|subnet| stack.import(subnet))
        .collect();

    let log_group = stack.add_resource(
        "BookManagementLogGroup",
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "RetentionInDays": LOG_RETENTION_DAYS }),
        ),
    )?;

    stack.add_resource(
        "TaskExecutionRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": ecs_tasks_trust(),
                "ManagedPolicyArns": [
                    managed_policy_arn("service-role/AmazonECSTaskExecutionRolePolicy"),
                ],
                "Policies": [{
                    "PolicyName": "ReadDatabaseSecret",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
                            "Resource": secret_arn,
                        }],
                    },
                }],
            }),
        ),
    )?;

    stack.add_resource(
        "TaskRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({ "AssumeRolePolicyDocument": ecs_tasks_trust() }),
        ),
    )?;

    let container = container_definition(&mut stack, database, platform, secrets, &log_group);
    let task_definition = stack.add_resource(
        "BookManagementTaskDefinition",
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": "BookManagementApi",
                "Cpu": TASK_SIZE.cpu.to_string(),
                "Memory": TASK_SIZE.memory_mib.to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "ExecutionRoleArn": get_att("TaskExecutionRole", "Arn"),
                "TaskRoleArn": get_att("TaskRole", "Arn"),
                "ContainerDefinitions": [container],
            }),
        ),
    )?;

    stack.add_resource(
        "BookManagementService",
        Resource::new(
            "AWS::ECS::Service",
            json!({
                "Cluster": cluster,
                "LaunchType": "FARGATE",
                "DesiredCount": DESIRED_COUNT,
                "TaskDefinition": task_definition,
                "HealthCheckGracePeriodSeconds": HEALTH_CHECK_GRACE_PERIOD_SECONDS,
                "DeploymentConfiguration": {
                    "MaximumPercent": 200,
                    "MinimumHealthyPercent": 50,
                },
                "NetworkConfiguration": {
                    "AwsvpcConfiguration": {
                        "AssignPublicIp": "ENABLED",
                        "SecurityGroups": [service_group],
                        "Subnets": public_subnets,
                    },
                },
                "LoadBalancers": [{
                    "ContainerName": CONTAINER_NAME,
                    "ContainerPort": CONTAINER_PORT,
                    "TargetGroupArn": target_group,
                }],
            }),
        ),
    )?;

    add_auto_scaling(&mut stack, &cluster)?;

    database.authorize_ingress(
        &mut stack,
        &network.service_security_group,
        database.connections.default_port,
    )?;

    let load_balancer_dns = stack.import(&platform.load_balancer_dns);
    stack.add_output(
        "ServiceURL",
        join("", vec![json!("https://"), load_balancer_dns]),
        "Service URL",
    )?;

    return Ok(stack);
}

fn container_definition(
    stack: &mut Stack,
    database: &DatabaseHandle,
    platform: &PlatformHandle,
    secrets: &SecretMap,
    log_group: &Value,
) -> Value {
    let mut environment = vec![json!({ "Name": "NODE_ENV", "Value": "production" })];
    for (name, value) in secrets.iter() {
        environment.push(json!({ "Name": name, "Value": value }));
    }

    let database_secrets: Vec<Value> = DATABASE_SECRET_FIELDS
        .iter()
        .map(|(name, field)| {
            json!({ "Name": name, "ValueFrom": database.secret.field(stack, field) })
        })
        .collect();

    return json!({
        "Name": CONTAINER_NAME,
        "Image": platform::image(stack, platform, IMAGE_TAG),
        "Essential": true,
        "PortMappings": [{ "ContainerPort": CONTAINER_PORT, "Protocol": "tcp" }],
        "Environment": environment,
        "Secrets": database_secrets,
        "LogConfiguration": {
            "LogDriver": "awslogs",
            "Options": {
                "awslogs-group": log_group,
                "awslogs-stream-prefix": "BookManagementService",
                "awslogs-region": reference("AWS::Region"),
            },
        },
    });
}

fn add_auto_scaling(stack: &mut Stack, cluster: &Value) -> Result<(), Error> {
    stack.add_resource(
        "BookManagementServiceScalableTarget",
        Resource::new(
            "AWS::ApplicationAutoScaling::ScalableTarget",
            json!({
                "MinCapacity": AUTO_SCALING.min_capacity,
                "MaxCapacity": AUTO_SCALING.max_capacity,
                "ResourceId": join("/", vec![
                    json!("service"),
                    cluster.clone(),
                    get_att("BookManagementService", "Name"),
                ]),
                "ScalableDimension": "ecs:service:DesiredCount",
                "ServiceNamespace": "ecs",
                "RoleARN": sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:role/aws-service-role/ecs.application-autoscaling.amazonaws.com/AWSServiceRoleForApplicationAutoScaling_ECSService"),
            }),
        ),
    )?;

    stack.add_resource(
        "BookManagementServiceCpuScaling",
        Resource::new(
            "AWS::ApplicationAutoScaling::ScalingPolicy",
            json!({
                "PolicyName": "CpuScaling",
                "PolicyType": "TargetTrackingScaling",
                "ScalingTargetId": reference("BookManagementServiceScalableTarget"),
                "TargetTrackingScalingPolicyConfiguration": {
                    "PredefinedMetricSpecification": {
                        "PredefinedMetricType": "ECSServiceAverageCPUUtilization",
                    },
                    "TargetValue": AUTO_SCALING.target_cpu_percent,
                    "ScaleInCooldown": AUTO_SCALING.scale_in_cooldown_seconds,
                    "ScaleOutCooldown": AUTO_SCALING.scale_out_cooldown_seconds,
                },
            }),
        ),
    )?;

    return Ok(());
}

fn ecs_tasks_trust() -> Value {
    return json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    });
}
