use serde_json::{json, Value};

use super::network::{NetworkHandle, HTTPS_PORT, HTTP_PORT};
use super::{Error, StackId};
use crate::template::{get_att, join, Export, RemovalPolicy, Resource, Stack};

pub const CONTAINER_PORT: u16 = 3000;
pub const REPOSITORY_NAME: &str = "book-management-api";

/// How the load balancer decides whether a task may receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: &'static str,
    pub healthy_http_codes: &'static str,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub timeout_seconds: u32,
    pub interval_seconds: u32,
}

pub const HEALTH_CHECK: HealthCheck = HealthCheck {
    path: "/health",
    healthy_http_codes: "200",
    healthy_threshold: 2,
    unhealthy_threshold: 2,
    timeout_seconds: 5,
    interval_seconds: 30,
};

impl HealthCheck {
    /// The target group properties describing this check.
    pub fn target_group_properties(&self) -> Value {
        return json!({
            "HealthCheckEnabled": true,
            "HealthCheckPath": self.path,
            "HealthCheckProtocol": "HTTP",
            "Matcher": { "HttpCode": self.healthy_http_codes },
            "HealthyThresholdCount": self.healthy_threshold,
            "UnhealthyThresholdCount": self.unhealthy_threshold,
            "HealthCheckTimeoutSeconds": self.timeout_seconds,
            "HealthCheckIntervalSeconds": self.interval_seconds,
        });
    }
}

#[derive(Debug, Clone)]
pub struct PlatformHandle {
    pub cluster_name: Export,
    pub cluster_arn: Export,
    pub repository_uri: Export,
    pub repository_arn: Export,
    pub load_balancer_dns: Export,
    pub https_listener_arn: Export,
    pub target_group_arn: Export,
}

pub fn build(
    id: StackId,
    network: &NetworkHandle,
    certificate_arn: &str,
) -> Result<(Stack, PlatformHandle), Error> {
    let mut stack = Stack::new(id.name(), id.description());

    let vpc_id = stack.import(&network.vpc_id);
    let public_subnets: Vec<Value> = network
        .public_subnets
        .iter()
        .map(|subnet| stack.import(subnet))
        .collect();
    let edge_group = stack.import(&network.edge_security_group.group_id);

    let cluster = stack.add_resource(
        "BookManagementCluster",
        Resource::new(
            "AWS::ECS::Cluster",
            json!({
                "ClusterSettings": [{ "Name": "containerInsights", "Value": "enabled" }],
            }),
        ),
    )?;

    stack.add_resource(
        "BookManagementRepository",
        Resource::new(
            "AWS::ECR::Repository",
            json!({
                "RepositoryName": REPOSITORY_NAME,
                "ImageScanningConfiguration": { "ScanOnPush": true },
            }),
        )
        .with_removal_policy(RemovalPolicy::Delete),
    )?;

    let load_balancer = stack.add_resource(
        "ALB",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "Type": "application",
                "Scheme": "internet-facing",
                "Subnets": public_subnets,
                "SecurityGroups": [edge_group],
                "LoadBalancerAttributes": [
                    { "Key": "deletion_protection.enabled", "Value": "false" },
                ],
            }),
        ),
    )?;

    let mut target_group_properties = json!({
        "Port": CONTAINER_PORT,
        "Protocol": "HTTP",
        "TargetType": "ip",
        "VpcId": vpc_id,
    });
    merge(&mut target_group_properties, HEALTH_CHECK.target_group_properties());
    let target_group = stack.add_resource(
        "BookManagementTargetGroup",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            target_group_properties,
        ),
    )?;

    let https_listener = stack.add_resource(
        "ALBHttpsListener",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": load_balancer,
                "Port": HTTPS_PORT,
                "Protocol": "HTTPS",
                "Certificates": [{ "CertificateArn": certificate_arn }],
                "DefaultActions": [{ "Type": "forward", "TargetGroupArn": target_group }],
            }),
        ),
    )?;

    stack.add_resource(
        "ALBHttpRedirectListener",
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "LoadBalancerArn": load_balancer,
                "Port": HTTP_PORT,
                "Protocol": "HTTP",
                "DefaultActions": [{
                    "Type": "redirect",
                    "RedirectConfig": {
                        "Protocol": "HTTPS",
                        "Port": HTTPS_PORT.to_string(),
                        "StatusCode": "HTTP_301",
                    },
                }],
            }),
        ),
    )?;

    let repository_uri = get_att("BookManagementRepository", "RepositoryUri");
    stack.add_output("LoadBalancerDNS", get_att("ALB", "DNSName"), "Load Balancer DNS")?;
    stack.add_output("ECRRepositoryURI", repository_uri.clone(), "ECR Repository URI")?;

    let handle = PlatformHandle {
        cluster_name: stack.export("ClusterName", cluster, "ECS cluster name")?,
        cluster_arn: stack.export(
            "ClusterArn",
            get_att("BookManagementCluster", "Arn"),
            "ECS cluster ARN",
        )?,
        repository_uri: stack.export("RepositoryUri", repository_uri, "ECR repository URI")?,
        repository_arn: stack.export(
            "RepositoryArn",
            get_att("BookManagementRepository", "Arn"),
            "ECR repository ARN",
        )?,
        load_balancer_dns: stack.export(
            "LoadBalancerDnsName",
            get_att("ALB", "DNSName"),
            "Load balancer DNS name",
        )?,
        https_listener_arn: stack.export(
            "HttpsListenerArn",
            https_listener,
            "HTTPS listener ARN",
        )?,
        target_group_arn: stack.export("TargetGroupArn", target_group, "Target group ARN")?,
    };
    return Ok((stack, handle));
}

/// `<repository uri>:<tag>`
pub fn image(stack: &mut Stack, platform: &PlatformHandle, tag: &str) -> Value {
    let uri = stack.import(&platform.repository_uri);
    return join(":", vec![uri, json!(tag)]);
}

fn merge(target: &mut Value, source: Value) {
    if let (Some(target), Value::Object(source)) = (target.as_object_mut(), source) {
        target.extend(source);
    }
}
