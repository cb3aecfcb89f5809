use serde_json::{json, Value};

use super::{Error, SecurityGroupRef, StackId};
use crate::template::{availability_zone, get_att, reference, Export, Resource, Stack};

pub const MAX_AZS: usize = 2;
pub const VPC_CIDR: &str = "10.0.0.0/16";
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

const ANY_IPV4: &str = "0.0.0.0/0";

/// What the network stack publishes for the stacks that live inside it.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub vpc_id: Export,
    pub public_subnets: Vec<Export>,
    pub private_subnets: Vec<Export>,
    /// Load balancer facing; accepts 80 and 443 from anywhere.
    pub edge_security_group: SecurityGroupRef,
    /// Attached to the service tasks; egress only.
    pub service_security_group: SecurityGroupRef,
}

pub fn build(id: StackId) -> Result<(Stack, NetworkHandle), Error> {
    let mut stack = Stack::new(id.name(), id.description());

    let vpc = stack.add_resource(
        "BookManagementVPC",
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": VPC_CIDR,
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": [{ "Key": "Name", "Value": "BookManagementVPC" }],
            }),
        ),
    )?;

    let internet_gateway = stack.add_resource(
        "BookManagementVPCIGW",
        Resource::new("AWS::EC2::InternetGateway", json!({})),
    )?;
    stack.add_resource(
        "BookManagementVPCGatewayAttachment",
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({ "VpcId": vpc, "InternetGatewayId": internet_gateway }),
        ),
    )?;

    let mut public_subnets = Vec::new();
    for az in 0..MAX_AZS {
        let subnet = add_subnet(&mut stack, &vpc, "Public", az)?;
        stack.add_resource(
            &format!("PublicSubnet{}DefaultRoute", az + 1),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": reference(&format!("PublicSubnet{}RouteTable", az + 1)),
                    "DestinationCidrBlock": ANY_IPV4,
                    "GatewayId": internet_gateway,
                }),
            )
            .depends_on("BookManagementVPCGatewayAttachment"),
        )?;
        public_subnets.push(subnet);
    }

    // A single NAT gateway shared by every private subnet.
    stack.add_resource(
        "PublicSubnet1EIP",
        Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" })),
    )?;
    let nat_gateway = stack.add_resource(
        "PublicSubnet1NATGateway",
        Resource::new(
            "AWS::EC2::NatGateway",
            json!({
                "SubnetId": public_subnets[0],
                "AllocationId": get_att("PublicSubnet1EIP", "AllocationId"),
            }),
        )
        .depends_on("PublicSubnet1DefaultRoute"),
    )?;

    let mut private_subnets = Vec::new();
    for az in 0..MAX_AZS {
        let subnet = add_subnet(&mut stack, &vpc, "Private", az)?;
        stack.add_resource(
            &format!("PrivateSubnet{}DefaultRoute", az + 1),
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": reference(&format!("PrivateSubnet{}RouteTable", az + 1)),
                    "DestinationCidrBlock": ANY_IPV4,
                    "NatGatewayId": nat_gateway,
                }),
            ),
        )?;
        private_subnets.push(subnet);
    }

    stack.add_resource(
        "FargateServiceSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": "Security group for Fargate service",
                "VpcId": vpc,
                "SecurityGroupEgress": [allow_all_outbound()],
            }),
        ),
    )?;

    stack.add_resource(
        "ALBSecurityGroup",
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": "Security group for Application Load Balancer",
                "VpcId": vpc,
                "SecurityGroupIngress": [
                    ingress_from_anywhere(HTTP_PORT, "Allow HTTP traffic"),
                    ingress_from_anywhere(HTTPS_PORT, "Allow HTTPS traffic"),
                ],
                "SecurityGroupEgress": [allow_all_outbound()],
            }),
        ),
    )?;

    let vpc_id = stack.export("VpcId", vpc, "VPC ID")?;
    let service_security_group = SecurityGroupRef {
        group_id: stack.export(
            "FargateSecurityGroupId",
            get_att("FargateServiceSecurityGroup", "GroupId"),
            "Fargate Service Security Group ID",
        )?,
    };
    let edge_security_group = SecurityGroupRef {
        group_id: stack.export(
            "ALBSecurityGroupId",
            get_att("ALBSecurityGroup", "GroupId"),
            "ALB Security Group ID",
        )?,
    };

    let public_subnets = public_subnets
        .into_iter()
        .enumerate()
        .map(|(az, subnet)| {
            let id = format!("PublicSubnet{}Id", az + 1);
            stack.export(&id, subnet, "Public subnet ID")
        })
        .collect::<Result<Vec<Export>, _>>()?;
    let private_subnets = private_subnets
        .into_iter()
        .enumerate()
        .map(|(az, subnet)| {
            let id = format!("PrivateSubnet{}Id", az + 1);
            stack.export(&id, subnet, "Private subnet ID")
        })
        .collect::<Result<Vec<Export>, _>>()?;

    let handle = NetworkHandle {
        vpc_id,
        public_subnets,
        private_subnets,
        edge_security_group,
        service_security_group,
    };
    return Ok((stack, handle));
}

/// Declares a `/18` subnet with its own route table and returns a `Ref` to the subnet.
fn add_subnet(stack: &mut Stack, vpc: &Value, tier: &str, az: usize) -> Result<Value, Error> {
    let public = tier == "Public";
    // Public subnets take the lower half of the VPC range, private ones the upper half.
    let block = if public { az } else { MAX_AZS + az };
    let name = format!("{}Subnet{}", tier, az + 1);

    let subnet = stack.add_resource(
        &name,
        Resource::new(
            "AWS::EC2::Subnet",
            json!({
                "VpcId": vpc,
                "AvailabilityZone": availability_zone(az),
                "CidrBlock": format!("10.0.{}.0/18", block * 64),
                "MapPublicIpOnLaunch": public,
                "Tags": [{ "Key": "Name", "Value": name }],
            }),
        ),
    )?;

    let route_table = stack.add_resource(
        &format!("{}RouteTable", name),
        Resource::new("AWS::EC2::RouteTable", json!({ "VpcId": vpc })),
    )?;
    stack.add_resource(
        &format!("{}RouteTableAssociation", name),
        Resource::new(
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({ "RouteTableId": route_table, "SubnetId": subnet }),
        ),
    )?;

    return Ok(subnet);
}

fn ingress_from_anywhere(port: u16, description: &str) -> Value {
    return json!({
        "CidrIp": ANY_IPV4,
        "IpProtocol": "tcp",
        "FromPort": port,
        "ToPort": port,
        "Description": description,
    });
}

pub(crate) fn allow_all_outbound() -> Value {
    return json!({
        "CidrIp": ANY_IPV4,
        "IpProtocol": "-1",
        "Description": "Allow all outbound traffic by default",
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::build;
    use crate::stacks::fixtures::resources;
    use crate::stacks::StackId;

    fn template() -> serde_json::Value {
        let (stack, _) = build(StackId::Network).unwrap();
        serde_json::to_value(&stack.template).unwrap()
    }

    #[test]
    fn spans_two_azs_with_a_single_nat() {
        let template = template();

        assert_eq!(resources(&template, "AWS::EC2::Subnet").len(), 4);
        assert_eq!(resources(&template, "AWS::EC2::NatGateway").len(), 1);
        assert_eq!(resources(&template, "AWS::EC2::EIP").len(), 1);

        for az in 1..=2 {
            let route = &template["Resources"][format!("PrivateSubnet{}DefaultRoute", az)];
            assert_eq!(
                route["Properties"]["NatGatewayId"],
                json!({ "Ref": "PublicSubnet1NATGateway" })
            );
        }
    }

    #[test]
    fn subnets_do_not_overlap() {
        let template = template();
        let mut blocks: Vec<String> = resources(&template, "AWS::EC2::Subnet")
            .iter()
            .map(|subnet| subnet["CidrBlock"].as_str().unwrap().to_string())
            .collect();
        blocks.sort();
        blocks.dedup();

        assert_eq!(
            blocks,
            vec!["10.0.0.0/18", "10.0.128.0/18", "10.0.192.0/18", "10.0.64.0/18"]
        );
    }

    #[test]
    fn declares_exactly_two_security_groups() {
        let template = template();
        assert_eq!(resources(&template, "AWS::EC2::SecurityGroup").len(), 2);
    }

    #[test]
    fn edge_group_only_accepts_http_and_https() {
        let template = template();
        let edge = &template["Resources"]["ALBSecurityGroup"]["Properties"];

        let ports: Vec<(u64, u64)> = edge["SecurityGroupIngress"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rule| {
                assert_eq!(rule["CidrIp"], "0.0.0.0/0");
                assert_eq!(rule["IpProtocol"], "tcp");
                (rule["FromPort"].as_u64().unwrap(), rule["ToPort"].as_u64().unwrap())
            })
            .collect();
        assert_eq!(ports, vec![(80, 80), (443, 443)]);
    }

    #[test]
    fn service_group_has_no_ingress() {
        let template = template();
        let service = &template["Resources"]["FargateServiceSecurityGroup"]["Properties"];

        assert_eq!(service.get("SecurityGroupIngress"), None);
        assert_eq!(service["SecurityGroupEgress"][0]["IpProtocol"], "-1");
    }

    #[test]
    fn publishes_vpc_and_security_groups() {
        let (stack, handle) = build(StackId::Network).unwrap();

        assert_eq!(handle.vpc_id.name, "BookManagementVpcStack:VpcId");
        assert_eq!(
            handle.service_security_group.group_id.name,
            "BookManagementVpcStack:FargateSecurityGroupId"
        );
        assert_eq!(
            handle.edge_security_group.group_id.name,
            "BookManagementVpcStack:ALBSecurityGroupId"
        );
        assert_eq!(handle.public_subnets.len(), 2);
        assert_eq!(handle.private_subnets.len(), 2);
        assert!(stack.template.outputs.contains_key("VpcId"));
    }
}
