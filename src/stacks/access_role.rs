use serde_json::{json, Value};

use super::{Error, StackId};
use crate::config::RepositoryCoordinates;
use crate::template::{get_att, managed_policy_arn, reference, Export, Resource, Stack};

pub const OIDC_ISSUER: &str = "token.actions.githubusercontent.com";
pub const OIDC_AUDIENCE: &str = "sts.amazonaws.com";
pub const ROLE_NAME: &str = "BookManagementGithubActionsRole";
pub const ROLE_ARN_EXPORT: &str = "BookManagementGithubActionsRoleArn";
pub const MAX_SESSION_SECONDS: u32 = 3600;

/// Certificate thumbprints GitHub publishes for its OIDC issuer.
const GITHUB_THUMBPRINTS: [&str; 2] = [
    "6938fd4d98bab03faadb97b34396831e3780aea1",
    "1c58a3a8518e8759bf075b76b750d4f2df264fcd",
];

const EC2_ACTIONS: &[&str] = &[
    "ec2:DescribeAvailabilityZones",
    "ec2:DescribeVpcs",
    "ec2:DescribeSubnets",
    "ec2:DescribeSecurityGroups",
    "ec2:DescribeInternetGateways",
    "ec2:DescribeNatGateways",
    "ec2:DescribeRouteTables",
    "ec2:DescribeDhcpOptions",
    "ec2:CreateSecurityGroup",
    "ec2:AuthorizeSecurityGroupIngress",
    "ec2:AuthorizeSecurityGroupEgress",
    "ec2:CreateTags",
    "ec2:DescribeTags",
];

const S3_ACTIONS: &[&str] = &[
    "s3:CreateBucket",
    "s3:DeleteBucket",
    "s3:PutBucketPolicy",
    "s3:GetBucketPolicy",
    "s3:DeleteBucketPolicy",
    "s3:PutBucketVersioning",
    "s3:GetBucketVersioning",
    "s3:PutBucketPublicAccessBlock",
    "s3:GetBucketPublicAccessBlock",
    "s3:PutObject",
    "s3:GetObject",
    "s3:DeleteObject",
    "s3:PutObjectAcl",
    "s3:GetObjectAcl",
    "s3:ListBucket",
    "s3:GetBucketLocation",
    "s3:GetBucketAcl",
    "s3:PutBucketAcl",
];

const SSM_ACTIONS: &[&str] = &[
    "ssm:GetParameter",
    "ssm:GetParameters",
    "ssm:DescribeParameters",
    "ssm:PutParameter",
];

const IAM_ACTIONS: &[&str] = &[
    "iam:GetRole",
    "iam:CreateRole",
    "iam:DeleteRole",
    "iam:PassRole",
    "iam:AttachRolePolicy",
    "iam:DetachRolePolicy",
    "iam:PutRolePolicy",
    "iam:GetRolePolicy",
    "iam:DeleteRolePolicy",
    "iam:TagRole",
];

const SECRETS_MANAGER_ACTIONS: &[&str] = &[
    "secretsmanager:GetSecretValue",
    "secretsmanager:DescribeSecret",
    "secretsmanager:ListSecretVersionIds",
];

const LOGS_ACTIONS: &[&str] = &[
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
    "logs:DescribeLogGroups",
    "logs:DescribeLogStreams",
    "logs:DeleteLogGroup",
    "logs:DeleteLogStream",
];

#[derive(Debug, Clone)]
pub struct AccessRoleHandle {
    pub role_arn: Export,
}

/// `repo:<owner>/<name>:*`, matching every ref and environment of the repository.
pub fn subject_claim(repository: &RepositoryCoordinates) -> String {
    return format!("repo:{}/{}:*", repository.owner, repository.name);
}

/// The statements attached to the deployment role, in declaration order.
pub fn policy_statements() -> Vec<Value> {
    let mut statements = vec![allow(&["cloudformation:*"])];
    statements.push(allow(EC2_ACTIONS));
    statements.push(allow(S3_ACTIONS));
    statements.push(allow(SSM_ACTIONS));
    statements.push(allow(&["ecs:*"]));
    statements.push(allow(&["elasticloadbalancing:*"]));
    statements.push(allow(IAM_ACTIONS));
    statements.push(allow(SECRETS_MANAGER_ACTIONS));
    statements.push(allow(LOGS_ACTIONS));
    statements.push(allow(&["application-autoscaling:*"]));
    return statements;
}

fn allow(actions: &[&str]) -> Value {
    return json!({
        "Effect": "Allow",
        "Action": actions,
        "Resource": "*",
    });
}

/// `repository` is expected to have passed configuration validation already.
pub fn build(
    id: StackId,
    repository: &RepositoryCoordinates,
) -> Result<(Stack, AccessRoleHandle), Error> {
    let mut stack = Stack::new(id.name(), id.description());

    let provider = stack.add_resource(
        "GithubActionsProvider",
        Resource::new(
            "AWS::IAM::OIDCProvider",
            json!({
                "Url": format!("https://{}", OIDC_ISSUER),
                "ClientIdList": [OIDC_AUDIENCE],
                "ThumbprintList": GITHUB_THUMBPRINTS,
            }),
        ),
    )?;

    stack.add_resource(
        "GithubActionsRole",
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "RoleName": ROLE_NAME,
                "Description": "Role used by GitHub Actions to deploy Book Management API",
                "MaxSessionDuration": MAX_SESSION_SECONDS,
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Federated": provider },
                        "Action": "sts:AssumeRoleWithWebIdentity",
                        "Condition": {
                            "StringEquals": {
                                format!("{}:aud", OIDC_ISSUER): OIDC_AUDIENCE,
                            },
                            "StringLike": {
                                format!("{}:sub", OIDC_ISSUER): subject_claim(repository),
                            },
                        },
                    }],
                },
                "ManagedPolicyArns": [managed_policy_arn("AmazonEC2ContainerRegistryFullAccess")],
            }),
        ),
    )?;

    stack.add_resource(
        "GithubActionsRoleDefaultPolicy",
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyName": "GithubActionsRoleDefaultPolicy",
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": policy_statements(),
                },
                "Roles": [reference("GithubActionsRole")],
            }),
        ),
    )?;

    let role_arn = stack.export_as(
        "GithubActionsRoleArn",
        ROLE_ARN_EXPORT,
        get_att("GithubActionsRole", "Arn"),
        "ARN of the IAM role for GitHub Actions",
    )?;

    return Ok((stack, AccessRoleHandle { role_arn }));
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build, policy_statements, subject_claim};
    use crate::config::RepositoryCoordinates;
    use crate::stacks::StackId;

    fn repository() -> RepositoryCoordinates {
        RepositoryCoordinates {
            owner: String::from("acme"),
            name: String::from("books"),
        }
    }

    #[test]
    fn trusts_only_the_configured_repository() {
        let (stack, _) = build(StackId::AccessRole, &repository()).unwrap();
        let template = serde_json::to_value(&stack.template).unwrap();

        let statement =
            &template["Resources"]["GithubActionsRole"]["Properties"]["AssumeRolePolicyDocument"]["Statement"][0];
        assert_eq!(statement["Action"], "sts:AssumeRoleWithWebIdentity");
        assert_eq!(
            statement["Principal"]["Federated"],
            json!({ "Ref": "GithubActionsProvider" })
        );
        assert_eq!(
            statement["Condition"]["StringEquals"]["token.actions.githubusercontent.com:aud"],
            "sts.amazonaws.com"
        );
        assert_eq!(
            statement["Condition"]["StringLike"]["token.actions.githubusercontent.com:sub"],
            "repo:acme/books:*"
        );
    }

    #[test]
    fn caps_the_session_at_one_hour() {
        let (stack, _) = build(StackId::AccessRole, &repository()).unwrap();
        let template = serde_json::to_value(&stack.template).unwrap();

        let role = &template["Resources"]["GithubActionsRole"]["Properties"];
        assert_eq!(role["MaxSessionDuration"], 3600);
        assert_eq!(role["RoleName"], "BookManagementGithubActionsRole");
    }

    #[test]
    fn registers_the_github_issuer() {
        let (stack, _) = build(StackId::AccessRole, &repository()).unwrap();
        let template = serde_json::to_value(&stack.template).unwrap();

        let provider = &template["Resources"]["GithubActionsProvider"]["Properties"];
        assert_eq!(provider["Url"], "https://token.actions.githubusercontent.com");
        assert_eq!(provider["ClientIdList"], json!(["sts.amazonaws.com"]));
    }

    #[test]
    fn wildcards_only_the_orchestration_namespaces() {
        let wildcards: Vec<String> = policy_statements()
            .iter()
            .flat_map(|statement| statement["Action"].as_array().unwrap().clone())
            .filter_map(|action| action.as_str().map(String::from))
            .filter(|action| action.ends_with(":*"))
            .collect();

        assert_eq!(
            wildcards,
            vec![
                "cloudformation:*",
                "ecs:*",
                "elasticloadbalancing:*",
                "application-autoscaling:*",
            ]
        );
    }

    #[test]
    fn exports_the_role_arn() {
        let (stack, handle) = build(StackId::AccessRole, &repository()).unwrap();

        assert_eq!(handle.role_arn.name, "BookManagementGithubActionsRoleArn");
        assert!(stack.template.outputs.contains_key("GithubActionsRoleArn"));
    }

    #[test]
    fn subject_claim_covers_every_ref() {
        assert_eq!(subject_claim(&repository()), "repo:acme/books:*");
    }
}
