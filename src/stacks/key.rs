use serde_json::json;

use super::{Error, StackId};
use crate::template::{get_att, sub, Export, RemovalPolicy, Resource, Stack};

pub const KEY_ARN_EXPORT: &str = "BookManagementSopsKeyArn";

/// The key `.sops.yaml` routes encryption through. Nothing in the other stacks imports it.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub key_arn: Export,
}

pub fn build(id: StackId) -> Result<(Stack, KeyHandle), Error> {
    let mut stack = Stack::new(id.name(), id.description());

    stack.add_resource(
        "SopsKey",
        Resource::new(
            "AWS::KMS::Key",
            json!({
                "Description": "KMS key for SOPS encryption",
                "EnableKeyRotation": true,
                "KeyPolicy": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "AWS": sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root") },
                        "Action": "kms:*",
                        "Resource": "*",
                    }],
                },
            }),
        )
        .with_removal_policy(RemovalPolicy::Delete),
    )?;

    let key_arn = stack.export_as(
        "SopsKeyArn",
        KEY_ARN_EXPORT,
        get_att("SopsKey", "Arn"),
        "KMS Key ARN for SOPS",
    )?;

    return Ok((stack, KeyHandle { key_arn }));
}
