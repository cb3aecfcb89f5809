use std::collections::BTreeMap;
use std::time::Duration;

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::model::Capability;
use aws_types::region::Region;

use crate::template::Stack;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),

    #[error("Deployment of {stack} ended in {status}: {reason}")]
    DeploymentFailed {
        stack: String,
        status: String,
        reason: String,
    },

    #[error("Unable to render the template of {0}: {1}")]
    TemplateError(String, String),
}

/// Where a stack is in its lifecycle, as far as a deployment is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Complete,
    Failed,
}

/// Maps a CloudFormation stack status onto [`Progress`]. Any rollback counts as a failure,
/// even when the rollback itself completed. `REVIEW_IN_PROGRESS` only moves on once someone
/// executes a pending change set, so it fails too.
pub fn classify(status: &str) -> Progress {
    if status == "REVIEW_IN_PROGRESS" {
        return Progress::Failed;
    }
    if status.ends_with("_IN_PROGRESS") {
        return Progress::InProgress;
    }
    if status.contains("ROLLBACK") || status.ends_with("_FAILED") {
        return Progress::Failed;
    }
    if status.ends_with("_COMPLETE") {
        return Progress::Complete;
    }
    return Progress::Failed;
}

struct StackState {
    status: String,
    reason: Option<String>,
    outputs: BTreeMap<String, String>,
}

pub struct Client {
    client: aws_sdk_cloudformation::Client,
    poll_interval: Duration,
}

impl Client {
    pub async fn new(region: &str, poll_interval: Duration) -> Self {
        let region = RegionProviderChain::first_try(Region::new(region.to_string()))
            .or_default_provider();
        let sdk_config = aws_config::from_env().region(region).load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        return Self {
            client,
            poll_interval,
        };
    }

    pub async fn get_outputs(&self, stack_name: &str) -> Result<BTreeMap<String, String>, Error> {
        let state = self.describe(stack_name).await?;
        return Ok(state.outputs);
    }

    /// Creates `stack` or updates it in place, then waits for CloudFormation to settle.
    pub async fn deploy(&self, stack: &Stack) -> Result<BTreeMap<String, String>, Error> {
        let template_body = match serde_json::to_string(&stack.template) {
            Ok(body) => body,
            Err(error) => return Err(Error::TemplateError(stack.name.clone(), error.to_string())),
        };

        let exists = match self.describe(&stack.name).await {
            Ok(state) => {
                if classify(&state.status) == Progress::InProgress {
                    tracing::warn!(stack = %stack.name, status = %state.status, "Waiting for a running operation");
                    self.wait(&stack.name).await?;
                }
                if state.status == "REVIEW_IN_PROGRESS" {
                    return Err(Error::DeploymentFailed {
                        stack: stack.name.clone(),
                        status: state.status,
                        reason: String::from("A change set is waiting to be executed or deleted"),
                    });
                }
                true
            }
            Err(Error::NotFoundError(_)) => false,
            Err(error) => return Err(error),
        };

        if exists {
            tracing::info!(stack = %stack.name, "Updating stack");
            let result = self
                .client
                .update_stack()
                .stack_name(&stack.name)
                .template_body(template_body)
                .capabilities(Capability::CapabilityNamedIam)
                .send()
                .await;

            match result {
                Ok(_) => (),
                Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                    let message = err.to_string();
                    if message.contains("No updates are to be performed") {
                        tracing::info!(stack = %stack.name, "Stack is up to date");
                        return self.get_outputs(&stack.name).await;
                    }
                    return Err(Error::ServiceError(message));
                }
                Err(err) => return Err(Error::UnknownError(err.to_string())),
            }
        } else {
            tracing::info!(stack = %stack.name, "Creating stack");
            let result = self
                .client
                .create_stack()
                .stack_name(&stack.name)
                .template_body(template_body)
                .capabilities(Capability::CapabilityNamedIam)
                .send()
                .await;

            match result {
                Ok(_) => (),
                Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                    return Err(Error::ServiceError(err.to_string()));
                }
                Err(err) => return Err(Error::UnknownError(err.to_string())),
            }
        }

        let state = self.wait(&stack.name).await?;
        tracing::info!(stack = %stack.name, status = %state.status, "Stack deployed");
        return Ok(state.outputs);
    }

    async fn wait(&self, stack_name: &str) -> Result<StackState, Error> {
        loop {
            let state = self.describe(stack_name).await?;
            match classify(&state.status) {
                Progress::InProgress => {
                    tracing::debug!(stack = %stack_name, status = %state.status, "Waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Progress::Complete => return Ok(state),
                Progress::Failed => {
                    return Err(Error::DeploymentFailed {
                        stack: stack_name.to_string(),
                        status: state.status,
                        reason: state.reason.unwrap_or_default(),
                    })
                }
            }
        }
    }

    async fn describe(&self, stack_name: &str) -> Result<StackState, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                let message = err.to_string();
                if message.contains("does not exist") {
                    return Err(Error::NotFoundError(stack_name.to_string()));
                }
                return Err(Error::ServiceError(message));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let stacks = result.stacks().unwrap_or_else(|| &[]);
        let stack = match stacks.get(0) {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(stack_name.to_string())),
        };

        let outputs = stack
            .outputs()
            .unwrap_or_else(|| &[])
            .iter()
            .filter_map(|output| {
                let key = output.output_key()?;
                let value = output.output_value()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();

        return Ok(StackState {
            status: stack
                .stack_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            reason: stack.stack_status_reason().map(String::from),
            outputs,
        });
    }
}
