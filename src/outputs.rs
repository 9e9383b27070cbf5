use std::collections::BTreeMap;

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::Region;
use futures::future::try_join_all;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack not found")]
    NotFoundError(String),

    #[error("No region configured and none found in the environment")]
    RegionNotFound,
}

/// Region given on the command line, otherwise the AWS default provider chain
/// (environment, profile, instance metadata).
pub async fn resolve_region(provided: Option<String>) -> Result<Region, Error> {
    if let Some(provided_region) = provided {
        return Ok(Region::new(provided_region));
    }

    return match RegionProviderChain::default_provider().region().await {
        Some(region) => Ok(region),
        None => Err(Error::RegionNotFound),
    };
}

/// A deployed CloudFormation stack.
pub struct Stack {
    pub stack_name: String,

    client: aws_sdk_cloudformation::Client,
}

impl Stack {
    pub fn new(stack_name: &str, client: aws_sdk_cloudformation::Client) -> Self {
        return Self {
            stack_name: stack_name.to_string(),
            client,
        };
    }

    /// Output key to output value.
    pub async fn get_outputs(&self) -> Result<BTreeMap<String, String>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(&self.stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                let message = err.to_string();
                // Unknown stacks are reported as a validation error.
                if message.contains("does not exist") {
                    return Err(Error::NotFoundError(self.stack_name.clone()));
                }
                return Err(Error::ServiceError(message));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let stack = match result.stacks().unwrap_or_else(|| &[]).first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(self.stack_name.clone())),
        };

        let outputs = stack
            .outputs()
            .unwrap_or_else(|| &[])
            .iter()
            .filter_map(|output| match (output.output_key(), output.output_value()) {
                (Some(key), Some(value)) => Some((key.to_string(), value.to_string())),
                _ => None,
            })
            .collect();

        return Ok(outputs);
    }
}

pub async fn client(region: Region) -> aws_sdk_cloudformation::Client {
    let sdk_config: aws_types::SdkConfig = aws_config::from_env().region(region).load().await;
    return aws_sdk_cloudformation::Client::new(&sdk_config);
}

/// Fetches the outputs of several stacks concurrently, keyed by stack name.
pub async fn fetch_all(
    region: Region,
    stack_names: &[String],
) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
    let client = client(region).await;
    let stacks: Vec<Stack> = stack_names
        .iter()
        .map(|stack_name| Stack::new(stack_name, client.clone()))
        .collect();

    let fetched = try_join_all(stacks.iter().map(|stack| async move {
        let outputs = stack.get_outputs().await?;
        tracing::info!(
            stack = %stack.stack_name,
            outputs = outputs.len(),
            "fetched deployed stack outputs"
        );
        Ok::<_, Error>((stack.stack_name.clone(), outputs))
    }))
    .await?;

    return Ok(fetched.into_iter().collect());
}
