use crate::{config, outputs, policy, provider, template, writer};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by stack assembly.
///
/// Configuration and template failures are fatal. Provider failures carry the
/// step that was being performed and are never retried here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] config::Error),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Template error: {0}")]
    Template(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Provider error while {context}: {source}")]
    Provider {
        context: String,
        #[source]
        source: provider::Error,
    },

    #[error("Output error: {0}")]
    Output(#[source] writer::Error),
}

impl Error {
    pub fn provider(context: impl Into<String>, source: provider::Error) -> Self {
        return match source {
            provider::Error::NetworkNotFound(vpc_id) => {
                Error::ResourceNotFound(format!("network {}", vpc_id))
            }
            source => Error::Provider {
                context: context.into(),
                source,
            },
        };
    }
}

impl From<template::Error> for Error {
    fn from(error: template::Error) -> Self {
        return match error {
            template::Error::TemplateNotFound(path) => {
                Error::ResourceNotFound(format!("template {}", path))
            }
            other => Error::Template(Box::new(other)),
        };
    }
}

impl From<policy::Error> for Error {
    fn from(error: policy::Error) -> Self {
        return match error {
            policy::Error::Template(error) => error.into(),
            policy::Error::Unqualified(resource) => {
                Error::Configuration(config::Error::ValidationError(format!(
                    "resource pattern `{}` is not fully qualified",
                    resource
                )))
            }
            other => Error::Template(Box::new(other)),
        };
    }
}

impl From<outputs::Error> for Error {
    fn from(error: outputs::Error) -> Self {
        return match error {
            outputs::Error::NotFoundError(stack_name) => {
                Error::ResourceNotFound(format!("stack {}", stack_name))
            }
            outputs::Error::RegionNotFound => {
                Error::Configuration(config::Error::MissingKey(String::from("region")))
            }
            other => Error::provider(
                "reading deployed stack outputs",
                provider::Error::Remote(other.to_string()),
            ),
        };
    }
}

impl From<writer::Error> for Error {
    fn from(error: writer::Error) -> Self {
        return match error {
            writer::Error::Missing(path) => Error::ResourceNotFound(format!("file {}", path)),
            other => Error::Output(other),
        };
    }
}

/// Extension used to attach the current assembly step to provider failures.
pub trait ProviderContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ProviderContext<T> for std::result::Result<T, provider::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        return self.map_err(|error| Error::provider(context, error));
    }
}
