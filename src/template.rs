//! Placeholder substitution for bootstrap scripts and runner configuration.
//!
//! Placeholders are upper-case tokens delimited by double underscores, e.g.
//! `__ACCOUNT_ID__`. Substitution is a single pass over the template: values
//! are inserted as-is and never scanned for further placeholders.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::{fs, io};

pub const REGISTER_SCRIPT: &str = "register.sh";
pub const RUNNER_CONFIG: &str = "config.toml";
pub const FARGATE_CONFIG: &str = "fargate.toml";
pub const CLOUDWATCH_AGENT_CONFIG: &str = "cloudwatch_agent.json";
pub const RUNNER_SERVICE_UNIT: &str = "gitlab-runner.service";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Template {0} not found")]
    TemplateNotFound(String),

    #[error("Unresolved placeholders in {template}: {}", .placeholders.join(", "))]
    Unresolved {
        template: String,
        placeholders: Vec<String>,
    },

    #[error("Unable to read template {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

pub static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__[A-Z][A-Z0-9_]*?__").unwrap());

/// Whether `text` still carries a placeholder token.
pub fn has_placeholder(text: &str) -> bool {
    return PLACEHOLDER.is_match(text);
}

/// Placeholder token to replacement value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderMap(BTreeMap<String, String>);

impl PlaceholderMap {
    pub fn new() -> Self {
        return Self::default();
    }

    pub fn with(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(token, value);
        return self;
    }

    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        self.0.insert(token.into(), value.into());
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        return self.0.get(token).map(String::as_str);
    }
}

/// What to do with a placeholder that has no entry in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Fail with [`Error::Unresolved`].
    #[default]
    Strict,
    /// Leave the token verbatim and log a warning.
    PassThrough,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer {
    strictness: Strictness,
}

impl TemplateRenderer {
    pub fn new(strictness: Strictness) -> Self {
        return Self { strictness };
    }

    pub fn render(&self, text: &str, placeholders: &PlaceholderMap) -> Result<String, Error> {
        return self.render_named("<inline>", text, placeholders);
    }

    pub fn render_file(&self, path: &Path, placeholders: &PlaceholderMap) -> Result<String, Error> {
        let text = read_template(path)?;
        return self.render_named(&path.display().to_string(), &text, placeholders);
    }

    pub fn render_named(
        &self,
        name: &str,
        text: &str,
        placeholders: &PlaceholderMap,
    ) -> Result<String, Error> {
        let mut unresolved: Vec<String> = vec![];
        let rendered = PLACEHOLDER.replace_all(text, |captures: &Captures| {
            let token = &captures[0];
            match placeholders.get(token) {
                Some(value) => value.to_string(),
                None => {
                    if !unresolved.iter().any(|seen| seen == token) {
                        unresolved.push(token.to_string());
                    }
                    token.to_string()
                }
            }
        });

        if !unresolved.is_empty() {
            match self.strictness {
                Strictness::Strict => {
                    return Err(Error::Unresolved {
                        template: name.to_string(),
                        placeholders: unresolved,
                    })
                }
                Strictness::PassThrough => tracing::warn!(
                    template = name,
                    placeholders = %unresolved.join(", "),
                    "leaving unresolved placeholders in place"
                ),
            }
        }

        return Ok(rendered.into_owned());
    }
}

fn read_template(path: &Path) -> Result<String, Error> {
    return match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::TemplateNotFound(path.display().to_string())),
            _ => Err(Error::Unreadable {
                path: path.display().to_string(),
                reason: error.to_string(),
            }),
        },
    };
}

/// Raw text of the bootstrap templates used by the runner fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTemplates {
    pub register_script: String,
    pub runner_config: String,
    pub fargate_config: String,
    pub cloudwatch_agent_config: String,
    pub service_unit: String,
}

impl BootstrapTemplates {
    /// Reads every template from `dir`. Any missing file fails the whole load.
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let read = |name: &str| -> Result<String, Error> {
            let path: PathBuf = dir.join(name);
            tracing::debug!(path = %path.display(), "reading template");
            return read_template(&path);
        };

        return Ok(Self {
            register_script: read(REGISTER_SCRIPT)?,
            runner_config: read(RUNNER_CONFIG)?,
            fargate_config: read(FARGATE_CONFIG)?,
            cloudwatch_agent_config: read(CLOUDWATCH_AGENT_CONFIG)?,
            service_unit: read(RUNNER_SERVICE_UNIT)?,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;
    use tempfile::tempdir;

    fn placeholders() -> PlaceholderMap {
        PlaceholderMap::new()
            .with("__ACCOUNT_ID__", "123456789012")
            .with("__REGION__", "eu-west-1")
    }

    #[test]
    fn replaces_every_occurrence() {
        let rendered = TemplateRenderer::default()
            .render(
                "aws --region __REGION__ sts; echo __REGION__ __ACCOUNT_ID__",
                &placeholders(),
            )
            .unwrap();
        assert_eq!(rendered, "aws --region eu-west-1 sts; echo eu-west-1 123456789012");
    }

    #[test]
    fn rendering_is_idempotent() {
        let renderer = TemplateRenderer::default();
        let text = "concurrent = 1\nregion = \"__REGION__\"\n";
        let first = renderer.render(text, &placeholders()).unwrap();
        let second = renderer.render(text, &placeholders()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn values_are_not_rescanned() {
        let map = PlaceholderMap::new()
            .with("__RUNNER_NAME__", "__REGION__")
            .with("__REGION__", "eu-west-1");
        let rendered = TemplateRenderer::default()
            .render("name=__RUNNER_NAME__", &map)
            .unwrap();
        assert_eq!(rendered, "name=__REGION__");
    }

    #[test]
    fn strict_mode_reports_unresolved_placeholders() {
        let result = TemplateRenderer::new(Strictness::Strict).render(
            "__REGION__ __CACHE_BUCKET__ __CACHE_BUCKET__ __SUBNET_ID__",
            &placeholders(),
        );
        assert_eq!(
            result.err().unwrap(),
            Error::Unresolved {
                template: String::from("<inline>"),
                placeholders: vec![String::from("__CACHE_BUCKET__"), String::from("__SUBNET_ID__")],
            }
        );
    }

    #[test]
    fn pass_through_mode_leaves_tokens_verbatim() {
        let rendered = TemplateRenderer::new(Strictness::PassThrough)
            .render("__REGION__/__CACHE_BUCKET__", &placeholders())
            .unwrap();
        assert_eq!(rendered, "eu-west-1/__CACHE_BUCKET__");
    }

    #[test]
    fn ignores_shell_variables_and_lower_case_dunders() {
        let text = "echo ${HOME} $PATH __init__ __REGION__";
        let rendered = TemplateRenderer::default().render(text, &placeholders()).unwrap();
        assert_eq!(rendered, "echo ${HOME} $PATH __init__ eu-west-1");
    }

    #[test]
    fn detects_leftover_placeholders_only() {
        assert!(has_placeholder("arn:aws:s3:::__CACHE_BUCKET__/*"));
        assert!(!has_placeholder("arn:aws:secretsmanager:eu-west-1:1:secret:ci__runner-token*"));
        assert!(!has_placeholder("__init__"));
    }

    #[test]
    fn missing_template_file() {
        let dir = tempdir().unwrap();
        let result = TemplateRenderer::default()
            .render_file(&dir.path().join("register.sh"), &placeholders());
        match result.err().unwrap() {
            Error::TemplateNotFound(path) => assert!(path.ends_with("register.sh")),
            other => panic!("Expected `TemplateNotFound` error, got {:?}", other),
        }
    }

    #[test]
    fn renders_template_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("fargate.toml");
        let mut file = File::create(&file_path).unwrap();
        write!(file, "Region = \"__REGION__\"").unwrap();

        let rendered = TemplateRenderer::default()
            .render_file(&file_path, &placeholders())
            .unwrap();
        assert_eq!(rendered, "Region = \"eu-west-1\"");
    }

    #[test]
    fn bootstrap_templates_require_every_file() {
        let dir = tempdir().unwrap();
        for name in [REGISTER_SCRIPT, RUNNER_CONFIG, FARGATE_CONFIG, CLOUDWATCH_AGENT_CONFIG] {
            File::create(dir.path().join(name)).unwrap();
        }

        match BootstrapTemplates::load(dir.path()).err().unwrap() {
            Error::TemplateNotFound(path) => assert!(path.ends_with(RUNNER_SERVICE_UNIT)),
            other => panic!("Expected `TemplateNotFound` error, got {:?}", other),
        }

        File::create(dir.path().join(RUNNER_SERVICE_UNIT)).unwrap();
        assert!(BootstrapTemplates::load(dir.path()).is_ok());
    }
}
