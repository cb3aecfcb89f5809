use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use validator::{Validate, ValidationError};

use crate::app::Environment;

pub const DEFAULT_REGION: &str = "ap-southeast-1";
pub const DEFAULT_REPOSITORY_OWNER: &str = "book-management";
pub const DEFAULT_REPOSITORY_NAME: &str = "book-management-api";
pub const DEFAULT_SECRETS_FILE: &str = "secrets/env.sops.yaml";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("{0} environment variable must be set")]
    MissingVariable(&'static str),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// GitHub repository whose workflows may assume the deployment role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RepositoryCoordinates {
    #[validate(length(min = 1), custom = "validate_github_name")]
    pub owner: String,

    #[validate(length(min = 1), custom = "validate_github_name")]
    pub name: String,
}

impl Default for RepositoryCoordinates {
    fn default() -> Self {
        return Self {
            owner: String::from(DEFAULT_REPOSITORY_OWNER),
            name: String::from(DEFAULT_REPOSITORY_NAME),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsFile {
    pub file: PathBuf,
    pub sops_config: Option<PathBuf>,
}

impl Default for SecretsFile {
    fn default() -> Self {
        return Self {
            file: PathBuf::from(DEFAULT_SECRETS_FILE),
            sops_config: None,
        };
    }
}

/// Settings as read from the optional YAML file, before the environment is applied.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    pub account: Option<String>,

    pub region: Option<String>,

    #[validate]
    pub repository: RepositoryCoordinates,

    #[validate(custom = "validate_certificate_arn")]
    pub certificate_arn: Option<String>,

    pub secrets: SecretsFile,
}

impl Settings {
    /// Overrides file values with whatever `lookup` finds in the environment. Variables that
    /// are set but empty count as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let variable = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let first = |names: &[&str]| names.iter().find_map(|name| variable(*name));

        if let Some(account) = first(&["CDK_DEFAULT_ACCOUNT", "AWS_ACCOUNT_ID"]) {
            self.account = Some(account);
        }
        if let Some(region) = first(&["CDK_DEFAULT_REGION", "AWS_REGION"]) {
            self.region = Some(region);
        }
        if let Some(owner) = variable("GITHUB_REPOSITORY_OWNER") {
            self.repository.owner = owner;
        }
        if let Some(name) = variable("GITHUB_REPOSITORY_NAME") {
            self.repository.name = name;
        }
        if let Some(certificate_arn) = variable("CERTIFICATE_ARN") {
            self.certificate_arn = Some(certificate_arn);
        }
        if let Some(file) = variable("SOPS_SECRETS_FILE") {
            self.secrets.file = PathBuf::from(file);
        }
        if let Some(sops_config) = variable("SOPS_CONFIG") {
            self.secrets.sops_config = Some(PathBuf::from(sops_config));
        }
    }
}

/// Fully resolved configuration every stack is synthesized from.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub environment: Environment,
    pub repository: RepositoryCoordinates,
    pub certificate_arn: String,
    pub secrets: SecretsFile,
}

pub fn parse(path: &Path) -> Result<Settings, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let settings: Settings = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    return Ok(settings);
}

/// Reads the optional settings file, layers the environment over it and validates the result.
pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Config, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match path {
        Some(path) => parse(path)?,
        None => Settings::default(),
    };
    settings.apply_env(lookup);

    match settings.validate() {
        Ok(_) => (),
        Err(error) => return Err(Error::ValidationError(error.to_string())),
    }

    let certificate_arn = match settings.certificate_arn {
        Some(arn) if !arn.trim().is_empty() => arn,
        _ => return Err(Error::MissingVariable("CERTIFICATE_ARN")),
    };

    return Ok(Config {
        environment: Environment {
            account: settings.account,
            region: settings
                .region
                .unwrap_or_else(|| String::from(DEFAULT_REGION)),
        },
        repository: settings.repository,
        certificate_arn,
        secrets: settings.secrets,
    });
}

fn validate_github_name(name: &str) -> Result<(), ValidationError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ValidationError::new(
            "GitHub owner and repository names may only contain letters, digits, `-`, `_` and `.`",
        ));
    }

    return Ok(());
}

fn validate_certificate_arn(arn: &str) -> Result<(), ValidationError> {
    if arn.trim().is_empty() {
        // Reported as a missing variable once validation passes.
        return Ok(());
    }

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" || parts[2] != "acm" {
        return Err(ValidationError::new(
            "CERTIFICATE_ARN has to be an ACM certificate ARN",
        ));
    }

    return Ok(());
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    use super::load;
    use super::parse;
    use super::Error;
    use super::RepositoryCoordinates;
    use super::Settings;
    use tempfile::tempdir;

    const CERTIFICATE_ARN: &str =
        "arn:aws:acm:ap-southeast-1:123456789012:certificate/0f2c6f6e-1111-2222-3333-444455556666";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn file_does_not_exist() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let result = parse(&file_path);
        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::FileNotFound(_) => {}
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn file_wrong_format() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");

        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "- Not a mapping").unwrap();

        let result = parse(&file_path);
        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::ParsingError(_) => {}
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn missing_certificate_arn_is_fatal() {
        let result = load(None, env(&[]));
        assert_eq!(result.err().unwrap(), Error::MissingVariable("CERTIFICATE_ARN"));
    }

    #[test]
    fn blank_certificate_arn_is_fatal() {
        let result = load(None, env(&[("CERTIFICATE_ARN", "  ")]));
        assert_eq!(result.err().unwrap(), Error::MissingVariable("CERTIFICATE_ARN"));
    }

    #[test]
    fn malformed_certificate_arn() {
        let result = load(None, env(&[("CERTIFICATE_ARN", "not-an-arn")]));
        match result.err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn malformed_repository_owner() {
        let result = load(
            None,
            env(&[
                ("CERTIFICATE_ARN", CERTIFICATE_ARN),
                ("GITHUB_REPOSITORY_OWNER", "owner/with:*"),
            ]),
        );
        match result.err().unwrap() {
            Error::ValidationError(_) => {}
            _ => panic!("Expected `ValidationError` error"),
        }
    }

    #[test]
    fn applies_defaults() {
        let config = load(None, env(&[("CERTIFICATE_ARN", CERTIFICATE_ARN)])).unwrap();

        assert_eq!(config.environment.region, "ap-southeast-1");
        assert_eq!(config.environment.account, None);
        assert_eq!(config.repository, RepositoryCoordinates::default());
        assert_eq!(config.secrets.file, PathBuf::from("secrets/env.sops.yaml"));
        assert_eq!(config.secrets.sops_config, None);
    }

    #[test]
    fn cdk_variables_take_precedence() {
        let config = load(
            None,
            env(&[
                ("CERTIFICATE_ARN", CERTIFICATE_ARN),
                ("CDK_DEFAULT_ACCOUNT", "111111111111"),
                ("AWS_ACCOUNT_ID", "222222222222"),
                ("CDK_DEFAULT_REGION", "eu-west-1"),
                ("AWS_REGION", "us-east-1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.environment.account.as_deref(), Some("111111111111"));
        assert_eq!(config.environment.region, "eu-west-1");
    }

    #[test]
    fn empty_variables_fall_through() {
        let config = load(
            None,
            env(&[
                ("CERTIFICATE_ARN", CERTIFICATE_ARN),
                ("CDK_DEFAULT_ACCOUNT", ""),
                ("AWS_ACCOUNT_ID", "222222222222"),
                ("CDK_DEFAULT_REGION", ""),
                ("AWS_REGION", "eu-west-1"),
                ("GITHUB_REPOSITORY_OWNER", ""),
                ("GITHUB_REPOSITORY_NAME", ""),
                ("SOPS_SECRETS_FILE", ""),
                ("SOPS_CONFIG", ""),
            ]),
        )
        .unwrap();

        assert_eq!(config.environment.account.as_deref(), Some("222222222222"));
        assert_eq!(config.environment.region, "eu-west-1");
        assert_eq!(config.repository, RepositoryCoordinates::default());
        assert_eq!(config.secrets.file, PathBuf::from("secrets/env.sops.yaml"));
        assert_eq!(config.secrets.sops_config, None);
    }

    #[test]
    fn empty_region_everywhere_uses_the_default() {
        let config = load(
            None,
            env(&[
                ("CERTIFICATE_ARN", CERTIFICATE_ARN),
                ("CDK_DEFAULT_REGION", ""),
                ("AWS_REGION", ""),
            ]),
        )
        .unwrap();

        assert_eq!(config.environment.region, "ap-southeast-1");
    }

    #[test]
    fn environment_overrides_the_file() {
        let settings = Settings {
            region: Some(String::from("us-west-2")),
            certificate_arn: Some(String::from(CERTIFICATE_ARN)),
            repository: RepositoryCoordinates {
                owner: String::from("file-owner"),
                name: String::from("file-repo"),
            },
            ..Settings::default()
        };
        let config_contents = serde_yaml::to_string(&settings).unwrap();

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", config_contents).unwrap();

        let config = load(
            Some(&file_path),
            env(&[("GITHUB_REPOSITORY_NAME", "env-repo")]),
        )
        .unwrap();

        assert_eq!(config.environment.region, "us-west-2");
        assert_eq!(config.certificate_arn, CERTIFICATE_ARN);
        assert_eq!(config.repository.owner, "file-owner");
        assert_eq!(config.repository.name, "env-repo");
    }
}
