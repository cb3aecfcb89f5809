use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

use serde_yaml::Value;

pub const DEFAULT_SOPS_BIN: &str = "sops";

/// Key sops adds to an encrypted document; absent from decrypted output but tolerated.
const SOPS_METADATA_KEY: &str = "sops";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Unable to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Decryption failed ({status}): {stderr}")]
    DecryptionFailed { status: String, stderr: String },

    #[error("Decrypted secrets are not valid YAML: {0}")]
    ParsingError(String),

    #[error("Decrypted secrets have to be a mapping of names to values")]
    NotAMapping,

    #[error("Decryption produced no secrets")]
    Empty,

    #[error("Secret {0} has a nested value, only scalars can be injected")]
    NestedValue(String),
}

/// Turns an encrypted file into its plaintext.
pub trait Decrypt {
    fn decrypt(&self, file: &Path, config: Option<&Path>) -> Result<String, Error>;
}

/// The `sops` command line tool.
#[derive(Debug, Clone)]
pub struct Sops {
    program: String,
}

impl Sops {
    pub fn new(program: &str) -> Self {
        return Self {
            program: program.to_string(),
        };
    }
}

impl Default for Sops {
    fn default() -> Self {
        return Self::new(DEFAULT_SOPS_BIN);
    }
}

impl Decrypt for Sops {
    fn decrypt(&self, file: &Path, config: Option<&Path>) -> Result<String, Error> {
        let mut command = Command::new(&self.program);
        if let Some(config) = config {
            command.arg("--config").arg(config);
        }
        command.arg("--decrypt").arg(file);

        tracing::debug!(program = %self.program, file = %file.display(), "Decrypting secrets");
        let output = match command.output() {
            Ok(output) => output,
            Err(source) => {
                return Err(Error::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
        };

        if !output.status.success() {
            return Err(Error::DecryptionFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }
}

/// Decrypted environment variables. Values never show up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretMap(BTreeMap<String, String>);

impl SecretMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        return self.0.get(key).map(String::as_str);
    }

    pub fn len(&self) -> usize {
        return self.0.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    /// Entries ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        return self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()));
    }
}

impl FromIterator<(String, String)> for SecretMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        return Self(iter.into_iter().collect());
    }
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.debug_set().entries(self.0.keys()).finish();
    }
}

/// Decrypts `file` and flattens it into a [`SecretMap`]. Any failure is returned as is:
/// a deployment must never proceed with a partial or empty set of secrets.
pub fn resolve<D: Decrypt>(
    decryptor: &D,
    file: &Path,
    config: Option<&Path>,
) -> Result<SecretMap, Error> {
    if !file.exists() {
        return Err(Error::FileNotFound(file.display().to_string()));
    }
    if let Some(config) = config {
        if !config.exists() {
            return Err(Error::FileNotFound(config.display().to_string()));
        }
    }

    let plaintext = decryptor.decrypt(file, config)?;
    let secrets = parse(&plaintext)?;

    tracing::info!(file = %file.display(), count = secrets.len(), "Resolved secrets");
    return Ok(secrets);
}

fn parse(plaintext: &str) -> Result<SecretMap, Error> {
    if plaintext.trim().is_empty() {
        return Err(Error::Empty);
    }

    let document: Value = match serde_yaml::from_str(plaintext) {
        Ok(document) => document,
        Err(error) => return Err(Error::ParsingError(error.to_string())),
    };

    let mapping = match document {
        Value::Mapping(mapping) => mapping,
        Value::Null => return Err(Error::Empty),
        _ => return Err(Error::NotAMapping),
    };

    let mut secrets = BTreeMap::new();
    for (key, value) in mapping {
        let key = match scalar(&key) {
            Some(key) => key,
            None => return Err(Error::NotAMapping),
        };
        if key == SOPS_METADATA_KEY {
            continue;
        }

        let value = match scalar(&value) {
            Some(value) => value,
            None => return Err(Error::NestedValue(key)),
        };
        secrets.insert(key, value);
    }
    if secrets.is_empty() {
        return Err(Error::Empty);
    }

    return Ok(SecretMap(secrets));
}

fn scalar(value: &Value) -> Option<String> {
    return match value {
        Value::String(string) => Some(string.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(boolean) => Some(boolean.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    };
}
