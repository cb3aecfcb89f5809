use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde::Serialize;

use crate::app::{App, Environment};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Unable to serialize {0}: {1}")]
    Serialization(String, String),
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    environment: &'a Environment,
    stacks: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    name: &'a str,
    description: &'a str,
    template: String,
    dependencies: Vec<&'a str>,
}

pub fn template_file_name(stack_name: &str) -> String {
    return format!("{}.template.json", stack_name);
}

/// Writes one template per stack plus `manifest.json` into `out_dir`. Templates carry resolved
/// secrets in plain text, so only their owner may read them.
pub fn write_assembly(out_dir: &Path, app: &App) -> Result<Vec<PathBuf>, Error> {
    if let Err(source) = fs::create_dir_all(out_dir) {
        return Err(Error::Io {
            path: out_dir.display().to_string(),
            source,
        });
    }

    let mut written = Vec::new();
    for stack in app.stacks() {
        let path = out_dir.join(template_file_name(&stack.name));
        write_private(&path, &render(&path, &stack.template)?)?;
        written.push(path);
    }

    let manifest = Manifest {
        environment: &app.environment,
        stacks: app
            .stacks()
            .iter()
            .map(|stack| ManifestEntry {
                name: &stack.name,
                description: stack.description(),
                template: template_file_name(&stack.name),
                dependencies: stack.dependencies().collect(),
            })
            .collect(),
    };
    let manifest_path = out_dir.join("manifest.json");
    write_json(&manifest_path, &manifest)?;
    written.push(manifest_path);

    tracing::info!(out_dir = %out_dir.display(), files = written.len(), "Wrote assembly");
    return Ok(written);
}

/// Writes stack outputs as a flat `{ "OutputKey": "OutputValue" }` document.
pub fn write_outputs(path: &Path, outputs: &BTreeMap<String, String>) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(source) = fs::create_dir_all(parent) {
            return Err(Error::Io {
                path: parent.display().to_string(),
                source,
            });
        }
    }

    return write_json(path, outputs);
}

fn render<T: Serialize>(path: &Path, value: &T) -> Result<String, Error> {
    return match serde_json::to_string_pretty(value) {
        Ok(contents) => Ok(contents),
        Err(error) => Err(Error::Serialization(
            path.display().to_string(),
            error.to_string(),
        )),
    };
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let file_contents = render(path, value)?;

    return match fs::write(path, file_contents) {
        Ok(_) => Ok(()),
        Err(source) => Err(Error::Io {
            path: path.display().to_string(),
            source,
        }),
    };
}

/// Writes `contents` to a file readable and writable by its owner only, tightening the
/// permissions of a file left behind by an earlier run as well.
fn write_private(path: &Path, contents: &str) -> Result<(), Error> {
    let io_error = |source| Error::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(io_error)?;
    #[cfg(unix)]
    {
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_error)?;
    }
    file.write_all(contents.as_bytes()).map_err(io_error)?;

    return Ok(());
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use serde_json::Value;
    use tempfile::tempdir;

    use super::{write_assembly, write_outputs};
    use crate::stacks::{fixtures, StackId};

    #[test]
    fn writes_a_template_per_stack_and_a_manifest() {
        let dir = tempdir().unwrap();
        let out_dir = dir.path().join("cdk.out");
        let app = fixtures::app();

        let written = write_assembly(&out_dir, &app).unwrap();
        assert_eq!(written.len(), StackId::ALL.len() + 1);

        let template: Value = serde_json::from_str(
            &fs::read_to_string(out_dir.join("BookManagementVpcStack.template.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(template["AWSTemplateFormatVersion"], "2010-09-09");

        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["environment"]["region"], "ap-southeast-1");

        let names: Vec<&str> = manifest["stacks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["name"].as_str().unwrap())
            .collect();
        let expected: Vec<&str> = StackId::ALL.iter().map(StackId::name).collect();
        assert_eq!(names, expected);
        assert_eq!(
            manifest["stacks"][2]["dependencies"],
            serde_json::json!(["BookManagementVpcStack"])
        );
    }

    #[cfg(unix)]
    #[test]
    fn templates_are_only_readable_by_their_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let out_dir = dir.path().join("cdk.out");
        fs::create_dir_all(&out_dir).unwrap();

        let application = out_dir.join("BookManagementApplicationStack.template.json");
        fs::write(&application, "{}").unwrap();
        fs::set_permissions(&application, fs::Permissions::from_mode(0o644)).unwrap();

        write_assembly(&out_dir, &fixtures::app()).unwrap();

        let mode = fs::metadata(&application).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(fs::read_to_string(&application).unwrap().contains("JWT_SECRET"));

        for id in StackId::ALL {
            let path = out_dir.join(format!("{}.template.json", id.name()));
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", id.name());
        }
    }

    #[test]
    fn writes_outputs_as_flat_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outputs").join("service.json");

        let mut outputs = BTreeMap::new();
        outputs.insert(
            String::from("ServiceURL"),
            String::from("https://alb.example.com"),
        );
        write_outputs(&path, &outputs).unwrap();

        let written: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, outputs);
    }
}
