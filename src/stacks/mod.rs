//! The Book Management deployment topology.
//!
//! Every stack is a constructor that takes handles to the stacks it builds on and returns
//! its own template together with a handle to what it publishes. [`synthesize`] wires them
//! together in dependency order:
//!
//! ```text
//! Network ──┬── Key
//!           └── Database ── Platform ── Application
//! AccessRole (independent)
//! ```

use crate::app::{self, App};
use crate::config::Config;
use crate::secrets::SecretMap;
use crate::template::{self, Export};

pub mod access_role;
pub mod application;
pub mod database;
pub mod key;
pub mod network;
pub mod platform;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Template(#[from] template::Error),

    #[error(transparent)]
    Assembly(#[from] app::Error),
}

/// The fixed set of stacks, in deployment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackId {
    Network,
    Key,
    Database,
    Platform,
    Application,
    AccessRole,
}

impl StackId {
    pub const ALL: [StackId; 6] = [
        StackId::Network,
        StackId::Key,
        StackId::Database,
        StackId::Platform,
        StackId::Application,
        StackId::AccessRole,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StackId::Network => "BookManagementVpcStack",
            StackId::Key => "BookManagementKmsStack",
            StackId::Database => "BookManagementDatabaseStack",
            StackId::Platform => "BookManagementStack",
            StackId::Application => "BookManagementApplicationStack",
            StackId::AccessRole => "BookManagementGithubActionsRoleStack",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StackId::Network => "VPC infrastructure for Book Management API",
            StackId::Key => "KMS key for SOPS encryption of Book Management API secrets",
            StackId::Database => "Database infrastructure for Book Management API",
            StackId::Platform => "Application infrastructure for Book Management API",
            StackId::Application => "Containerized service for Book Management API",
            StackId::AccessRole => "GitHub Actions deployment role for Book Management API",
        }
    }
}

/// A security group published by one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRef {
    pub group_id: Export,
}

/// Builds every stack of the topology. `secrets` is resolved by the caller so that a
/// decryption failure stops the run before anything is declared.
pub fn synthesize(config: &Config, secrets: &SecretMap) -> Result<App, Error> {
    let mut app = App::new(config.environment.clone());

    let (network_stack, network) = network::build(StackId::Network)?;
    app.add_stack(network_stack)?;

    let (key_stack, key) = key::build(StackId::Key)?;
    app.add_stack(key_stack)?;
    tracing::debug!(export = %key.key_arn.name, "Secrets key available for sops");

    let (database_stack, database) = database::build(StackId::Database, &network)?;
    app.add_stack(database_stack)?;

    let (platform_stack, platform) =
        platform::build(StackId::Platform, &network, &config.certificate_arn)?;
    app.add_stack(platform_stack)?;
    tracing::debug!(
        cluster = %platform.cluster_arn.name,
        repository = %platform.repository_arn.name,
        listener = %platform.https_listener_arn.name,
        "Platform exports available"
    );

    let application_stack = application::build(
        StackId::Application,
        &network,
        &database,
        &platform,
        secrets,
    )?;
    app.add_stack(application_stack)?;

    let (access_role_stack, access_role) =
        access_role::build(StackId::AccessRole, &config.repository)?;
    app.add_stack(access_role_stack)?;
    tracing::debug!(export = %access_role.role_arn.name, "Deployment role available for CI");

    tracing::info!(stacks = app.stacks().len(), "Synthesized assembly");
    return Ok(app);
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::fixtures;
    use super::StackId;

    #[test]
    fn stacks_are_added_in_dependency_order() {
        let app = fixtures::app();
        let position = |id: StackId| app.position(id.name()).unwrap();

        assert!(position(StackId::Network) < position(StackId::Key));
        assert!(position(StackId::Network) < position(StackId::Database));
        assert!(position(StackId::Database) < position(StackId::Platform));
        assert!(position(StackId::Platform) < position(StackId::Application));

        let names: Vec<&str> = app.stacks().iter().map(|stack| stack.name.as_str()).collect();
        let expected: Vec<&str> = StackId::ALL.iter().map(StackId::name).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let app = fixtures::app();
        for (index, stack) in app.stacks().iter().enumerate() {
            for dependency in stack.dependencies() {
                assert!(app.position(dependency).unwrap() < index);
            }
        }
    }

    #[test]
    fn application_depends_on_network_database_and_platform() {
        let app = fixtures::app();
        let application = app.stack(StackId::Application.name()).unwrap();

        let dependencies: Vec<&str> = application.dependencies().collect();
        assert_eq!(
            dependencies,
            vec![
                StackId::Database.name(),
                StackId::Platform.name(),
                StackId::Network.name(),
            ]
        );
    }

    #[test]
    fn key_and_access_role_stand_alone() {
        let app = fixtures::app();
        for id in [StackId::Key, StackId::AccessRole, StackId::Network] {
            assert_eq!(app.stack(id.name()).unwrap().dependencies().count(), 0);
        }
    }

    #[test]
    fn descriptions_end_up_in_templates() {
        let app = fixtures::app();
        let template = fixtures::template(&app, StackId::Database.name());
        assert_eq!(
            template["Description"],
            json!("Database infrastructure for Book Management API")
        );
    }

    #[test]
    fn every_import_resolves_to_an_export_of_an_earlier_stack() {
        let app = fixtures::app();

        let mut exported = Vec::new();
        for stack in app.stacks() {
            let rendered = serde_json::to_string(&stack.template).unwrap();
            let mut rest = rendered.as_str();
            while let Some(start) = rest.find("\"Fn::ImportValue\":\"") {
                rest = &rest[start + "\"Fn::ImportValue\":\"".len()..];
                let end = rest.find('"').unwrap();
                assert!(
                    exported.contains(&rest[..end].to_string()),
                    "{} imports unknown export {}",
                    stack.name,
                    &rest[..end]
                );
                rest = &rest[end..];
            }

            for output in stack.template.outputs.values() {
                if let Some(export) = &output.export {
                    exported.push(export.name.clone());
                }
            }
        }
    }
}
