use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Logical id {id} is declared twice in stack {stack}")]
    DuplicateLogicalId { stack: String, id: String },

    #[error("Output {id} is declared twice in stack {stack}")]
    DuplicateOutputId { stack: String, id: String },
}

/// What CloudFormation does with a resource once it leaves the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalPolicy {
    Delete,
    Retain,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(rename = "Properties")]
    pub properties: Value,

    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<RemovalPolicy>,

    #[serde(
        rename = "UpdateReplacePolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub update_replace_policy: Option<RemovalPolicy>,
}

impl Resource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        return Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        };
    }

    /// Applies `policy` both on stack deletion and on replacement.
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        return self;
    }

    pub fn depends_on(mut self, logical_id: &str) -> Self {
        self.depends_on.push(logical_id.to_string());
        return self;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportName {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "Value")]
    pub value: Value,

    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Export", default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,

    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,

    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: &str) -> Self {
        return Self {
            format_version: String::from("2010-09-09"),
            description: Some(description.to_string()),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        };
    }
}

/// A value published by one stack and importable by the stacks after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub stack: String,
    pub name: String,
}

/// A stack under construction: its template plus the stacks it imports from.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub name: String,
    pub template: Template,
    dependencies: BTreeSet<String>,
}

impl Stack {
    pub fn new(name: &str, description: &str) -> Self {
        return Self {
            name: name.to_string(),
            template: Template::new(description),
            dependencies: BTreeSet::new(),
        };
    }

    pub fn description(&self) -> &str {
        return self.template.description.as_deref().unwrap_or_default();
    }

    /// Declares a resource and returns a `Ref` to it.
    pub fn add_resource(&mut self, logical_id: &str, resource: Resource) -> Result<Value, Error> {
        if self.template.resources.contains_key(logical_id) {
            return Err(Error::DuplicateLogicalId {
                stack: self.name.clone(),
                id: logical_id.to_string(),
            });
        }

        self.template
            .resources
            .insert(logical_id.to_string(), resource);
        return Ok(reference(logical_id));
    }

    pub fn add_output(&mut self, id: &str, value: Value, description: &str) -> Result<(), Error> {
        return self.insert_output(
            id,
            Output {
                value,
                description: Some(description.to_string()),
                export: None,
            },
        );
    }

    /// Publishes `value` under the export name `<stack>:<id>`.
    pub fn export(&mut self, id: &str, value: Value, description: &str) -> Result<Export, Error> {
        let export_name = format!("{}:{}", self.name, id);
        return self.export_as(id, &export_name, value, description);
    }

    pub fn export_as(
        &mut self,
        id: &str,
        export_name: &str,
        value: Value,
        description: &str,
    ) -> Result<Export, Error> {
        self.insert_output(
            id,
            Output {
                value,
                description: Some(description.to_string()),
                export: Some(ExportName {
                    name: export_name.to_string(),
                }),
            },
        )?;

        return Ok(Export {
            stack: self.name.clone(),
            name: export_name.to_string(),
        });
    }

    fn insert_output(&mut self, id: &str, output: Output) -> Result<(), Error> {
        if self.template.outputs.contains_key(id) {
            return Err(Error::DuplicateOutputId {
                stack: self.name.clone(),
                id: id.to_string(),
            });
        }

        self.template.outputs.insert(id.to_string(), output);
        return Ok(());
    }

    /// Resolves `export` inside this stack, recording the producing stack as a dependency.
    pub fn import(&mut self, export: &Export) -> Value {
        if export.stack != self.name {
            self.dependencies.insert(export.stack.clone());
        }

        return import_value(&export.name);
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        return self.dependencies.iter().map(String::as_str);
    }
}

pub fn reference(logical_id: &str) -> Value {
    return json!({ "Ref": logical_id });
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    return json!({ "Fn::GetAtt": [logical_id, attribute] });
}

pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    return json!({ "Fn::Join": [delimiter, parts] });
}

pub fn sub(expression: &str) -> Value {
    return json!({ "Fn::Sub": expression });
}

pub fn import_value(export_name: &str) -> Value {
    return json!({ "Fn::ImportValue": export_name });
}

pub fn availability_zone(index: usize) -> Value {
    return json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] });
}

/// `arn:<partition>:iam::aws:policy/<name>`
pub fn managed_policy_arn(name: &str) -> Value {
    return sub(&format!("arn:${{AWS::Partition}}:iam::aws:policy/{}", name));
}
