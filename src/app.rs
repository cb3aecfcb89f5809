use serde::Serialize;

use crate::template::Stack;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack {stack} depends on {dependency}, which has not been added yet")]
    UnknownDependency { stack: String, dependency: String },

    #[error("Stack {0} has already been added")]
    DuplicateStack(String),
}

/// Where every stack of the assembly is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub account: Option<String>,
    pub region: String,
}

/// The cloud assembly: stacks in the order they have to be deployed in.
#[derive(Debug)]
pub struct App {
    pub environment: Environment,
    stacks: Vec<Stack>,
}

impl App {
    pub fn new(environment: Environment) -> Self {
        return Self {
            environment,
            stacks: Vec::new(),
        };
    }

    /// Appends `stack`. Every stack it imports from must already be part of the assembly,
    /// so insertion order is always a valid deployment order.
    pub fn add_stack(&mut self, stack: Stack) -> Result<(), Error> {
        if self.stack(&stack.name).is_some() {
            return Err(Error::DuplicateStack(stack.name));
        }

        for dependency in stack.dependencies() {
            if self.stack(dependency).is_none() {
                return Err(Error::UnknownDependency {
                    stack: stack.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }

        tracing::debug!(
            stack = %stack.name,
            resources = stack.template.resources.len(),
            "Added stack to assembly"
        );
        self.stacks.push(stack);
        return Ok(());
    }

    pub fn stacks(&self) -> &[Stack] {
        return &self.stacks;
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        return self.position(name).map(|index| &self.stacks[index]);
    }

    /// Deployment index of the named stack.
    pub fn position(&self, name: &str) -> Option<usize> {
        return self.stacks.iter().position(|stack| stack.name == name);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{App, Environment, Error};
    use crate::template::Stack;

    fn environment() -> Environment {
        Environment {
            account: None,
            region: String::from("ap-southeast-1"),
        }
    }

    #[test]
    fn rejects_stack_imported_before_its_producer() {
        let mut producer = Stack::new("Producer", "test");
        let export = producer.export("Id", json!("id"), "Id").unwrap();
        let mut consumer = Stack::new("Consumer", "test");
        consumer.import(&export);

        let mut app = App::new(environment());
        let result = app.add_stack(consumer);
        assert_eq!(
            result.err().unwrap(),
            Error::UnknownDependency {
                stack: String::from("Consumer"),
                dependency: String::from("Producer"),
            }
        );
        assert_eq!(app.stacks().len(), 0);
    }

    #[test]
    fn accepts_stacks_in_dependency_order() {
        let mut producer = Stack::new("Producer", "test");
        let export = producer.export("Id", json!("id"), "Id").unwrap();
        let mut consumer = Stack::new("Consumer", "test");
        consumer.import(&export);

        let mut app = App::new(environment());
        app.add_stack(producer).unwrap();
        app.add_stack(consumer).unwrap();

        assert_eq!(app.position("Producer"), Some(0));
        assert_eq!(app.position("Consumer"), Some(1));
    }

    #[test]
    fn rejects_duplicate_stack_names() {
        let mut app = App::new(environment());
        app.add_stack(Stack::new("Producer", "test")).unwrap();

        let result = app.add_stack(Stack::new("Producer", "again"));
        assert_eq!(result.err().unwrap(), Error::DuplicateStack(String::from("Producer")));
    }
}
