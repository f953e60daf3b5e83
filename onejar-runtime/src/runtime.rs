//! Module runtime contract
//!
//! The bootstrap loader drives a module runtime it does not implement. The
//! runtime is handed in as a [`RuntimeFactory`]; every call is synchronous and
//! blocks until it completed or failed.

use onejar_common::Properties;
use std::any::Any;
use std::io::{self, Read};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by runtime implementations
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No resource handler registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("Invalid component locator '{0}', expected <scheme>:<path>")]
    InvalidLocator(String),

    #[error("Resource handler for scheme '{0}' is already registered")]
    SchemeInUse(String),

    #[error("Service '{0}' is already registered")]
    ServiceInUse(String),

    #[error("No active component provides application '{0}'")]
    UnknownApplication(String),

    #[error("Invalid component {locator}: {reason}")]
    InvalidComponent { locator: String, reason: String },

    #[error("Runtime is not running")]
    NotRunning,
}

/// Resolves paths of a URL-like scheme to readable content
pub trait ResourceHandler {
    /// Open `path`; a missing resource is an error of kind `NotFound`
    fn open(&self, path: &str) -> io::Result<Box<dyn Read>>;
}

/// Result of a hosted application run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationResult {
    /// An explicit exit status
    Integer(i32),
    /// Any other returned object, described as text
    Value(String),
    /// Nothing returned
    Unit,
}

/// The entry point of a hosted application
pub trait HostedApplication {
    fn run(&mut self, args: &[String]) -> anyhow::Result<ApplicationResult>;
}

/// A component installed into the runtime
pub trait ComponentHandle {
    /// Symbolic name, for diagnostics
    fn name(&self) -> String;

    fn start(&self) -> anyhow::Result<()>;
}

/// Registration and lookup facilities of a running runtime
pub trait RuntimeContext {
    /// Install the component at `locator` (`<scheme>:<path>`)
    fn install_component(&self, locator: &str) -> anyhow::Result<Box<dyn ComponentHandle>>;

    fn register_resource_handler(&self, scheme: &str, handler: Rc<dyn ResourceHandler>) -> anyhow::Result<()>;

    /// Make `service` discoverable under `name`
    fn register_service(&self, name: &str, service: Rc<dyn Any>) -> anyhow::Result<()>;

    /// Look up the hosted application registered for `id`
    fn application(&self, id: &str) -> anyhow::Result<Box<dyn HostedApplication>>;

    /// Names of the installed components, in installation order
    fn components(&self) -> Vec<String>;
}

pub trait ModuleRuntime {
    fn start(&mut self) -> anyhow::Result<()>;

    /// Request the runtime to stop; returns before it has halted
    fn stop(&mut self) -> anyhow::Result<()>;

    /// Block until the runtime halted or `timeout` elapsed; `None` waits
    /// without bound. Returns whether the runtime halted.
    fn wait_for_stop(&mut self, timeout: Option<Duration>) -> anyhow::Result<bool>;

    fn context(&self) -> &dyn RuntimeContext;
}

/// Creates a runtime from its configuration
pub trait RuntimeFactory {
    fn new_runtime(&self, config: Properties) -> anyhow::Result<Box<dyn ModuleRuntime>>;
}

/// Split a `<scheme>:<path>` locator
pub fn split_locator(locator: &str) -> Result<(&str, &str), RuntimeError> {
    match locator.split_once(':') {
        Some((scheme, path)) if !scheme.is_empty() => Ok((scheme, path)),
        _ => Err(RuntimeError::InvalidLocator(locator.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_locator() {
        assert_eq!(split_locator("embedded:plugins/a.jar").unwrap(), ("embedded", "plugins/a.jar"));
        assert_eq!(split_locator("embedded:/a:b").unwrap(), ("embedded", "/a:b"));
        assert!(split_locator("plugins/a.jar").is_err());
        assert!(split_locator(":a").is_err());
    }
}
