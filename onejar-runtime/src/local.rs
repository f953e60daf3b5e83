//! Local module runtime
//!
//! A small [`ModuleRuntime`] for the shipped `onejar-boot` binary. Components
//! are tar archives unpacked into the runtime storage; a component declaring
//! `Application-Id` and `Application-Exec` in its manifest provides a hosted
//! application, which runs as a child process.

use crate::boot::config_keys;
use crate::isolation::{self, STORAGE_ENV};
use crate::runtime::{
    split_locator, ApplicationResult, ComponentHandle, HostedApplication, ModuleRuntime, ResourceHandler,
    RuntimeContext, RuntimeError, RuntimeFactory,
};
use anyhow::{Context, Result};
use onejar_common::layout;
use onejar_common::manifest::Manifest;
use onejar_common::Properties;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

pub const SYMBOLIC_NAME_ATTRIBUTE: &str = "Component-SymbolicName";
const FALLBACK_NAME_ATTRIBUTE: &str = "Bundle-SymbolicName";
pub const APPLICATION_ID_ATTRIBUTE: &str = "Application-Id";
pub const APPLICATION_EXEC_ATTRIBUTE: &str = "Application-Exec";

const COMPONENTS_DIR: &str = "components";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Installed,
    Active,
    Resolved,
}

#[derive(Debug)]
struct LocalComponent {
    locator: String,
    name: String,
    dir: PathBuf,
    application: Option<(String, String)>,
    state: ComponentState,
}

#[derive(Default)]
struct RuntimeState {
    running: bool,
    stopped: bool,
    handlers: HashMap<String, Rc<dyn ResourceHandler>>,
    services: HashMap<String, Rc<dyn Any>>,
    components: Vec<LocalComponent>,
}

pub struct LocalRuntimeFactory;

impl RuntimeFactory for LocalRuntimeFactory {
    fn new_runtime(&self, config: Properties) -> Result<Box<dyn ModuleRuntime>> {
        Ok(Box::new(LocalRuntime::new(config)?))
    }
}

pub struct LocalRuntime {
    config: Properties,
    context: LocalContext,
}

impl LocalRuntime {
    pub fn new(config: Properties) -> Result<Self> {
        let storage = config
            .get(config_keys::STORAGE)
            .map(PathBuf::from)
            .with_context(|| format!("Runtime configuration lacks {}", config_keys::STORAGE))?;

        Ok(Self {
            config,
            context: LocalContext {
                storage,
                state: Rc::new(RefCell::new(RuntimeState::default())),
            },
        })
    }

    pub fn config(&self) -> &Properties {
        &self.config
    }

    /// A registered service, if any
    pub fn service(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.context.state.borrow().services.get(name).cloned()
    }

    pub fn component_state(&self, name: &str) -> Option<ComponentState> {
        self.context
            .state
            .borrow()
            .components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.state)
    }
}

impl ModuleRuntime for LocalRuntime {
    fn start(&mut self) -> Result<()> {
        let components = self.context.storage.join(COMPONENTS_DIR);

        let clean = self.config.get(config_keys::STORAGE_CLEAN) == Some(config_keys::STORAGE_CLEAN_ON_FIRST_INIT);
        if clean && components.exists() {
            std::fs::remove_dir_all(&components)
                .with_context(|| format!("Failed to clean {}", components.display()))?;
        }
        std::fs::create_dir_all(&components)?;

        let mut state = self.context.state.borrow_mut();
        state.running = true;
        state.stopped = false;
        tracing::debug!("Local runtime started in {}", self.context.storage.display());

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.context.state.borrow_mut();
        for component in &mut state.components {
            component.state = ComponentState::Resolved;
        }
        state.running = false;
        state.stopped = true;

        Ok(())
    }

    fn wait_for_stop(&mut self, _timeout: Option<Duration>) -> Result<bool> {
        let state = self.context.state.borrow();
        if state.running {
            // stopping is synchronous here, so nothing else could ever stop it
            anyhow::bail!("wait_for_stop called on a running runtime without a stop request");
        }
        Ok(true)
    }

    fn context(&self) -> &dyn RuntimeContext {
        &self.context
    }
}

struct LocalContext {
    storage: PathBuf,
    state: Rc<RefCell<RuntimeState>>,
}

impl LocalContext {
    fn handle(&self, index: usize, name: String) -> Box<dyn ComponentHandle> {
        Box::new(LocalComponentHandle {
            index,
            name,
            state: self.state.clone(),
        })
    }
}

impl RuntimeContext for LocalContext {
    fn install_component(&self, locator: &str) -> Result<Box<dyn ComponentHandle>> {
        if self.state.borrow().stopped {
            return Err(RuntimeError::NotRunning.into());
        }

        if let Some((index, component)) = self
            .state
            .borrow()
            .components
            .iter()
            .enumerate()
            .find(|(_, c)| c.locator == locator)
        {
            tracing::debug!("{} already installed", locator);
            return Ok(self.handle(index, component.name.clone()));
        }

        let (scheme, path) = split_locator(locator)?;
        let handler = self
            .state
            .borrow()
            .handlers
            .get(scheme)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownScheme(scheme.to_string()))?;

        let index = self.state.borrow().components.len();
        let dir = self.storage.join(COMPONENTS_DIR).join(index.to_string());

        let reader = handler.open(path).with_context(|| format!("Failed to open {}", locator))?;
        tar::Archive::new(reader)
            .unpack(&dir)
            .with_context(|| format!("Failed to unpack {}", locator))?;

        let invalid = |reason: String| RuntimeError::InvalidComponent {
            locator: locator.to_string(),
            reason,
        };

        let manifest_path = dir.join(layout::MANIFEST_PATH);
        let text = std::fs::read_to_string(&manifest_path)
            .map_err(|e| invalid(format!("no readable manifest: {}", e)))?;
        let manifest = Manifest::parse(&text)?;

        let name = manifest
            .main_attribute(SYMBOLIC_NAME_ATTRIBUTE)
            .or_else(|| manifest.main_attribute(FALLBACK_NAME_ATTRIBUTE))
            .map(|n| n.split(';').next().unwrap_or(n).trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid(format!("missing {}", SYMBOLIC_NAME_ATTRIBUTE)))?;

        let application = match (
            manifest.main_attribute(APPLICATION_ID_ATTRIBUTE),
            manifest.main_attribute(APPLICATION_EXEC_ATTRIBUTE),
        ) {
            (Some(id), Some(exec)) => Some((id.to_string(), exec.to_string())),
            (None, None) => None,
            _ => {
                return Err(invalid(format!(
                    "{} and {} must be declared together",
                    APPLICATION_ID_ATTRIBUTE, APPLICATION_EXEC_ATTRIBUTE
                ))
                .into())
            }
        };

        self.state.borrow_mut().components.push(LocalComponent {
            locator: locator.to_string(),
            name: name.clone(),
            dir,
            application,
            state: ComponentState::Installed,
        });

        Ok(self.handle(index, name))
    }

    fn register_resource_handler(&self, scheme: &str, handler: Rc<dyn ResourceHandler>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.handlers.contains_key(scheme) {
            return Err(RuntimeError::SchemeInUse(scheme.to_string()).into());
        }
        state.handlers.insert(scheme.to_string(), handler);
        Ok(())
    }

    fn register_service(&self, name: &str, service: Rc<dyn Any>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.services.contains_key(name) {
            return Err(RuntimeError::ServiceInUse(name.to_string()).into());
        }
        state.services.insert(name.to_string(), service);
        Ok(())
    }

    fn application(&self, id: &str) -> Result<Box<dyn HostedApplication>> {
        let state = self.state.borrow();
        let (component, exec) = state
            .components
            .iter()
            .filter(|c| c.state == ComponentState::Active)
            .find_map(|c| match &c.application {
                Some((app_id, exec)) if app_id == id => Some((c, exec)),
                _ => None,
            })
            .ok_or_else(|| RuntimeError::UnknownApplication(id.to_string()))?;

        let program = exec
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .fold(component.dir.clone(), |p, s| p.join(s));

        Ok(Box::new(LocalApplication {
            program,
            storage: self.storage.clone(),
        }))
    }

    fn components(&self) -> Vec<String> {
        self.state.borrow().components.iter().map(|c| c.name.clone()).collect()
    }
}

struct LocalComponentHandle {
    index: usize,
    name: String,
    state: Rc<RefCell<RuntimeState>>,
}

impl ComponentHandle for LocalComponentHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.running {
            return Err(RuntimeError::NotRunning.into());
        }
        let component = state
            .components
            .get_mut(self.index)
            .ok_or(RuntimeError::NotRunning)?;
        component.state = ComponentState::Active;
        tracing::debug!("Started {}", self.name);
        Ok(())
    }
}

struct LocalApplication {
    program: PathBuf,
    storage: PathBuf,
}

impl LocalApplication {
    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        isolation::clear_inherited_state(&mut command);
        command.env(STORAGE_ENV, &self.storage);
        command
    }
}

impl HostedApplication for LocalApplication {
    fn run(&mut self, args: &[String]) -> Result<ApplicationResult> {
        let status = self
            .command(args)
            .status()
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        Ok(ApplicationResult::Integer(isolation::exit_code(status)))
    }
}
