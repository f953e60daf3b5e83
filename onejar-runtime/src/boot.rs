//! Bootstrap loader
//!
//! Drives one boot from the isolated stage to process exit:
//!
//! 1. Load `launcher.properties` and prepare the runtime configuration
//! 2. Create and start the module runtime
//! 3. Install every component, then start them level by level
//! 4. Run the hosted application and map its result to an exit code
//! 5. Stop the runtime and wait for it, whatever happened before
//!
//! Everything runs on the calling thread; runtime calls block.

use crate::resources::{Classpath, EmbeddedResourceHandler};
use crate::runtime::{ApplicationResult, ComponentHandle, ModuleRuntime, RuntimeContext, RuntimeFactory};
use crate::storage::{self, TemporaryStorage};
use anyhow::{Context, Result};
use onejar_common::layout::{self, keys};
use onejar_common::manifest::Manifest;
use onejar_common::{ComponentSpec, Properties, StartupPlan};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Service name the application launcher is registered under
pub const APPLICATION_LAUNCHER_SERVICE: &str = "org.eclipse.osgi.service.runnable.ApplicationLauncher";

/// Runtime configuration keys set by the loader
pub mod config_keys {
    pub const STORAGE: &str = "org.osgi.framework.storage";
    pub const STORAGE_CLEAN: &str = "org.osgi.framework.storage.clean";
    pub const STORAGE_CLEAN_ON_FIRST_INIT: &str = "onFirstInit";
    pub const BOOT_DELEGATION_DEFAULT: &str = "osgi.compatibility.bootdelegation.default";
}

/// Exit code when the hosted application or the boot itself fails
pub const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Unisolated,
    Isolated,
    RuntimeStarting,
    RuntimeRunning,
    Installing,
    Starting,
    ApplicationRunning,
    Stopped,
}

/// A planned component and the runtime's handle for it
pub struct InstalledComponent {
    pub spec: ComponentSpec,
    pub handle: Box<dyn ComponentHandle>,
}

/// Runs the hosted application registered for an id
#[derive(Debug, Clone)]
pub struct ApplicationLauncher {
    application_id: String,
}

impl ApplicationLauncher {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Look up the application and block until it returns
    pub fn launch(&self, context: &dyn RuntimeContext, args: &[String]) -> Result<ApplicationResult> {
        let mut application = context.application(&self.application_id)?;
        application
            .run(args)
            .with_context(|| format!("Application {} failed", self.application_id))
    }
}

/// Map an application outcome to the process exit code
pub fn exit_code_for(result: &Result<ApplicationResult>) -> i32 {
    match result {
        Ok(ApplicationResult::Integer(code)) => *code,
        Ok(_) => 0,
        Err(_) => FAILURE_EXIT_CODE,
    }
}

#[derive(Debug, Clone, Default)]
pub struct BootOptions {
    /// Arguments handed to the hosted application
    pub args: Vec<String>,

    /// Remove the temporary storage on termination signals
    pub signal_cleanup: bool,

    /// Parent of the temporary storage, the system temp dir when `None`
    pub temp_root: Option<PathBuf>,
}

pub struct BootLoader<'a> {
    factory: &'a dyn RuntimeFactory,
    classpath: Rc<Classpath>,
    options: BootOptions,
    state: BootState,
}

impl<'a> BootLoader<'a> {
    /// A loader running inside the isolated stage
    pub fn new(factory: &'a dyn RuntimeFactory, classpath: Classpath, options: BootOptions) -> Self {
        Self {
            factory,
            classpath: Rc::new(classpath),
            options,
            state: BootState::Isolated,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Boot, run the hosted application and tear down. Never fails; every
    /// failure, panics included, is logged and becomes a nonzero exit code.
    pub fn run(&mut self) -> i32 {
        let mut storage = None;
        let mut runtime = None;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.boot(&mut storage, &mut runtime)));
        let code = match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                error!("Boot failed: {:?}", e);
                FAILURE_EXIT_CODE
            }
            Err(payload) => {
                error!("Boot panicked: {}", panic_message(payload.as_ref()));
                FAILURE_EXIT_CODE
            }
        };

        if let Some(runtime) = runtime {
            let stopped = panic::catch_unwind(AssertUnwindSafe(|| self.shutdown(runtime)));
            if let Err(payload) = stopped {
                error!("Shutdown panicked: {}", panic_message(payload.as_ref()));
            }
        }
        self.transition(BootState::Stopped);

        // released only after the runtime halted
        drop(storage);

        code
    }

    fn transition(&mut self, next: BootState) {
        debug!("Boot state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn boot(
        &mut self,
        storage: &mut Option<TemporaryStorage>,
        runtime: &mut Option<Box<dyn ModuleRuntime>>,
    ) -> Result<i32> {
        self.transition(BootState::RuntimeStarting);

        let props = Properties::parse(
            &self
                .classpath
                .read_to_string(layout::LAUNCHER_PROPERTIES)
                .with_context(|| format!("Failed to read {}", layout::LAUNCHER_PROPERTIES))?,
        );
        let plan = StartupPlan::from_properties(&props)?;
        let application = plan
            .application
            .clone()
            .context("Startup properties name no application")?;

        self.check_manifest();

        let (system, mut config) = storage::partition_properties(&props);
        storage::export_system_properties(&system);

        let temporary = match &self.options.temp_root {
            Some(root) => TemporaryStorage::create_in(root)?,
            None => TemporaryStorage::create()?,
        };
        if self.options.signal_cleanup {
            if let Err(e) = storage::install_signal_cleanup(temporary.path()) {
                warn!("{:#}", e);
            }
        }
        let storage_path = storage.insert(temporary).path().to_path_buf();

        config.insert(config_keys::STORAGE_CLEAN, config_keys::STORAGE_CLEAN_ON_FIRST_INIT);
        config.insert(config_keys::BOOT_DELEGATION_DEFAULT, "true");
        config.insert(keys::APPLICATION, application.as_str());
        config.insert(keys::DEFAULT_START_LEVEL, plan.default_start_level.to_string());
        config.insert(config_keys::STORAGE, storage_path.display().to_string());

        for rel in &plan.configuration_copy {
            let source = format!("{}/{}", layout::CONFIGURATION_COPY_DIR, rel);
            let dest = rel.split('/').fold(storage_path.clone(), |p, s| p.join(s));
            self.classpath
                .copy_to(&source, &dest)
                .with_context(|| format!("Failed to copy configuration file {}", source))?;
            debug!("Copied {} into storage", rel);
        }

        let runtime = runtime.insert(self.factory.new_runtime(config)?);
        runtime.start().context("Failed to start the module runtime")?;
        self.transition(BootState::RuntimeRunning);

        runtime.context().register_resource_handler(
            layout::EMBEDDED_SCHEME,
            Rc::new(EmbeddedResourceHandler::new(self.classpath.clone())),
        )?;

        self.transition(BootState::Installing);
        let installed = install_components(runtime.context(), &plan.components)?;

        self.transition(BootState::Starting);
        start_components(&installed, plan.default_start_level)?;

        self.transition(BootState::ApplicationRunning);
        let launcher = Rc::new(ApplicationLauncher::new(application));
        runtime
            .context()
            .register_service(APPLICATION_LAUNCHER_SERVICE, launcher.clone())?;

        info!("Launching {}", launcher.application_id());
        let result = launcher.launch(runtime.context(), &self.options.args);
        match &result {
            Ok(value) => debug!("Application returned {:?}", value),
            Err(e) => error!("{:?}", e),
        }

        Ok(exit_code_for(&result))
    }

    fn check_manifest(&self) {
        let text = match self.classpath.read_to_string(layout::MANIFEST_PATH) {
            Ok(text) => text,
            Err(e) => {
                debug!("No packaged manifest: {}", e);
                return;
            }
        };

        match Manifest::parse(&text) {
            Ok(manifest) if manifest.entry_point() == Some(layout::BOOT_ENTRY) => {}
            Ok(manifest) => warn!(
                "Packaged manifest names entry point {:?}, expected {}",
                manifest.entry_point(),
                layout::BOOT_ENTRY
            ),
            Err(e) => warn!("Unreadable packaged manifest: {}", e),
        }
    }

    fn shutdown(&mut self, mut runtime: Box<dyn ModuleRuntime>) {
        if let Err(e) = runtime.stop() {
            error!("Failed to stop the module runtime: {:?}", e);
            return;
        }

        match runtime.wait_for_stop(None) {
            Ok(true) => debug!("Module runtime halted"),
            Ok(false) => warn!("Module runtime did not report halting"),
            Err(e) => error!("Waiting for the module runtime failed: {:?}", e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Install every planned component in plan order
pub fn install_components(
    context: &dyn RuntimeContext,
    specs: &[ComponentSpec],
) -> Result<Vec<InstalledComponent>> {
    let mut installed = Vec::with_capacity(specs.len());

    for spec in specs {
        let locator = format!("{}:{}", layout::EMBEDDED_SCHEME, spec.rel_path);
        let handle = context
            .install_component(&locator)
            .with_context(|| format!("Failed to install {}", spec.rel_path))?;
        debug!("Installed {} as {}", spec.rel_path, handle.name());

        installed.push(InstalledComponent {
            spec: spec.clone(),
            handle,
        });
    }

    Ok(installed)
}

/// Start autostart components in ascending start level up to `max_level`,
/// keeping plan order within a level. The first failure aborts.
pub fn start_components(installed: &[InstalledComponent], max_level: u32) -> Result<()> {
    for component in installed {
        if component.spec.is_autostart() && component.spec.level() > max_level {
            warn!(
                "{} has start level {} above {} and will never be started",
                component.spec.rel_path,
                component.spec.level(),
                max_level
            );
        }
    }

    let levels: BTreeSet<u32> = installed
        .iter()
        .filter(|c| c.spec.is_autostart() && c.spec.level() <= max_level)
        .map(|c| c.spec.level())
        .collect();

    for level in levels {
        for component in installed
            .iter()
            .filter(|c| c.spec.is_autostart() && c.spec.level() == level)
        {
            debug!("Starting {} at level {}", component.spec.rel_path, level);
            component
                .handle
                .start()
                .with_context(|| format!("Failed to start {}", component.spec.rel_path))?;
        }
    }

    Ok(())
}
