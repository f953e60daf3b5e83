//! onejar-boot - bootstrap loader for packaged applications
//!
//! This is the entry point embedded in every assembled executable. It:
//! 1. Enumerates the classpath (its own payload plus ONEJAR_CLASSPATH)
//! 2. Re-executes itself as the isolated stage
//! 3. Boots the module runtime, runs the hosted application
//! 4. Exits with the application's exit code
//!
//! Every process argument belongs to the hosted application. Loader switches
//! come from the environment: `ONEJAR_IN_PROCESS` boots without relaunching,
//! `ONEJAR_BOOT_VERBOSE` turns on debug diagnostics.

use anyhow::Result;
use std::ffi::OsString;
use tracing::{debug, error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use onejar_runtime::boot::{BootLoader, BootOptions, BootState, FAILURE_EXIT_CODE};
use onejar_runtime::isolation::{self, BootSwitches, ContextBuilder, IsolatedContext};
use onejar_runtime::local::LocalRuntimeFactory;
use onejar_runtime::resources::Classpath;

fn main() {
    let switches = BootSwitches::from_env();
    init_logging(switches.verbose);

    let args = isolation::application_args(std::env::args_os());
    let code = match run(switches, args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:?}", e);
            FAILURE_EXIT_CODE
        }
    };

    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::try_from_env("ONEJAR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(switches: BootSwitches, args: Vec<OsString>) -> Result<i32> {
    if let Some(context) = IsolatedContext::from_env()? {
        return boot(context, &args);
    }

    let context = ContextBuilder::from_environment()?.build()?;

    if switches.in_process {
        return boot(context, &args);
    }

    debug!("Boot state {:?}: relaunching isolated", BootState::Unisolated);
    isolation::forward_termination();

    context.relaunch(&args)
}

fn boot(context: IsolatedContext, args: &[OsString]) -> Result<i32> {
    let classpath = Classpath::from_paths(context.classpath())?;

    let factory = LocalRuntimeFactory;
    let options = BootOptions {
        args: args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
        signal_cleanup: true,
        temp_root: None,
    };

    Ok(BootLoader::new(&factory, classpath, options).run())
}
