//! onejar - merge component artifacts into one self-booting executable
//!
//! Usage:
//!   onejar build [ARTIFACTS]...   Package artifacts per onejar.toml and flags
//!   onejar inspect <file>         Show and verify an assembled executable
//!   onejar init                   Create a template onejar.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onejar_cli::packager::{self, Packager, PackagerOptions};
use onejar_common::config::{self, OnejarConfig};
use onejar_common::payload;
use onejar_common::StartupPlan;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "onejar")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "onejar - package modular applications into one executable")]
struct Cli {
    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    silent: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge input artifacts into an output tree and optionally an executable
    Build {
        /// Input artifacts (directories or tar archives), added after onejar.toml inputs
        artifacts: Vec<PathBuf>,

        /// Path to onejar.toml (default: ./onejar.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output tree
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Assemble a single executable at this path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Tar archive with extra bootstrap resources
        #[arg(long)]
        launcher: Option<PathBuf>,

        /// Path to a pre-built onejar-boot binary
        #[arg(long)]
        boot: Option<PathBuf>,

        /// Hosted application id (overrides eclipse.application)
        #[arg(long)]
        application: Option<String>,

        /// Highest start level started at boot
        #[arg(long)]
        default_start_level: Option<u32>,
    },

    /// Show the metadata and startup plan of an assembled executable
    Inspect {
        /// Path to the executable
        file: PathBuf,
    },

    /// Create a template onejar.toml in the current directory
    Init {
        /// Hosted application id to put in the template
        #[arg(long, default_value = "org.example.application")]
        application: String,
    },
}

// Console helper for output control
struct Console {
    silent: bool,
}

impl Console {
    fn new(silent: bool) -> Self {
        Self { silent }
    }

    fn log(&self, msg: impl std::fmt::Display) {
        if !self.silent {
            println!("{}", msg);
        }
    }

    fn success(&self, msg: impl std::fmt::Display) {
        if !self.silent {
            println!("✅ {}", msg);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.silent, cli.verbose);
    let console = Console::new(cli.silent);

    match cli.command {
        Commands::Build {
            artifacts,
            config,
            output_dir,
            output,
            launcher,
            boot,
            application,
            default_start_level,
        } => cmd_build(
            BuildArgs {
                artifacts,
                config,
                output_dir,
                output,
                launcher,
                boot,
                application,
                default_start_level,
            },
            &console,
        ),
        Commands::Inspect { file } => cmd_inspect(&file, &console),
        Commands::Init { application } => cmd_init(&application, &console),
    }
}

fn init_logging(silent: bool, verbose: bool) {
    let default_level = if silent {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_env("ONEJAR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

struct BuildArgs {
    artifacts: Vec<PathBuf>,
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    launcher: Option<PathBuf>,
    boot: Option<PathBuf>,
    application: Option<String>,
    default_start_level: Option<u32>,
}

/// Command-line artifacts first, then `onejar.toml` inputs; the first one
/// is the primary artifact
fn collect_inputs(cli: Vec<PathBuf>, configured: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut inputs = cli;
    inputs.extend(configured);
    inputs
}

fn cmd_build(args: BuildArgs, console: &Console) -> Result<()> {
    let (config, base_dir) = load_config(args.config.as_deref())?;
    config.validate(&base_dir)?;

    let inputs = collect_inputs(args.artifacts, config.input_paths(&base_dir));

    let output_dir = args.output_dir.unwrap_or_else(|| config.output_dir(&base_dir));

    let mut options = PackagerOptions::new(inputs, output_dir.clone());
    options.launcher = args.launcher.or_else(|| config.launcher_path(&base_dir));
    options.application = args.application.or(config.package.application.clone());
    options.default_start_level = args.default_start_level.or(config.package.default_start_level);
    options.passthrough = config.configuration.passthrough.clone();

    console.log(format!("📦 Packaging {} artifact(s) into {}", options.inputs.len(), output_dir.display()));

    let report = Packager::new(options).run()?;

    console.log(format!(
        "   Components: {} ({} copied, {} reused, {} skipped)",
        report.plan.components.len(),
        report.copied,
        report.reused,
        report.skipped
    ));
    console.log(format!("   Runtime files: {}", report.unpacked));
    console.log(format!("   Default start level: {}", report.plan.default_start_level));

    if let Some(output) = args.output.or_else(|| config.output_path(&base_dir)) {
        let boot_override = args.boot.or_else(|| config.boot_path(&base_dir));
        let boot = packager::locate_boot_binary(boot_override.as_deref())?;
        let application = report.plan.application.as_deref().unwrap_or_default();

        console.log(format!("🔨 Assembling {}", output.display()));
        let metadata = packager::assemble(&output_dir, &output, &boot, application)?;
        console.log(format!("   Payload: {} bytes, SHA256 {}", metadata.payload_size, metadata.payload_checksum));
        console.success(format!("Created {}", output.display()));
    } else {
        console.success(format!("Output tree ready in {}", output_dir.display()));
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<(OnejarConfig, PathBuf)> {
    match path {
        Some(path) => {
            let base = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Ok((OnejarConfig::from_file(path)?, base))
        }
        None => {
            let base = std::env::current_dir()?;
            let config = OnejarConfig::from_current_dir()?.unwrap_or_default();
            Ok((config, base))
        }
    }
}

fn cmd_inspect(file: &Path, console: &Console) -> Result<()> {
    let info = payload::read_payload_info(file).context("Failed to read executable")?;
    let metadata = &info.metadata;

    console.log("📦 Archive Information");
    console.log(format!("   Application: {}", metadata.application));
    console.log(format!("   Created by: {}", metadata.created_by));
    console.log(format!("   Payload: {} bytes at offset {}", info.payload_size, info.payload_offset));

    if !payload::verify_checksum(&info)? {
        anyhow::bail!("Payload checksum mismatch: the archive is corrupted");
    }
    console.log("   Checksum: verified");

    let mut archive = tar::Archive::new(payload::open_payload_reader(&info)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = onejar_common::layout::to_uri_path(&entry.path()?);
        if name == onejar_common::layout::LAUNCHER_PROPERTIES {
            let mut text = String::new();
            std::io::Read::read_to_string(&mut entry, &mut text)?;
            let plan = StartupPlan::parse(&text)?;

            console.log("");
            console.log(format!("🚀 Startup plan (default start level {})", plan.default_start_level));
            for spec in &plan.components {
                console.log(format!(
                    "   [{}]{} {}",
                    spec.level(),
                    if spec.is_autostart() { " start" } else { "" },
                    spec.rel_path
                ));
            }
            break;
        }
    }

    console.success("Archive is intact");
    Ok(())
}

fn cmd_init(application: &str, console: &Console) -> Result<()> {
    let path = std::env::current_dir()?.join(config::CONFIG_FILE);
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }

    std::fs::write(&path, config::generate_template(application))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    console.success(format!("Created {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_artifacts_come_first() {
        let inputs = collect_inputs(
            vec![PathBuf::from("cli-a"), PathBuf::from("cli-b")],
            vec![PathBuf::from("/project/configured")],
        );
        assert_eq!(
            inputs,
            vec![
                PathBuf::from("cli-a"),
                PathBuf::from("cli-b"),
                PathBuf::from("/project/configured"),
            ]
        );
    }
}
