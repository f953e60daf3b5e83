//! onejar Configuration Parser
//!
//! Parses onejar.toml files for declarative packaging configuration.
//! Every section is optional; command-line flags override file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration file name looked up in the current directory
pub const CONFIG_FILE: &str = "onejar.toml";

/// The main configuration structure matching onejar.toml
#[derive(Debug, Deserialize, Default)]
pub struct OnejarConfig {
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub inputs: InputsConfig,
    #[serde(default)]
    pub configuration: ConfigurationConfig,
}

/// Startup settings that override the input descriptors
#[derive(Debug, Deserialize, Default)]
pub struct PackageConfig {
    /// Hosted application id (overrides `eclipse.application`)
    #[serde(default)]
    pub application: Option<String>,

    /// Highest start level iterated at boot (overrides `osgi.bundles.defaultStartLevel`)
    #[serde(default)]
    pub default_start_level: Option<u32>,
}

/// Build configuration
#[derive(Debug, Deserialize)]
pub struct BuildConfig {
    /// Output tree the archive contents are assembled in
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Assembled executable (optional; the tree alone is produced otherwise)
    #[serde(default)]
    pub output: Option<String>,

    /// Tar archive with the bootstrap loader's own resources (optional)
    #[serde(default)]
    pub launcher: Option<String>,

    /// Path to a pre-built onejar-boot binary (optional)
    #[serde(default)]
    pub boot: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            output: None,
            launcher: None,
            boot: None,
        }
    }
}

/// Input artifacts, processed in order
#[derive(Debug, Deserialize, Default)]
pub struct InputsConfig {
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Pass-through configuration files
#[derive(Debug, Deserialize)]
pub struct ConfigurationConfig {
    /// Paths relative to an artifact's `configuration/` directory that are
    /// copied verbatim into the archive
    #[serde(default = "default_passthrough")]
    pub passthrough: Vec<String>,
}

impl Default for ConfigurationConfig {
    fn default() -> Self {
        Self {
            passthrough: default_passthrough(),
        }
    }
}

fn default_output_dir() -> String {
    "./target/onejar".to_string()
}

fn default_passthrough() -> Vec<String> {
    vec!["org.eclipse.update/platform.xml".to_string()]
}

impl OnejarConfig {
    /// Load configuration from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_str(&contents)
    }

    /// Load configuration from the current directory, if present
    pub fn from_current_dir() -> Result<Option<Self>> {
        let config_path = std::env::current_dir()?.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(None);
        }

        Self::from_file(&config_path).map(Some)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse onejar.toml")
    }

    /// Get the resolved output tree path
    pub fn output_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.build.output_dir)
    }

    /// Get the resolved executable path (if specified)
    pub fn output_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.build.output.as_ref().map(|p| base_dir.join(p))
    }

    /// Get the resolved launcher archive path (if specified)
    pub fn launcher_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.build.launcher.as_ref().map(|p| base_dir.join(p))
    }

    /// Get the resolved boot binary path (if specified)
    pub fn boot_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.build.boot.as_ref().map(|p| base_dir.join(p))
    }

    /// Get the resolved input artifact paths
    pub fn input_paths(&self, base_dir: &Path) -> Vec<PathBuf> {
        self.inputs.artifacts.iter().map(|p| base_dir.join(p)).collect()
    }

    /// Validate the configuration
    pub fn validate(&self, base_dir: &Path) -> Result<()> {
        for input in self.input_paths(base_dir) {
            if !input.exists() {
                anyhow::bail!("Input artifact does not exist: {}", input.display());
            }
        }

        if let Some(application) = &self.package.application {
            if application.trim().is_empty() {
                anyhow::bail!("[package] application must not be empty");
            }
        }

        for passthrough in &self.configuration.passthrough {
            if Path::new(passthrough).is_absolute() || passthrough.split('/').any(|s| s == "..") {
                anyhow::bail!(
                    "Pass-through configuration file must be a relative path inside configuration/, got: {}",
                    passthrough
                );
            }
        }

        Ok(())
    }
}

/// Generate a template onejar.toml file
pub fn generate_template(application: &str) -> String {
    format!(
        r#"# onejar Packaging Configuration

[package]
# Hosted application id; defaults to eclipse.application from config.ini
application = "{application}"

# Highest start level started at boot; defaults to osgi.bundles.defaultStartLevel or 4
# default_start_level = 4

[build]
# Directory the archive contents are assembled in
output_dir = "./target/onejar"

# Optional: assemble a single executable
# output = "./target/{name}"

# Optional: tar archive with extra bootstrap resources
# launcher = "./launcher.tar"

# Optional: path to a custom onejar-boot binary
# boot = "./onejar-boot"

[inputs]
# Product exports (directories or tar archives), processed in order
artifacts = []

[configuration]
# Files under configuration/ copied verbatim into the archive
passthrough = ["org.eclipse.update/platform.xml"]
"#,
        application = application,
        name = application.rsplit('.').next().unwrap_or("app"),
    )
}
