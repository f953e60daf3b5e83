//! Centralized Layout Definitions
//!
//! Names of the files and directories inside a packaged archive, shared by the
//! packager that writes them and the bootstrap loader that reads them.

/// Startup properties file at the archive root
pub const LAUNCHER_PROPERTIES: &str = "launcher.properties";

/// Subdirectory holding deduplicated component files
pub const PLUGINS_DIR: &str = "plugins";

/// Subdirectory holding pass-through configuration files
pub const CONFIGURATION_COPY_DIR: &str = ".configuration";

/// Archive manifest path
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Manifest attribute naming the entry point
pub const MAIN_CLASS_ATTRIBUTE: &str = "Main-Class";

/// Entry point written into the repackaged manifest
pub const BOOT_ENTRY: &str = "onejar-boot";

/// Synthetic scheme resolved against the packaged archive
pub const EMBEDDED_SCHEME: &str = "embedded";

/// Name of the default launcher descriptor inside an input artifact
pub const DEFAULT_LAUNCHER_INI: &str = "eclipse.ini";

/// Configuration directory inside an input artifact
pub const ARTIFACT_CONFIGURATION_DIR: &str = "configuration";

/// Descriptor inside the configuration directory of an input artifact
pub const CONFIG_INI: &str = "config.ini";

/// Start level used when no descriptor specifies one
pub const DEFAULT_START_LEVEL: u32 = 4;

/// Startup property keys
pub mod keys {
    /// Merged component list
    pub const BUNDLES: &str = "osgi.bundles";

    /// Runtime implementation location
    pub const FRAMEWORK: &str = "osgi.framework";

    /// Framework extension references
    pub const FRAMEWORK_EXTENSIONS: &str = "osgi.framework.extensions";

    /// Pointer to a simple-configurator descriptor
    pub const SIMPLE_CONFIGURATOR_URL: &str = "org.eclipse.equinox.simpleconfigurator.configUrl";

    /// Hosted application id
    pub const APPLICATION: &str = "eclipse.application";

    /// Maximum start level iterated at boot
    pub const DEFAULT_START_LEVEL: &str = "osgi.bundles.defaultStartLevel";

    /// Pass-through configuration files
    pub const CONFIGURATION_COPY: &str = "configuration.copy";

    /// Prefix of process-wide system properties
    pub const SYSTEM_PREFIX: &str = "system.";

    /// Prefix of runtime configuration properties
    pub const FRAMEWORK_PREFIX: &str = "framework.";
}

/// Convert a relative filesystem path into the `/` separated form used in
/// descriptors and archive entry names.
pub fn to_uri_path(path: &std::path::Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether an archive entry name is a signature file (`META-INF/<name>.SF`)
pub fn is_signature_file(name: &str) -> bool {
    name.strip_prefix("META-INF/")
        .map(|rest| !rest.is_empty() && !rest.contains('/') && rest.len() > 3 && rest.ends_with(".SF"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_uri_path_uses_forward_slashes() {
        let p = Path::new("plugins").join("a.jar");
        assert_eq!(to_uri_path(&p), "plugins/a.jar");
        assert_eq!(to_uri_path(Path::new("./x/y")), "x/y");
    }

    #[test]
    fn test_signature_files() {
        assert!(is_signature_file("META-INF/ECLIPSE_.SF"));
        assert!(!is_signature_file("META-INF/MANIFEST.MF"));
        assert!(!is_signature_file("META-INF/sub/X.SF"));
        assert!(!is_signature_file("META-INF/.SF"));
        assert!(!is_signature_file("other/X.SF"));
    }
}
