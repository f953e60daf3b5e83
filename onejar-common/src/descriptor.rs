//! Startup Descriptor Parser
//!
//! Input artifacts describe their components in up to three forms:
//! - a component-reference string (`reference:file:<path>@<level>[:start]`, comma separated)
//! - `configuration/config.ini`, a key=value descriptor naming the runtime
//!   implementation, the reference string and an optional pointer to
//! - a simple-configurator descriptor (`bundles.info`), one component per line.
//!
//! A launcher `.ini` at the artifact root may additionally carry `-D`
//! system properties after its `-vmargs` marker.

use crate::error::{OnejarError, OnejarResult};
use crate::layout::keys;
use crate::properties::Properties;

const REFERENCE_PREFIX: &str = "reference:file:";
const START_SUFFIX: &str = ":start";
const FILE_SCHEME: &str = "file:";

/// One component reference found in a descriptor, path relative to the
/// artifact's `plugins/` directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRef {
    pub file: String,
    pub start_level: Option<u32>,
    pub autostart: Option<bool>,
}

/// Parse `reference:file:<path>@<level>[:start]`
pub fn parse_reference(spec: &str) -> OnejarResult<ComponentRef> {
    let unhandled = || OnejarError::UnhandledSpecification(spec.to_string());

    let rest = spec.strip_prefix(REFERENCE_PREFIX).ok_or_else(unhandled)?;
    let (file, level) = rest.rsplit_once('@').ok_or_else(unhandled)?;

    let (level, autostart) = match level.strip_suffix(START_SUFFIX) {
        Some(level) => (level, true),
        None => (level, false),
    };

    if file.is_empty() || level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unhandled());
    }

    let start_level = level.parse::<u32>().map_err(|_| OnejarError::InvalidStartLevel {
        entry: spec.to_string(),
        value: level.to_string(),
    })?;

    Ok(ComponentRef {
        file: file.to_string(),
        start_level: Some(start_level),
        autostart: Some(autostart),
    })
}

/// Parse a comma separated list of component references
pub fn parse_reference_list(list: &str) -> OnejarResult<Vec<ComponentRef>> {
    list.split(',').map(parse_reference).collect()
}

/// Parse framework extension references (`reference:file:<path>`), which carry
/// no start information
pub fn parse_extension_list(list: &str) -> OnejarResult<Vec<ComponentRef>> {
    if list.is_empty() {
        return Ok(Vec::new());
    }

    list.split(',')
        .map(|spec| match spec.strip_prefix(REFERENCE_PREFIX) {
            Some(file) if !file.is_empty() => Ok(ComponentRef {
                file: file.to_string(),
                start_level: None,
                autostart: None,
            }),
            _ => Err(OnejarError::UnhandledSpecification(spec.to_string())),
        })
        .collect()
}

/// Scheme-specific part of a `file:` location, `None` for other schemes
pub fn file_uri_path(uri: &str) -> Option<&str> {
    uri.strip_prefix(FILE_SCHEME)
}

/// The recognized content of an artifact's `config.ini`
#[derive(Debug, Clone)]
pub struct ConfigIni {
    /// Runtime implementation location (`file:` URI)
    pub framework: String,

    /// Components from `osgi.bundles`
    pub bundles: Vec<ComponentRef>,

    /// Components from `osgi.framework.extensions`
    pub framework_extensions: Vec<ComponentRef>,

    /// Location of the simple-configurator descriptor, relative to `configuration/`
    pub simple_configurator: Option<String>,

    /// Every other key, passed through to the runtime configuration
    pub passthrough: Properties,
}

impl ConfigIni {
    /// Interpret parsed properties; `file` names the descriptor in errors
    pub fn from_properties(props: &Properties, file: &str) -> OnejarResult<Self> {
        let mut framework = None;
        let mut bundles = None;
        let mut framework_extensions = Vec::new();
        let mut simple_configurator = None;
        let mut passthrough = Properties::new();

        for (key, value) in props.iter() {
            match key {
                keys::BUNDLES => bundles = Some(parse_reference_list(value)?),
                keys::FRAMEWORK => framework = Some(value.to_string()),
                keys::FRAMEWORK_EXTENSIONS => framework_extensions = parse_extension_list(value)?,
                keys::SIMPLE_CONFIGURATOR_URL => {
                    let path = file_uri_path(value).unwrap_or(value);
                    simple_configurator = Some(path.to_string());
                }
                _ => {
                    passthrough.insert(key, value);
                }
            }
        }

        let missing = |key: &str| OnejarError::MissingKey {
            key: key.to_string(),
            file: file.to_string(),
        };

        let framework = framework.ok_or_else(|| missing(keys::FRAMEWORK))?;
        let bundles = bundles.ok_or_else(|| missing(keys::BUNDLES))?;

        if file_uri_path(&framework).is_none() {
            return Err(OnejarError::UnsupportedDescriptor {
                file: file.to_string(),
                line: format!("framework URI must have \"file\" scheme: '{}'", framework),
            });
        }

        Ok(Self {
            framework,
            bundles,
            framework_extensions,
            simple_configurator,
            passthrough,
        })
    }

    /// Runtime implementation path inside the artifact
    pub fn framework_path(&self) -> &str {
        file_uri_path(&self.framework).unwrap_or(&self.framework)
    }
}

/// One line of a simple-configurator descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleConfiguratorEntry {
    pub name: String,
    pub version: String,
    /// Path relative to the artifact root, always under `plugins/`
    pub path: String,
    pub start_level: u32,
    pub start: bool,
}

/// Parse a simple-configurator descriptor
///
/// `framework_path` is the runtime implementation's own path; its line is
/// skipped because the runtime is unpacked into the archive, not installed.
pub fn parse_simple_configurator(
    text: &str,
    file: &str,
    framework_path: &str,
) -> OnejarResult<Vec<SimpleConfiguratorEntry>> {
    let mut entries = Vec::new();

    let unsupported = |line: &str| OnejarError::UnsupportedDescriptor {
        file: file.to_string(),
        line: line.to_string(),
    };

    for line in text.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(encoding) = line.strip_prefix("#encoding=") {
            if encoding != "UTF-8" {
                return Err(OnejarError::UnsupportedEncoding(encoding.to_string()));
            }
            continue;
        }
        if let Some(version) = line.strip_prefix("#version=") {
            if version != "1" {
                return Err(OnejarError::UnsupportedVersion(version.to_string()));
            }
            continue;
        }
        if line.starts_with('#') {
            tracing::error!("Not supported: {}", line);
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();

        if fields.len() >= 3 && fields[2] == framework_path {
            continue;
        }
        if fields.len() != 5 {
            return Err(unsupported(line));
        }
        if !fields[2].starts_with("plugins/") {
            return Err(unsupported(fields[2]));
        }

        let start_level = fields[3].parse::<u32>().map_err(|_| OnejarError::InvalidStartLevel {
            entry: line.to_string(),
            value: fields[3].to_string(),
        })?;

        let start = match fields[4] {
            "true" => true,
            "false" => false,
            _ => return Err(unsupported(line)),
        };

        entries.push(SimpleConfiguratorEntry {
            name: fields[0].to_string(),
            version: fields[1].to_string(),
            path: fields[2].to_string(),
            start_level,
            start,
        });
    }

    Ok(entries)
}

/// Whether `key` can name a process environment variable
pub fn is_valid_property_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['=', '\0'])
}

/// Extract `-Dkey=value` system properties following `-vmargs`
///
/// A definition without a usable key, or with a NUL in its value, is an
/// [`OnejarError::UnsupportedDescriptor`].
pub fn parse_launcher_ini(text: &str, file: &str) -> OnejarResult<Vec<(String, String)>> {
    let mut properties = Vec::new();
    let mut in_vmargs = false;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');

        if line == "-vmargs" {
            in_vmargs = true;
        } else if in_vmargs {
            if let Some(definition) = line.strip_prefix("-D") {
                let (key, value) = definition.split_once('=').unwrap_or((definition, ""));
                if !is_valid_property_key(key) || value.contains('\0') {
                    return Err(OnejarError::UnsupportedDescriptor {
                        file: file.to_string(),
                        line: line.to_string(),
                    });
                }
                properties.push((key.to_string(), value.to_string()));
            }
        }
    }

    Ok(properties)
}
