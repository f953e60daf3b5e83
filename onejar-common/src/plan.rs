//! Startup plan
//!
//! The merged result of packaging: which components to install, at which
//! start level, and which properties to hand to the process and the runtime.
//! Serialized as `launcher.properties` at the root of the packaged archive.

use crate::error::{OnejarError, OnejarResult};
use crate::layout::{self, keys};
use crate::properties::Properties;

/// One merged startup directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    /// Path relative to the archive root, `/` separated
    pub rel_path: String,

    /// `None` until some descriptor states a level
    pub start_level: Option<u32>,

    /// `None` until some descriptor states whether to start
    pub autostart: Option<bool>,
}

impl ComponentSpec {
    pub fn new(rel_path: impl Into<String>, start_level: Option<u32>, autostart: Option<bool>) -> Self {
        Self {
            rel_path: rel_path.into(),
            start_level,
            autostart,
        }
    }

    /// Parse a `<relpath>@<level>[:start]` entry of the startup properties
    pub fn parse_entry(entry: &str) -> OnejarResult<Self> {
        let unhandled = || OnejarError::UnhandledSpecification(entry.to_string());

        let (rel_path, rest) = entry.rsplit_once('@').ok_or_else(unhandled)?;
        let (level, autostart) = match rest.strip_suffix(":start") {
            Some(level) => (level, true),
            None => (rest, false),
        };

        if rel_path.is_empty() {
            return Err(unhandled());
        }

        let start_level = level.parse::<u32>().map_err(|_| OnejarError::InvalidStartLevel {
            entry: entry.to_string(),
            value: level.to_string(),
        })?;

        Ok(Self::new(rel_path, Some(start_level), Some(autostart)))
    }

    /// Render as `<relpath>@<level>[:start]`; an unknown level is written as 0
    pub fn to_entry(&self) -> String {
        let mut s = format!("{}@{}", self.rel_path, self.level());
        if self.is_autostart() {
            s.push_str(":start");
        }
        s
    }

    pub fn level(&self) -> u32 {
        self.start_level.unwrap_or(0)
    }

    pub fn is_autostart(&self) -> bool {
        self.autostart.unwrap_or(false)
    }
}

/// The complete, ordered startup plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPlan {
    /// Components in first-seen order; at most one per `rel_path`
    pub components: Vec<ComponentSpec>,

    /// Hosted application id
    pub application: Option<String>,

    /// Highest start level iterated at boot
    pub default_start_level: u32,

    /// Process-wide properties (stored without the `system.` prefix)
    pub system_properties: Properties,

    /// Runtime configuration (stored without the `framework.` prefix)
    pub framework_properties: Properties,

    /// Pass-through configuration files, relative to `.configuration/`
    pub configuration_copy: Vec<String>,
}

impl Default for StartupPlan {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            application: None,
            default_start_level: layout::DEFAULT_START_LEVEL,
            system_properties: Properties::new(),
            framework_properties: Properties::new(),
            configuration_copy: Vec::new(),
        }
    }
}

impl StartupPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a directive for `rel_path`.
    ///
    /// Equal settings for an already-known path merge silently, differing
    /// ones fail. A setting still unknown on the existing spec is filled in.
    pub fn merge_component(
        &mut self,
        rel_path: &str,
        start_level: Option<u32>,
        autostart: Option<bool>,
    ) -> OnejarResult<()> {
        let Some(index) = self.components.iter().position(|c| c.rel_path == rel_path) else {
            self.components
                .push(ComponentSpec::new(rel_path, start_level, autostart));
            return Ok(());
        };
        let existing = &mut self.components[index];

        if let Some(current) = existing.autostart {
            if Some(current) != autostart {
                return Err(conflict("start", rel_path, Some(current), autostart));
            }
        }
        if let Some(current) = existing.start_level {
            if Some(current) != start_level {
                return Err(conflict("startLevel", rel_path, Some(current), start_level));
            }
        }

        existing.autostart = existing.autostart.or(autostart);
        existing.start_level = existing.start_level.or(start_level);

        Ok(())
    }

    /// Merge a `system.` pass-through; differing values fail
    pub fn merge_system_property(&mut self, key: &str, value: &str) -> OnejarResult<()> {
        merge_property(&mut self.system_properties, key, value)
    }

    /// Merge a `framework.` pass-through; differing values fail
    pub fn merge_framework_property(&mut self, key: &str, value: &str) -> OnejarResult<()> {
        merge_property(&mut self.framework_properties, key, value)
    }

    /// Record a pass-through configuration file once
    pub fn add_configuration_copy(&mut self, rel_path: &str) {
        if !self.configuration_copy.iter().any(|c| c == rel_path) {
            self.configuration_copy.push(rel_path.to_string());
        }
    }

    pub fn component(&self, rel_path: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.rel_path == rel_path)
    }

    /// Serialize into startup properties
    pub fn to_properties(&self) -> OnejarResult<Properties> {
        let application = self.application.as_deref().ok_or_else(|| OnejarError::MissingKey {
            key: keys::APPLICATION.to_string(),
            file: "startup plan".to_string(),
        })?;

        let mut props = Properties::new();

        for (key, value) in self.system_properties.iter() {
            props.insert(format!("{}{}", keys::SYSTEM_PREFIX, key), value);
        }
        for (key, value) in self.framework_properties.iter() {
            props.insert(format!("{}{}", keys::FRAMEWORK_PREFIX, key), value);
        }

        let bundles: Vec<String> = self.components.iter().map(ComponentSpec::to_entry).collect();
        props.insert(keys::BUNDLES, bundles.join(","));
        props.insert(keys::APPLICATION, application);
        props.insert(keys::DEFAULT_START_LEVEL, self.default_start_level.to_string());
        props.insert(keys::CONFIGURATION_COPY, self.configuration_copy.join(","));

        Ok(props)
    }

    /// Render `launcher.properties`
    pub fn to_text(&self) -> OnejarResult<String> {
        Ok(self.to_properties()?.to_text(Some("onejar startup properties")))
    }

    /// Read a plan back from startup properties
    pub fn from_properties(props: &Properties) -> OnejarResult<Self> {
        let required = |key: &str| {
            props.get(key).ok_or_else(|| OnejarError::MissingKey {
                key: key.to_string(),
                file: layout::LAUNCHER_PROPERTIES.to_string(),
            })
        };

        let bundles = required(keys::BUNDLES)?;
        let application = required(keys::APPLICATION)?;
        let level = required(keys::DEFAULT_START_LEVEL)?;
        let copy = required(keys::CONFIGURATION_COPY)?;

        let components = split_list(bundles)
            .map(ComponentSpec::parse_entry)
            .collect::<OnejarResult<Vec<_>>>()?;

        let default_start_level = level.trim().parse::<u32>().map_err(|_| OnejarError::InvalidStartLevel {
            entry: keys::DEFAULT_START_LEVEL.to_string(),
            value: level.to_string(),
        })?;

        Ok(Self {
            components,
            application: Some(application.to_string()),
            default_start_level,
            system_properties: props
                .with_prefix(keys::SYSTEM_PREFIX)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            framework_properties: props
                .with_prefix(keys::FRAMEWORK_PREFIX)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            configuration_copy: split_list(copy).map(str::to_string).collect(),
        })
    }

    /// Parse `launcher.properties` text
    pub fn parse(text: &str) -> OnejarResult<Self> {
        Self::from_properties(&Properties::parse(text))
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn merge_property(props: &mut Properties, key: &str, value: &str) -> OnejarResult<()> {
    match props.get(key) {
        Some(existing) if existing != value => Err(OnejarError::PropertyConflict {
            key: key.to_string(),
            existing: existing.to_string(),
            incoming: value.to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            props.insert(key, value);
            Ok(())
        }
    }
}

fn conflict<T: std::fmt::Debug>(what: &'static str, path: &str, existing: Option<T>, incoming: Option<T>) -> OnejarError {
    let show = |v: Option<T>| v.map(|v| format!("{:?}", v)).unwrap_or_else(|| "null".to_string());
    OnejarError::Conflict {
        what,
        path: path.to_string(),
        existing: show(existing),
        incoming: show(incoming),
    }
}
