//! Archive Packager
//!
//! Merges the components of several input artifacts into one output tree:
//! the runtime implementation of the first artifact is unpacked at the root
//! with its manifest rewritten to boot through `onejar-boot`, component files
//! are deduplicated by content into `plugins/`, and the merged startup plan is
//! written to `launcher.properties`.

use crate::artifact::InputArtifact;
use crate::registry::ContentRegistry;
use anyhow::{bail, Context, Result};
use onejar_common::descriptor::{self, ConfigIni};
use onejar_common::layout::{self, keys};
use onejar_common::manifest::Manifest;
use onejar_common::payload::{self, PayloadMetadata};
use onejar_common::{OnejarError, Properties, StartupPlan};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Everything the packager needs to know about one run
#[derive(Debug, Clone)]
pub struct PackagerOptions {
    /// Input artifacts, processed in order
    pub inputs: Vec<PathBuf>,

    /// Output tree; files already present are reused
    pub output_dir: PathBuf,

    /// Tar archive with the bootstrap loader's own resources
    pub launcher: Option<PathBuf>,

    /// Overrides `eclipse.application`
    pub application: Option<String>,

    /// Overrides `osgi.bundles.defaultStartLevel`
    pub default_start_level: Option<u32>,

    /// Files under `configuration/` copied verbatim
    pub passthrough: Vec<String>,
}

impl PackagerOptions {
    pub fn new(inputs: Vec<PathBuf>, output_dir: PathBuf) -> Self {
        Self {
            inputs,
            output_dir,
            launcher: None,
            application: None,
            default_start_level: None,
            passthrough: vec!["org.eclipse.update/platform.xml".to_string()],
        }
    }
}

/// Summary of a packaging run
#[derive(Debug)]
pub struct PackageReport {
    pub plan: StartupPlan,

    /// Component files copied into `plugins/`
    pub copied: usize,

    /// Component references satisfied by a byte-identical file already present
    pub reused: usize,

    /// Directory-valued components that were skipped
    pub skipped: usize,

    /// Files written from the runtime and launcher archives
    pub unpacked: usize,
}

pub struct Packager {
    options: PackagerOptions,
    registry: ContentRegistry,
    plan: StartupPlan,
    framework: Option<String>,
    manifest: Option<Manifest>,
    copied: usize,
    reused: usize,
    skipped: usize,
    unpacked: usize,
}

impl Packager {
    pub fn new(options: PackagerOptions) -> Self {
        Self {
            options,
            registry: ContentRegistry::new(),
            plan: StartupPlan::new(),
            framework: None,
            manifest: None,
            copied: 0,
            reused: 0,
            skipped: 0,
            unpacked: 0,
        }
    }

    /// Run the whole packaging pipeline
    pub fn run(mut self) -> Result<PackageReport> {
        let inputs = dedup_inputs(&self.options.inputs);
        if inputs.is_empty() {
            bail!("No input artifacts given");
        }

        let output_dir = self.options.output_dir.clone();
        let known = self
            .registry
            .register_tree(&output_dir)
            .context("Failed to register existing output files")?;
        if known > 0 {
            debug!("Registered {} existing files in {}", known, output_dir.display());
        }

        for input in &inputs {
            info!("Processing {}", input.display());
            let artifact = InputArtifact::open(input)?;
            self.process_artifact(&artifact)
                .with_context(|| format!("Failed to process {}", input.display()))?;
        }

        self.finish_plan()?;
        self.write_outputs()?;

        Ok(PackageReport {
            plan: self.plan,
            copied: self.copied,
            reused: self.reused,
            skipped: self.skipped,
            unpacked: self.unpacked,
        })
    }

    fn process_artifact(&mut self, artifact: &InputArtifact) -> Result<()> {
        if let Some(ini) = artifact.launcher_ini()? {
            let text = fs::read_to_string(&ini)
                .with_context(|| format!("Failed to read {}", ini.display()))?;
            let name = ini.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            for (key, value) in descriptor::parse_launcher_ini(&text, &name)? {
                self.plan.merge_system_property(&key, &value)?;
            }
        }

        let config_ini = artifact.configuration_dir().join(layout::CONFIG_INI);
        let props = if config_ini.is_file() {
            Properties::parse(
                &fs::read_to_string(&config_ini)
                    .with_context(|| format!("Failed to read {}", config_ini.display()))?,
            )
        } else {
            Properties::new()
        };
        let ini = ConfigIni::from_properties(&props, &config_ini.display().to_string())?;

        for (key, value) in ini.passthrough.iter() {
            self.plan.merge_framework_property(key, value)?;
        }

        self.copy_configuration(artifact, ini.simple_configurator.as_deref())?;

        match &self.framework {
            None => self.install_framework(artifact, &ini)?,
            Some(primary) if *primary != ini.framework => {
                return Err(OnejarError::RuntimeMismatch {
                    primary: primary.clone(),
                    other: ini.framework.clone(),
                }
                .into());
            }
            Some(_) => {}
        }

        let plugins = artifact.root().join(layout::PLUGINS_DIR);

        for component in &ini.bundles {
            let path = resolve_under(&plugins, &component.file);
            self.add_component(&path, component.start_level, component.autostart)?;
        }

        for extension in &ini.framework_extensions {
            let path = resolve_under(&plugins, &extension.file);
            self.add_component(&path, None, None)?;
        }

        if let Some(descriptor_path) = &ini.simple_configurator {
            let path = resolve_under(&artifact.configuration_dir(), descriptor_path);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;

            let entries = descriptor::parse_simple_configurator(
                &text,
                &path.display().to_string(),
                ini.framework_path(),
            )?;

            for entry in entries {
                let plugin = artifact.resolve(&entry.path);
                self.add_component(&plugin, Some(entry.start_level), Some(entry.start))?;
            }
        }

        Ok(())
    }

    /// Copy pass-through configuration files; the first artifact to provide a
    /// path wins
    fn copy_configuration(&mut self, artifact: &InputArtifact, simple_configurator: Option<&str>) -> Result<()> {
        let configuration = artifact.configuration_dir();
        if !configuration.is_dir() {
            return Ok(());
        }

        for entry in WalkDir::new(&configuration).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = layout::to_uri_path(entry.path().strip_prefix(&configuration)?);

            if rel == layout::CONFIG_INI || Some(rel.as_str()) == simple_configurator {
                continue;
            }
            if !self.options.passthrough.iter().any(|p| *p == rel) {
                warn!("Unhandled configuration file {} in {}", rel, artifact.source().display());
                continue;
            }

            let target = resolve_under(
                &self.options.output_dir.join(layout::CONFIGURATION_COPY_DIR),
                &rel,
            );
            if target.exists() {
                debug!("Keeping existing {}", target.display());
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            }
            self.plan.add_configuration_copy(&rel);
        }

        Ok(())
    }

    /// Unpack the runtime implementation and the launcher resources into the
    /// output tree and capture the manifest for rewriting
    fn install_framework(&mut self, artifact: &InputArtifact, ini: &ConfigIni) -> Result<()> {
        let framework_archive = artifact.resolve(ini.framework_path());
        info!("Unpacking runtime implementation {}", ini.framework_path());

        let (manifest, count) = copy_archive_entries(&framework_archive, &self.options.output_dir)
            .with_context(|| format!("Failed to unpack {}", framework_archive.display()))?;
        self.unpacked += count;

        let mut manifest = manifest.unwrap_or_else(|| {
            warn!("No manifest in {}, creating one", framework_archive.display());
            Manifest::new()
        });
        manifest.set_entry_point(layout::BOOT_ENTRY);
        // digests of signed entries are invalid once repackaged
        manifest.clear_entries();

        if let Some(launcher) = &self.options.launcher {
            let (_, count) = copy_archive_entries(launcher, &self.options.output_dir)
                .with_context(|| format!("Failed to unpack launcher {}", launcher.display()))?;
            self.unpacked += count;
        }

        self.framework = Some(ini.framework.clone());
        self.manifest = Some(manifest);

        Ok(())
    }

    fn add_component(&mut self, source: &Path, start_level: Option<u32>, autostart: Option<bool>) -> Result<()> {
        if source.is_dir() {
            error!("Not supported: directory: {}", source.display());
            self.skipped += 1;
            return Ok(());
        }
        if !source.is_file() {
            bail!("Component not found: {}", source.display());
        }

        let placed = match self.registry.find(source)? {
            Some(existing) => {
                debug!("Reusing {} for {}", existing.display(), source.display());
                self.reused += 1;
                existing
            }
            None => {
                let file_name = source
                    .file_name()
                    .ok_or_else(|| anyhow::anyhow!("Component without file name: {}", source.display()))?;
                let dest = self.options.output_dir.join(layout::PLUGINS_DIR).join(file_name);
                if dest.exists() {
                    return Err(OnejarError::DuplicateFile(dest).into());
                }
                fs::create_dir_all(self.options.output_dir.join(layout::PLUGINS_DIR))?;
                fs::copy(source, &dest)
                    .with_context(|| format!("Failed to copy {}", source.display()))?;
                self.registry.register(&dest)?;
                self.copied += 1;
                dest
            }
        };

        let rel = layout::to_uri_path(placed.strip_prefix(&self.options.output_dir)?);
        self.plan.merge_component(&rel, start_level, autostart)?;

        Ok(())
    }

    /// Settle the scalar properties once every artifact was merged
    fn finish_plan(&mut self) -> Result<()> {
        let application = self
            .options
            .application
            .clone()
            .or_else(|| self.plan.framework_properties.get(keys::APPLICATION).map(str::to_string))
            .ok_or_else(|| OnejarError::MissingKey {
                key: keys::APPLICATION.to_string(),
                file: layout::CONFIG_INI.to_string(),
            })?;
        self.plan.application = Some(application);

        self.plan.default_start_level = match self.options.default_start_level {
            Some(level) => level,
            None => match self.plan.framework_properties.get(keys::DEFAULT_START_LEVEL) {
                Some(level) => level.trim().parse().map_err(|_| OnejarError::InvalidStartLevel {
                    entry: keys::DEFAULT_START_LEVEL.to_string(),
                    value: level.to_string(),
                })?,
                None => layout::DEFAULT_START_LEVEL,
            },
        };

        for spec in &self.plan.components {
            if spec.is_autostart() && spec.level() > self.plan.default_start_level {
                warn!(
                    "{} starts at level {}, above the default start level {}; it will not be started",
                    spec.rel_path,
                    spec.level(),
                    self.plan.default_start_level
                );
            }
        }

        Ok(())
    }

    fn write_outputs(&self) -> Result<()> {
        let output_dir = &self.options.output_dir;
        fs::create_dir_all(output_dir)?;

        let properties = output_dir.join(layout::LAUNCHER_PROPERTIES);
        fs::write(&properties, self.plan.to_text()?)
            .with_context(|| format!("Failed to write {}", properties.display()))?;

        if let Some(manifest) = &self.manifest {
            let path = resolve_under(output_dir, layout::MANIFEST_PATH);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, manifest.to_text())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        info!(
            "Wrote {} components to {}",
            self.plan.components.len(),
            properties.display()
        );

        Ok(())
    }
}

/// Stream every regular file of a tar archive into `dest`, skipping
/// directories, signature files and the manifest, which is returned parsed
pub fn copy_archive_entries(archive: &Path, dest: &Path) -> Result<(Option<Manifest>, usize)> {
    let file = File::open(archive)?;
    let mut archive_reader = tar::Archive::new(file);
    let mut manifest = None;
    let mut count = 0;

    fs::create_dir_all(dest)?;

    for entry in archive_reader.entries()? {
        let mut entry = entry.context("Failed to read tar entry")?;
        let name = layout::to_uri_path(&entry.path()?);

        if name == layout::MANIFEST_PATH {
            if manifest.is_some() {
                bail!("Duplicate manifest in {}", archive.display());
            }
            let mut text = String::new();
            std::io::Read::read_to_string(&mut entry, &mut text)?;
            manifest = Some(Manifest::parse(&text)?);
        } else if !entry.header().entry_type().is_file() {
            continue;
        } else if layout::is_signature_file(&name) {
            // signatures become invalid by re-packaging
            continue;
        } else if entry.unpack_in(dest)? {
            count += 1;
        } else {
            warn!("Skipping entry outside of the archive root: {}", name);
        }
    }

    Ok((manifest, count))
}

/// Locate the onejar-boot binary
pub fn locate_boot_binary(custom: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = custom {
        if !path.is_file() {
            bail!("Boot binary not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    // Try to find it in the same directory as this binary
    let current_exe = std::env::current_exe()?;
    let sibling = current_exe
        .parent()
        .map(|p| p.join(format!("onejar-boot{}", std::env::consts::EXE_SUFFIX)))
        .filter(|p| p.is_file());

    sibling.ok_or_else(|| {
        anyhow::anyhow!(
            "No onejar-boot binary found next to {}. Pass --boot <path>.",
            current_exe.display()
        )
    })
}

/// Assemble the output tree and the boot binary into one executable
pub fn assemble(tree: &Path, output: &Path, boot_binary: &Path, application: &str) -> Result<PayloadMetadata> {
    let boot = fs::read(boot_binary)
        .with_context(|| format!("Failed to read boot binary {}", boot_binary.display()))?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    payload::write_executable(output, &boot, tree, application)
}

fn dedup_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = Vec::new();
    for input in inputs {
        if !seen.contains(input) {
            seen.push(input.clone());
        }
    }
    seen
}

/// Join a `/` separated relative path onto `base`
fn resolve_under(base: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .fold(base.to_path_buf(), |p, s| p.join(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut data);
            for (name, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, *content).unwrap();
            }
            builder.finish().unwrap();
        }
        data
    }

    #[test]
    fn test_copy_archive_entries_skips_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("osgi.jar");
        fs::write(
            &archive,
            tar_of(&[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\nMain-Class: Starter\r\n\r\nName: a.class\r\nSHA-256-Digest: x\r\n\r\n"),
                ("META-INF/ECLIPSE_.SF", b"signature"),
                ("META-INF/ECLIPSE_.RSA", b"block"),
                ("org/eclipse/osgi/a.class", b"class"),
            ]),
        )
        .unwrap();

        let out = dir.path().join("out");
        let (manifest, count) = copy_archive_entries(&archive, &out).unwrap();

        assert_eq!(count, 2);
        assert_eq!(manifest.unwrap().entry_point(), Some("Starter"));
        assert!(out.join("org/eclipse/osgi/a.class").is_file());
        assert!(out.join("META-INF/ECLIPSE_.RSA").is_file());
        assert!(!out.join("META-INF/ECLIPSE_.SF").exists());
        assert!(!out.join("META-INF/MANIFEST.MF").exists());
    }

    #[test]
    fn test_dedup_inputs_keeps_first() {
        let inputs = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("a")];
        assert_eq!(dedup_inputs(&inputs), vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn test_resolve_under() {
        let base = Path::new("/out");
        assert_eq!(resolve_under(base, "a/./b//c"), Path::new("/out/a/b/c"));
    }

    #[test]
    fn test_no_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let options = PackagerOptions::new(Vec::new(), dir.path().join("out"));
        assert!(Packager::new(options).run().is_err());
    }
}
