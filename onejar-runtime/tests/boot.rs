//! Boot sequence against a recording runtime

use onejar_cli::packager::{self, Packager, PackagerOptions};
use onejar_common::{ComponentSpec, Properties, StartupPlan};
use onejar_runtime::boot::{config_keys, ApplicationLauncher, BootLoader, BootOptions, BootState, APPLICATION_LAUNCHER_SERVICE};
use onejar_runtime::resources::Classpath;
use onejar_runtime::runtime::{
    split_locator, ApplicationResult, ComponentHandle, HostedApplication, ModuleRuntime, ResourceHandler,
    RuntimeContext, RuntimeFactory,
};
use std::any::Any;
use std::cell::RefCell;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

#[derive(Clone)]
enum Outcome {
    Return(ApplicationResult),
    Fail,
    Panic,
}

#[derive(Default)]
struct Record {
    config: Option<Properties>,
    events: Vec<String>,
    installed: Vec<(String, Vec<u8>)>,
    copied_configuration: Option<String>,
    handler: Option<Rc<dyn ResourceHandler>>,
    launcher_registered: bool,
}

impl Record {
    fn events_starting_with(&self, prefix: &str) -> Vec<String> {
        self.events.iter().filter(|e| e.starts_with(prefix)).cloned().collect()
    }
}

struct RecordingFactory {
    record: Rc<RefCell<Record>>,
    outcome: Outcome,
}

impl RecordingFactory {
    fn new(outcome: Outcome) -> Self {
        Self {
            record: Rc::new(RefCell::new(Record::default())),
            outcome,
        }
    }
}

impl RuntimeFactory for RecordingFactory {
    fn new_runtime(&self, config: Properties) -> anyhow::Result<Box<dyn ModuleRuntime>> {
        let storage = PathBuf::from(config.get(config_keys::STORAGE).unwrap());
        let mut record = self.record.borrow_mut();
        record.copied_configuration = fs::read_to_string(storage.join("org.eclipse.update/platform.xml")).ok();
        record.config = Some(config);
        record.events.push("new".to_string());

        Ok(Box::new(RecordingRuntime {
            context: RecordingContext {
                record: self.record.clone(),
                outcome: self.outcome.clone(),
            },
        }))
    }
}

struct RecordingRuntime {
    context: RecordingContext,
}

impl ModuleRuntime for RecordingRuntime {
    fn start(&mut self) -> anyhow::Result<()> {
        self.context.record.borrow_mut().events.push("runtime-start".to_string());
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.context.record.borrow_mut().events.push("stop".to_string());
        Ok(())
    }

    fn wait_for_stop(&mut self, timeout: Option<Duration>) -> anyhow::Result<bool> {
        let event = match timeout {
            None => "wait:unbounded".to_string(),
            Some(t) => format!("wait:{:?}", t),
        };
        self.context.record.borrow_mut().events.push(event);
        Ok(true)
    }

    fn context(&self) -> &dyn RuntimeContext {
        &self.context
    }
}

struct RecordingContext {
    record: Rc<RefCell<Record>>,
    outcome: Outcome,
}

impl RuntimeContext for RecordingContext {
    fn install_component(&self, locator: &str) -> anyhow::Result<Box<dyn ComponentHandle>> {
        let (scheme, path) = split_locator(locator)?;
        assert_eq!(scheme, "embedded");

        let handler = self.record.borrow().handler.clone().expect("handler registered before install");
        let mut bytes = Vec::new();
        handler.open(path)?.read_to_end(&mut bytes)?;

        let mut record = self.record.borrow_mut();
        record.events.push(format!("install:{}", path));
        record.installed.push((path.to_string(), bytes));

        Ok(Box::new(RecordingHandle {
            name: path.to_string(),
            record: self.record.clone(),
        }))
    }

    fn register_resource_handler(&self, scheme: &str, handler: Rc<dyn ResourceHandler>) -> anyhow::Result<()> {
        let mut record = self.record.borrow_mut();
        record.events.push(format!("handler:{}", scheme));
        record.handler = Some(handler);
        Ok(())
    }

    fn register_service(&self, name: &str, service: Rc<dyn Any>) -> anyhow::Result<()> {
        let mut record = self.record.borrow_mut();
        record.events.push(format!("service:{}", name));
        record.launcher_registered = service.downcast_ref::<ApplicationLauncher>().is_some();
        Ok(())
    }

    fn application(&self, id: &str) -> anyhow::Result<Box<dyn HostedApplication>> {
        Ok(Box::new(RecordingApplication {
            id: id.to_string(),
            record: self.record.clone(),
            outcome: self.outcome.clone(),
        }))
    }

    fn components(&self) -> Vec<String> {
        self.record.borrow().installed.iter().map(|(n, _)| n.clone()).collect()
    }
}

struct RecordingHandle {
    name: String,
    record: Rc<RefCell<Record>>,
}

impl ComponentHandle for RecordingHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> anyhow::Result<()> {
        self.record.borrow_mut().events.push(format!("start:{}", self.name));
        Ok(())
    }
}

struct RecordingApplication {
    id: String,
    record: Rc<RefCell<Record>>,
    outcome: Outcome,
}

impl HostedApplication for RecordingApplication {
    fn run(&mut self, args: &[String]) -> anyhow::Result<ApplicationResult> {
        self.record
            .borrow_mut()
            .events
            .push(format!("run:{}:{}", self.id, args.join(" ")));
        match &self.outcome {
            Outcome::Return(result) => Ok(result.clone()),
            Outcome::Fail => anyhow::bail!("application crashed"),
            Outcome::Panic => panic!("application panicked"),
        }
    }
}

/// Write a packaged tree holding the given components and startup plan
fn packaged_tree(dir: &Path, components: &[(&str, u32, bool)], extra: &[(&str, &str)]) -> PathBuf {
    let tree = dir.join("tree");
    fs::create_dir_all(tree.join("plugins")).unwrap();

    let mut plan = StartupPlan::new();
    plan.application = Some("org.example.app".to_string());
    for (name, level, autostart) in components {
        let rel = format!("plugins/{}", name);
        fs::write(tree.join(&rel), format!("contents of {}", name)).unwrap();
        plan.components.push(ComponentSpec::new(rel, Some(*level), Some(*autostart)));
    }
    for (key, value) in extra {
        let props = Properties::parse(&format!("{}={}", key, value));
        for (k, v) in props.iter() {
            if let Some(k) = k.strip_prefix("system.") {
                plan.system_properties.insert(k, v);
            } else if let Some(k) = k.strip_prefix("framework.") {
                plan.framework_properties.insert(k, v);
            }
        }
    }

    fs::write(tree.join("launcher.properties"), plan.to_text().unwrap()).unwrap();
    tree
}

fn boot(classpath: Classpath, factory: &RecordingFactory, temp_root: &Path, args: &[&str]) -> (i32, BootState) {
    let options = BootOptions {
        args: args.iter().map(|a| a.to_string()).collect(),
        signal_cleanup: false,
        temp_root: Some(temp_root.to_path_buf()),
    };
    let mut loader = BootLoader::new(factory, classpath, options);
    let code = loader.run();
    (code, loader.state())
}

fn storage_of(factory: &RecordingFactory) -> PathBuf {
    let record = factory.record.borrow();
    PathBuf::from(record.config.as_ref().unwrap().get(config_keys::STORAGE).unwrap())
}

#[test]
fn test_start_level_order() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(
        dir.path(),
        &[("c2.jar", 2, true), ("c0.jar", 0, true), ("c1.jar", 1, false)],
        &[],
    );
    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Unit));

    let (code, state) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 0);
    assert_eq!(state, BootState::Stopped);

    let record = factory.record.borrow();
    assert_eq!(
        record.events_starting_with("install:"),
        vec!["install:plugins/c2.jar", "install:plugins/c0.jar", "install:plugins/c1.jar"]
    );
    assert_eq!(
        record.events_starting_with("start:"),
        vec!["start:plugins/c0.jar", "start:plugins/c2.jar"]
    );
}

#[test]
fn test_boot_sequence_and_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(dir.path(), &[("a.jar", 1, true)], &[]);
    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Integer(42)));

    let (code, _) = boot(
        Classpath::from_paths(&[tree]).unwrap(),
        &factory,
        dir.path(),
        &["--file", "x.txt"],
    );

    assert_eq!(code, 42);

    let record = factory.record.borrow();
    assert_eq!(
        record.events,
        vec![
            "new".to_string(),
            "runtime-start".to_string(),
            "handler:embedded".to_string(),
            "install:plugins/a.jar".to_string(),
            "start:plugins/a.jar".to_string(),
            format!("service:{}", APPLICATION_LAUNCHER_SERVICE),
            "run:org.example.app:--file x.txt".to_string(),
            "stop".to_string(),
            "wait:unbounded".to_string(),
        ]
    );
    assert!(record.launcher_registered);
    assert_eq!(record.installed[0].1, b"contents of a.jar");
}

#[test]
fn test_non_integer_result_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(dir.path(), &[("a.jar", 1, true)], &[]);
    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Value("done".to_string())));

    let (code, _) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);
    assert_eq!(code, 0);
}

#[test]
fn test_application_failure_tears_down_and_removes_storage() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(dir.path(), &[("a.jar", 1, true)], &[]);
    let factory = RecordingFactory::new(Outcome::Fail);

    let (code, state) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 1);
    assert_eq!(state, BootState::Stopped);
    assert!(!storage_of(&factory).exists());

    let record = factory.record.borrow();
    let tail: Vec<_> = record.events.iter().rev().take(2).rev().cloned().collect();
    assert_eq!(tail, vec!["stop", "wait:unbounded"]);
}

#[test]
fn test_application_panic_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(dir.path(), &[("a.jar", 1, true)], &[]);
    let factory = RecordingFactory::new(Outcome::Panic);

    let (code, state) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 1);
    assert_eq!(state, BootState::Stopped);
    assert!(!storage_of(&factory).exists());

    let record = factory.record.borrow();
    let tail: Vec<_> = record.events.iter().rev().take(3).rev().cloned().collect();
    assert_eq!(tail, vec!["run:org.example.app:", "stop", "wait:unbounded"]);
}

#[test]
fn test_install_failure_skips_application() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(dir.path(), &[("a.jar", 1, true), ("b.jar", 1, true)], &[]);
    fs::remove_file(tree.join("plugins/b.jar")).unwrap();
    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Integer(0)));

    let (code, _) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 1);
    let record = factory.record.borrow();
    assert!(record.events_starting_with("run:").is_empty());
    assert!(record.events_starting_with("start:").is_empty());
    assert_eq!(record.events_starting_with("stop"), vec!["stop"]);
    assert!(!storage_of(&factory).exists());
}

#[test]
fn test_runtime_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let tree = packaged_tree(
        dir.path(),
        &[("a.jar", 1, true)],
        &[
            ("system.onejar.boot.test.mode", "headless"),
            ("framework.eclipse.product", "org.example.product"),
            ("system.", "unnamed"),
        ],
    );

    // pass-through configuration file
    let text = fs::read_to_string(tree.join("launcher.properties")).unwrap();
    let mut plan = StartupPlan::parse(&text).unwrap();
    plan.add_configuration_copy("org.eclipse.update/platform.xml");
    fs::write(tree.join("launcher.properties"), plan.to_text().unwrap()).unwrap();
    fs::create_dir_all(tree.join(".configuration/org.eclipse.update")).unwrap();
    fs::write(tree.join(".configuration/org.eclipse.update/platform.xml"), "<config/>").unwrap();

    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Unit));
    let (code, _) = boot(Classpath::from_paths(&[tree]).unwrap(), &factory, dir.path(), &[]);
    assert_eq!(code, 0);

    let record = factory.record.borrow();
    let config = record.config.as_ref().unwrap();
    assert_eq!(config.get("eclipse.product"), Some("org.example.product"));
    assert_eq!(config.get("eclipse.application"), Some("org.example.app"));
    assert_eq!(config.get("osgi.bundles.defaultStartLevel"), Some("4"));
    assert_eq!(config.get(config_keys::STORAGE_CLEAN), Some("onFirstInit"));
    assert_eq!(config.get(config_keys::BOOT_DELEGATION_DEFAULT), Some("true"));
    assert!(!config.contains_key("onejar.boot.test.mode"));
    assert!(config.iter().all(|(k, _)| !k.starts_with("system.") && !k.starts_with("framework.")));

    assert_eq!(std::env::var("onejar.boot.test.mode").unwrap(), "headless");
    assert_eq!(record.copied_configuration.as_deref(), Some("<config/>"));
}

#[test]
fn test_missing_startup_properties() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Unit));

    let (code, state) = boot(Classpath::from_paths(&[empty]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 1);
    assert_eq!(state, BootState::Stopped);
    assert!(factory.record.borrow().events.is_empty());
}

fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.finish().unwrap();
}

fn product_export(root: &Path) -> PathBuf {
    fs::create_dir_all(root.join("configuration")).unwrap();
    fs::create_dir_all(root.join("plugins")).unwrap();
    fs::write(
        root.join("configuration/config.ini"),
        "osgi.framework=file\\:plugins/org.eclipse.osgi.jar\n\
         osgi.bundles=reference\\:file\\:a.jar@1\\:start\n\
         eclipse.application=org.example.app\n",
    )
    .unwrap();
    write_tar(
        &root.join("plugins/org.eclipse.osgi.jar"),
        &[("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\nMain-Class: Starter\r\n\r\n")],
    );
    fs::write(root.join("plugins/a.jar"), b"identical component").unwrap();
    root.to_path_buf()
}

#[test]
fn test_package_then_boot_installs_shared_component_once() {
    let dir = tempfile::tempdir().unwrap();
    let first = product_export(&dir.path().join("first"));
    let second = product_export(&dir.path().join("second"));
    let out = dir.path().join("out");

    Packager::new(PackagerOptions::new(vec![first, second], out.clone()))
        .run()
        .unwrap();

    let boot_binary = dir.path().join("boot-stub");
    fs::write(&boot_binary, b"\x7fELF stub").unwrap();
    let exe = dir.path().join("app");
    packager::assemble(&out, &exe, &boot_binary, "org.example.app").unwrap();

    let factory = RecordingFactory::new(Outcome::Return(ApplicationResult::Integer(0)));
    let (code, _) = boot(Classpath::from_paths(&[exe]).unwrap(), &factory, dir.path(), &[]);

    assert_eq!(code, 0);
    let record = factory.record.borrow();
    assert_eq!(record.events_starting_with("install:"), vec!["install:plugins/a.jar"]);
    assert_eq!(record.events_starting_with("start:"), vec!["start:plugins/a.jar"]);
    assert_eq!(record.installed[0].1, b"identical component");
}
