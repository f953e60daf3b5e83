//! Two-stage isolated launch
//!
//! Stage 1 enumerates the classpath (the running executable when it carries a
//! payload, plus any `ONEJAR_CLASSPATH` entries) and re-executes itself with
//! exactly that classpath and no other inherited onejar state. Stage 2 is
//! recognized by the stage marker and boots the runtime.

use anyhow::{bail, Context, Result};
use onejar_common::payload;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicU32, Ordering};

/// Marks a process as the isolated second stage
pub const STAGE_ENV: &str = "ONEJAR_STAGE";

/// Value of [`STAGE_ENV`] in stage 2
pub const STAGE_ISOLATED: &str = "isolated";

/// Extra classpath entries, platform path-list syntax
pub const CLASSPATH_ENV: &str = "ONEJAR_CLASSPATH";

/// Storage directory handed to the hosted application
pub const STORAGE_ENV: &str = "ONEJAR_STORAGE";

/// Boot in this process instead of relaunching an isolated one
pub const IN_PROCESS_ENV: &str = "ONEJAR_IN_PROCESS";

/// Debug-level boot diagnostics
pub const BOOT_VERBOSE_ENV: &str = "ONEJAR_BOOT_VERBOSE";

/// Stage 2 process id while stage 1 waits for it, 0 otherwise
static CHILD_PID: AtomicU32 = AtomicU32::new(0);

/// Variables that never leak from one onejar process into the next
const INHERITED_STATE: &[&str] = &[STAGE_ENV, CLASSPATH_ENV, STORAGE_ENV];

/// Loader switches. They come from the environment so that every process
/// argument reaches the hosted application untouched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootSwitches {
    pub in_process: bool,
    pub verbose: bool,
}

impl BootSwitches {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let enabled = |key: &str| match lookup(key) {
            Some(value) => !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false")),
            None => false,
        };

        Self {
            in_process: enabled(IN_PROCESS_ENV),
            verbose: enabled(BOOT_VERBOSE_ENV),
        }
    }
}

/// Process arguments after the program name, unchanged
pub fn application_args<I: IntoIterator<Item = OsString>>(args_os: I) -> Vec<OsString> {
    args_os.into_iter().skip(1).collect()
}

/// Collects the classpath for the isolated stage
#[derive(Debug, Default)]
pub struct ContextBuilder {
    classpath: Vec<PathBuf>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the running executable and `ONEJAR_CLASSPATH`
    pub fn from_environment() -> Result<Self> {
        let mut builder = Self::new();

        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        if payload::has_payload(&exe) {
            builder.add(&exe);
        } else {
            tracing::debug!("{} carries no payload", exe.display());
        }

        if let Some(extra) = std::env::var_os(CLASSPATH_ENV) {
            for path in std::env::split_paths(&extra) {
                if !path.as_os_str().is_empty() {
                    builder.add(&path);
                }
            }
        }

        Ok(builder)
    }

    /// Append an entry; duplicates are ignored
    pub fn add(&mut self, path: &Path) -> &mut Self {
        if !self.classpath.iter().any(|p| p == path) {
            self.classpath.push(path.to_path_buf());
        }
        self
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    pub fn build(self) -> Result<IsolatedContext> {
        if self.classpath.is_empty() {
            bail!(
                "Nothing to boot: the executable carries no payload and {} is not set",
                CLASSPATH_ENV
            );
        }

        for path in &self.classpath {
            if !path.exists() {
                bail!("Classpath entry does not exist: {}", path.display());
            }
        }

        Ok(IsolatedContext {
            classpath: self.classpath,
        })
    }
}

/// The enumerated classpath the second stage runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedContext {
    classpath: Vec<PathBuf>,
}

impl IsolatedContext {
    /// The context of this process when it is the isolated stage
    pub fn from_env() -> Result<Option<Self>> {
        if !is_isolated() {
            return Ok(None);
        }

        let classpath: Vec<PathBuf> = std::env::var_os(CLASSPATH_ENV)
            .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        if classpath.is_empty() {
            bail!("{} is set but {} is empty", STAGE_ENV, CLASSPATH_ENV);
        }

        Ok(Some(Self { classpath }))
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    /// Command running `program` as the isolated stage
    pub fn command(&self, program: &Path, args: &[OsString]) -> Result<Command> {
        let joined = std::env::join_paths(&self.classpath)
            .context("Classpath entry contains the path separator")?;

        let mut command = Command::new(program);
        command.args(args);
        clear_inherited_state(&mut command);
        command.env(STAGE_ENV, STAGE_ISOLATED);
        command.env(CLASSPATH_ENV, joined);

        Ok(command)
    }

    /// Re-execute the running executable as stage 2 and wait for it
    pub fn relaunch(&self, args: &[OsString]) -> Result<i32> {
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        tracing::debug!("Relaunching {} with {} classpath entries", exe.display(), self.classpath.len());

        let mut child = self
            .command(&exe, args)?
            .spawn()
            .with_context(|| format!("Failed to relaunch {}", exe.display()))?;

        CHILD_PID.store(child.id(), Ordering::SeqCst);
        let status = child.wait();
        CHILD_PID.store(0, Ordering::SeqCst);

        let status = status.with_context(|| format!("Failed to wait for {}", exe.display()))?;
        Ok(exit_code(status))
    }
}

/// Keep this process's onejar state out of a child's environment
pub fn clear_inherited_state(command: &mut Command) {
    for key in INHERITED_STATE {
        command.env_remove(key);
    }
}

/// Whether this process is the isolated stage
pub fn is_isolated() -> bool {
    std::env::var(STAGE_ENV).map(|v| v == STAGE_ISOLATED).unwrap_or(false)
}

/// Pass SIGINT, SIGTERM and SIGHUP on to the running stage 2 as SIGTERM, so
/// its own handler removes the temporary storage. Stage 1 itself keeps
/// waiting and forwards the child's status.
pub fn forward_termination() {
    if let Err(e) = ctrlc::set_handler(|| {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid != 0 {
            terminate(pid);
        }
    }) {
        tracing::warn!("Failed to install termination handler: {}", e);
    }
}

/// Ask process `pid` to terminate
#[cfg(unix)]
pub fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory effects; a stale pid only yields ESRCH
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) {}

/// Map a child's exit status to a process exit code
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_builder_dedups_and_requires_entries() {
        let dir = tempfile::tempdir().unwrap();

        assert!(ContextBuilder::new().build().is_err());

        let mut builder = ContextBuilder::new();
        builder.add(dir.path()).add(dir.path());
        assert_eq!(builder.classpath().len(), 1);

        let context = builder.build().unwrap();
        assert_eq!(context.classpath(), &[dir.path().to_path_buf()]);
    }

    fn switches(pairs: &[(&str, &str)]) -> BootSwitches {
        BootSwitches::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| OsString::from(v))
        })
    }

    #[test]
    fn test_switches_from_environment() {
        assert_eq!(switches(&[]), BootSwitches::default());
        assert_eq!(
            switches(&[(IN_PROCESS_ENV, "1"), (BOOT_VERBOSE_ENV, "yes")]),
            BootSwitches {
                in_process: true,
                verbose: true
            }
        );
        for off in ["", "0", "false", "FALSE"] {
            assert!(!switches(&[(IN_PROCESS_ENV, off)]).in_process, "{:?}", off);
        }
    }

    #[test]
    fn test_application_args_are_forwarded_verbatim() {
        let raw = ["app", "--help", "--version", "--boot-verbose", "--in-process", "--", "-v"];
        let args = application_args(raw.iter().map(OsString::from));
        assert_eq!(args, raw[1..].iter().map(OsString::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_builder_rejects_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ContextBuilder::new();
        builder.add(&dir.path().join("missing"));
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_command_sets_only_enumerated_classpath() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ContextBuilder::new();
        builder.add(dir.path());
        let context = builder.build().unwrap();

        let command = context
            .command(Path::new("/bin/true"), &[OsString::from("--flag")])
            .unwrap();
        let envs: Vec<_> = command.get_envs().collect();

        assert!(envs.contains(&(OsStr::new(STAGE_ENV), Some(OsStr::new(STAGE_ISOLATED)))));
        assert!(envs.contains(&(OsStr::new(CLASSPATH_ENV), Some(dir.path().as_os_str()))));
        assert!(envs.contains(&(OsStr::new(STORAGE_ENV), None)));
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec![OsStr::new("--flag")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_lets_child_handle_sigterm() {
        let mut child = Command::new("sh")
            .args(["-c", "trap 'exit 42' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();

        // give the shell time to install its trap
        std::thread::sleep(std::time::Duration::from_millis(300));
        terminate(child.id());

        assert_eq!(exit_code(child.wait().unwrap()), 42);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_passthrough() {
        let status = Command::new("sh").args(["-c", "exit 7"]).status().unwrap();
        assert_eq!(exit_code(status), 7);

        let status = Command::new("sh").args(["-c", "kill -TERM $$"]).status().unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }
}
