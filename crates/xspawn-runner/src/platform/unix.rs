use crate::configuration::Configuration;
use crate::error::RunnerError;
use crate::io::{ExecutionInput, ExecutionOutput};
use crate::types::{ProcessIdentifier, StringOrRawBytes, TerminationStatus};
use nix::sys::signal::{Signal as NixSignal, kill, killpg};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};

/// Hook run in the child after fork and before exec.
///
/// It executes in the forked child, so it must restrict itself to
/// async-signal-safe operations (no allocation, no locks).
pub type ProcessConfigurator = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// A POSIX signal that can be delivered to a child or its process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(NixSignal);

impl Signal {
    pub const INTERRUPT: Self = Self(NixSignal::SIGINT);
    pub const TERMINATE: Self = Self(NixSignal::SIGTERM);
    pub const SUSPEND: Self = Self(NixSignal::SIGSTOP);
    pub const RESUME: Self = Self(NixSignal::SIGCONT);
    pub const KILL: Self = Self(NixSignal::SIGKILL);
    pub const TERMINAL_CLOSED: Self = Self(NixSignal::SIGHUP);
    pub const QUIT: Self = Self(NixSignal::SIGQUIT);
    pub const USER_DEFINED_ONE: Self = Self(NixSignal::SIGUSR1);
    pub const USER_DEFINED_TWO: Self = Self(NixSignal::SIGUSR2);
    pub const ALARM: Self = Self(NixSignal::SIGALRM);
    pub const WINDOW_SIZE_CHANGE: Self = Self(NixSignal::SIGWINCH);

    /// The platform signal number.
    #[must_use]
    pub const fn raw_value(self) -> i32 {
        self.0 as i32
    }

    /// Conventional name, e.g. `SIGKILL`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.0.as_str()
    }
}

impl From<NixSignal> for Signal {
    fn from(signal: NixSignal) -> Self {
        Self(signal)
    }
}

impl TryFrom<i32> for Signal {
    type Error = RunnerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NixSignal::try_from(value)
            .map(Self)
            .map_err(|_| RunnerError::InvalidArgument {
                reason: format!("unknown signal number {value}"),
            })
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unix process-creation options.
#[derive(Clone)]
pub struct PlatformOptions {
    /// Switch the child to this user id before exec.
    pub user_id: Option<u32>,
    /// Switch the child to this group id before exec.
    pub group_id: Option<u32>,
    /// Replace the child's supplementary groups before exec.
    pub supplementary_groups: Option<Vec<u32>>,
    /// Start the child in a new session (`setsid`).
    pub create_session: bool,
    /// Start the child in its own process group so termination reaches its descendants.
    pub create_process_group: bool,
    /// Runs last, after the identity and session changes above.
    pub custom_process_configurator: Option<ProcessConfigurator>,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            group_id: None,
            supplementary_groups: None,
            create_session: false,
            create_process_group: true,
            custom_process_configurator: None,
        }
    }
}

impl fmt::Debug for PlatformOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformOptions")
            .field("user_id", &self.user_id)
            .field("group_id", &self.group_id)
            .field("supplementary_groups", &self.supplementary_groups)
            .field("create_session", &self.create_session)
            .field("create_process_group", &self.create_process_group)
            .field(
                "custom_process_configurator",
                &self.custom_process_configurator.as_ref().map(|_| "<hook>"),
            )
            .finish()
    }
}

impl PlatformOptions {
    /// Whether the child leads its own process group (directly or as a session leader).
    #[must_use]
    pub const fn leads_process_group(&self) -> bool {
        self.create_process_group || self.create_session
    }

    fn needs_pre_exec(&self) -> bool {
        self.create_session
            || self.user_id.is_some()
            || self.group_id.is_some()
            || self.supplementary_groups.is_some()
            || self.custom_process_configurator.is_some()
    }
}

/// A freshly spawned child, not yet waited on.
#[derive(Debug)]
pub(crate) struct SpawnedProcess {
    pub child: Child,
    pub pid: ProcessIdentifier,
    pub process_group: bool,
}

/// Create the child process wired to the child side of each execution value.
///
/// The child receives duplicates of the child-side descriptors; the
/// duplicates are released when the command is dropped at the end of this
/// call, leaving the originals for the caller to close.
pub(crate) fn spawn(
    configuration: &Configuration,
    input: &ExecutionInput,
    output: &ExecutionOutput,
    error: &ExecutionOutput,
) -> Result<SpawnedProcess, RunnerError> {
    validate_strings(configuration)?;

    let working_directory = match configuration.working_directory() {
        Some(dir) if !dir.is_dir() => {
            return Err(RunnerError::WorkingDirectoryNotFound {
                path: dir.to_path_buf(),
            });
        }
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let executable = configuration.executable();
    let executable_path = executable
        .resolve_in(configuration.environment(), &working_directory)
        .ok_or_else(|| RunnerError::ExecutableNotFound {
            executable: executable.to_string(),
        })?;

    let mut command = Command::new(&executable_path);
    let arguments = configuration.arguments();
    if let Some(argv0) = arguments.executable_path_override() {
        command.arg0(argv0.as_os_str());
    }
    command.args(arguments.values().iter().map(StringOrRawBytes::as_os_str));
    configuration.environment().apply(&mut command);
    if configuration.working_directory().is_some() {
        command.current_dir(&working_directory);
    }

    command
        .stdin(Stdio::from(input.child_descriptor()?))
        .stdout(Stdio::from(output.child_descriptor()?))
        .stderr(Stdio::from(error.child_descriptor()?));

    let options = configuration.platform_options();
    if options.create_process_group && !options.create_session {
        command.process_group(0);
    }
    if options.needs_pre_exec() {
        let configure = pre_exec_hook(options);
        // SAFETY: the hook only issues async-signal-safe syscalls on data
        // allocated before the fork, plus the caller's configurator whose
        // contract carries the same requirement.
        unsafe {
            command.pre_exec(configure);
        }
    }

    let child = command.spawn().map_err(|source| RunnerError::Spawn {
        executable: executable.to_string(),
        source,
    })?;
    let raw_pid = child.id().ok_or_else(|| RunnerError::Spawn {
        executable: executable.to_string(),
        source: io::Error::other("child was reaped before its pid was read"),
    })?;
    let pid = ProcessIdentifier::new(i32::try_from(raw_pid).map_err(|_| RunnerError::Spawn {
        executable: executable.to_string(),
        source: io::Error::other(format!("pid {raw_pid} out of range")),
    })?);

    tracing::info!(
        pid = pid.value(),
        executable = %executable_path.display(),
        process_group = options.leads_process_group(),
        "spawned child process"
    );

    Ok(SpawnedProcess {
        child,
        pid,
        process_group: options.leads_process_group(),
    })
}

fn validate_strings(configuration: &Configuration) -> Result<(), RunnerError> {
    let arguments = configuration.arguments();
    if let crate::types::Executable::Named(name) = configuration.executable()
        && name.contains('\0')
    {
        return Err(RunnerError::InvalidArgument {
            reason: "executable name contains a NUL byte".to_string(),
        });
    }
    if arguments.values().iter().any(StringOrRawBytes::contains_nul)
        || arguments
            .executable_path_override()
            .is_some_and(StringOrRawBytes::contains_nul)
    {
        return Err(RunnerError::InvalidArgument {
            reason: "argument contains a NUL byte".to_string(),
        });
    }
    for (key, value) in configuration.environment().entries() {
        if key.as_bytes().is_empty() || key.as_bytes().contains(&b'=') || key.contains_nul() {
            return Err(RunnerError::InvalidArgument {
                reason: format!("invalid environment variable name '{key}'"),
            });
        }
        if value.contains_nul() {
            return Err(RunnerError::InvalidArgument {
                reason: format!("environment variable '{key}' contains a NUL byte"),
            });
        }
    }
    Ok(())
}

fn pre_exec_hook(options: &PlatformOptions) -> impl FnMut() -> io::Result<()> + Send + Sync + 'static {
    let create_session = options.create_session;
    let user_id = options.user_id;
    let group_id = options.group_id;
    let groups: Option<Vec<libc::gid_t>> = options.supplementary_groups.clone();
    let configurator = options.custom_process_configurator.clone();

    move || {
        if create_session && unsafe { libc::setsid() } == -1 {
            return Err(io::Error::last_os_error());
        }
        if let Some(groups) = &groups
            && unsafe { libc::setgroups(groups.len() as _, groups.as_ptr()) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        // Group changes must precede the user change; after setuid the
        // child may no longer be allowed to switch groups.
        if let Some(gid) = group_id
            && unsafe { libc::setgid(gid) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        if let Some(uid) = user_id
            && unsafe { libc::setuid(uid) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        if let Some(configurator) = &configurator {
            configurator()?;
        }
        Ok(())
    }
}

/// Wait until the OS reports the child's exit.
pub(crate) async fn monitor_process_termination(
    mut child: Child,
    pid: ProcessIdentifier,
) -> Result<TerminationStatus, RunnerError> {
    let status = child
        .wait()
        .await
        .map_err(|source| RunnerError::Wait { pid, source })?;
    let status = TerminationStatus::from(status);
    tracing::debug!(pid = pid.value(), %status, "child process terminated");
    Ok(status)
}

/// Deliver `signal` to the child, or to its whole process group.
pub(crate) fn send_signal(
    pid: ProcessIdentifier,
    signal: Signal,
    to_process_group: bool,
) -> Result<(), RunnerError> {
    let target = Pid::from_raw(pid.value());
    let delivered = if to_process_group {
        killpg(target, signal.0)
    } else {
        kill(target, signal.0)
    };
    delivered.map_err(|source| RunnerError::Signal {
        pid,
        signal,
        process_group: to_process_group,
        source,
    })
}

/// Kill the child's process group (or the child alone when it has no group).
///
/// A target that is already gone is not an error: termination routinely
/// races with the child's own exit.
pub(crate) fn terminate_process_group(
    pid: ProcessIdentifier,
    process_group: bool,
) -> Result<(), RunnerError> {
    match send_signal(pid, Signal::KILL, process_group) {
        Ok(()) => {
            tracing::debug!(pid = pid.value(), process_group, "sent SIGKILL");
            Ok(())
        }
        Err(e) if e.is_no_such_process() => {
            tracing::debug!(pid = pid.value(), "process already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
