use crate::config::{BackgroundPolicy, ExecMode, ShellConfig};
use crate::error::ShellError;
use crate::jobs::{self, lock, JobKind, Os, ProcessControl, ProcessHandle, SharedJobs};
use crate::parser::Command;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, execvp, fork, getpgrp, setpgid, ForkResult, Pid};
use std::ffi::CString;
use tracing::{debug, warn};

/// Exit status of a child whose program could not be executed.
pub const EXEC_FAILURE_STATUS: i32 = 127;

const INTERPRETER: &str = "/bin/sh";

/// Which process group a new child ends up in.
#[derive(Debug, Clone, Copy)]
enum Group {
    /// Stay in the shell's group, so terminal reads keep working.
    Shell(Pid),
    /// Lead a fresh group.
    New,
    /// Join an existing job's group.
    Join(Pid),
}

/// Everything the child needs, prepared before `fork` so the child does not
/// allocate between `fork` and `exec`.
struct Image {
    argv: Vec<CString>,
    failure: Vec<u8>,
}

impl Image {
    fn new(command: &Command, mode: ExecMode) -> Result<Image, ShellError> {
        let words: Vec<&str> = match mode {
            ExecMode::Direct => command.argv.iter().map(String::as_str).collect(),
            ExecMode::Interpreter => vec![INTERPRETER, "-c", command.text.as_str()],
        };
        let program = words.first().ok_or(ShellError::EmptyCommand)?;
        let failure = format!(
            "fsh: {}: ",
            ShellError::ExecFailure {
                program: program.to_string()
            }
        );
        let argv = words
            .iter()
            .map(|w| CString::new(*w).map_err(|_| ShellError::InvalidArgument(w.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Image {
            argv,
            failure: failure.into_bytes(),
        })
    }
}

/// What a successful launch registered.
#[derive(Debug)]
pub struct Launched {
    pub id: usize,
    pub handles: Vec<ProcessHandle>,
}

/// Turns parsed sub-commands into registered OS processes.
pub struct Launcher {
    mode: ExecMode,
    policy: BackgroundPolicy,
    shell_group: Pid,
}

impl Launcher {
    pub fn new(config: &ShellConfig) -> Self {
        Launcher {
            mode: config.exec_mode,
            policy: config.background_policy,
            shell_group: getpgrp(),
        }
    }

    /// Creates the process(es) for `command` and registers them as `kind`.
    ///
    /// The registry stays locked from the capacity check until registration,
    /// so the relay never sees a child the registry does not know about.
    pub fn launch(
        &self,
        jobs: &SharedJobs,
        command: &Command,
        kind: JobKind,
    ) -> Result<Launched, ShellError> {
        let image = Image::new(command, self.mode)?;
        let mut registry = lock(jobs);
        match kind {
            JobKind::Foreground => {
                debug_assert!(
                    registry.foreground().is_none(),
                    "foreground launched while another is outstanding"
                );
                registry.ensure_foreground_free()?;
                let handle = spawn(&image, Group::Shell(self.shell_group), &command.text)?;
                match registry.register_foreground(handle, &command.text) {
                    Ok(id) => Ok(Launched {
                        id,
                        handles: vec![handle],
                    }),
                    Err(e) => {
                        abandon(&[handle]);
                        Err(e)
                    }
                }
            }
            JobKind::Background => {
                registry.ensure_capacity()?;
                let primary = spawn(&image, Group::New, &command.text)?;
                let mut handles = vec![primary];
                if self.policy == BackgroundPolicy::Paired {
                    match spawn(&image, Group::Join(primary.pid()), &command.text) {
                        Ok(helper) => handles.push(helper),
                        Err(e) => warn!(%e, "helper process not started, job runs alone"),
                    }
                }
                match registry.register_background(handles.clone(), &command.text) {
                    Ok(id) => Ok(Launched { id, handles }),
                    Err(e) => {
                        abandon(&handles);
                        Err(e)
                    }
                }
            }
        }
    }
}

fn spawn(image: &Image, group: Group, command: &str) -> Result<ProcessHandle, ShellError> {
    // SAFETY: the child only makes async-signal-safe calls before exec/_exit.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_child(image, group),
        Ok(ForkResult::Parent { child }) => {
            let handle = match group {
                Group::Shell(pgid) => ProcessHandle::new(child, pgid),
                Group::New => ProcessHandle::leader(child),
                Group::Join(pgid) => ProcessHandle::new(child, pgid),
            };
            // Racing the child's own setpgid; whichever runs first wins.
            if !matches!(group, Group::Shell(_)) {
                match setpgid(child, handle.pgid()) {
                    Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!(pid = %child, %e, "setpgid failed"),
                }
            }
            debug!(pid = %child, pgid = %handle.pgid(), command, "process started");
            Ok(handle)
        }
        Err(source) => Err(ShellError::LaunchFailure {
            command: command.to_string(),
            source,
        }),
    }
}

fn exec_child(image: &Image, group: Group) -> ! {
    let zero = Pid::from_raw(0);
    match group {
        Group::Shell(_) => {}
        Group::New => {
            let _ = setpgid(zero, zero);
        }
        Group::Join(pgid) => {
            let _ = setpgid(zero, pgid);
        }
    }
    // Ctrl-C belongs to the shell. An ignored disposition survives exec.
    // SAFETY: installing SIG_IGN runs no handler code.
    let _ = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) };

    let err = match execvp(&image.argv[0], &image.argv) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    let _ = unistd::write(libc::STDERR_FILENO, &image.failure);
    let _ = unistd::write(libc::STDERR_FILENO, err.desc().as_bytes());
    let _ = unistd::write(libc::STDERR_FILENO, b"\n");
    // SAFETY: _exit skips atexit handlers and stdio flushing inherited from the shell.
    unsafe { libc::_exit(EXEC_FAILURE_STATUS) }
}

/// Kills and reaps children that could not be registered.
fn abandon(handles: &[ProcessHandle]) {
    for handle in handles {
        let _ = Os.signal(handle.signal_target(), Signal::SIGKILL);
        jobs::wait_until_exit(&Os, handle.pid());
    }
}
