use crate::builtins::Builtin;
use crate::config::ShellConfig;
use crate::error::ShellError;
use crate::exec::{Launcher, EXEC_FAILURE_STATUS};
use crate::input::{Confirm, Input, LineSource, TerminalConfirm};
use crate::jobs::{self, lock, JobKind, JobRegistry, JobState, SharedJobs};
use crate::parser::{parse_command, split_jobs};
use crate::signals::{Outcome, SignalRelay, Trigger};
use crate::utils::report;
use nix::sys::wait::WaitStatus;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Global prompt string.
pub static PROMPT: &str = "fsh> ";

/// The dispatch loop and everything it owns.
pub struct Shell {
    config: ShellConfig,
    jobs: SharedJobs,
    launcher: Launcher,
    relay: SignalRelay,
}

impl Shell {
    pub fn new(config: ShellConfig) -> Self {
        Shell::with_confirm(config, Arc::new(TerminalConfirm))
    }

    pub fn with_confirm(config: ShellConfig, confirm: Arc<dyn Confirm>) -> Self {
        let jobs = Arc::new(Mutex::new(JobRegistry::new(config.max_background)));
        let relay = SignalRelay::new(jobs.clone(), confirm);
        Shell {
            launcher: Launcher::new(&config),
            config,
            jobs,
            relay,
        }
    }

    #[cfg(test)]
    pub fn jobs(&self) -> &SharedJobs {
        &self.jobs
    }

    /// A handle to the relay, for the signal thread.
    pub fn relay(&self) -> SignalRelay {
        self.relay.clone()
    }

    /// Reads and dispatches lines until the shell should exit; returns the
    /// exit status. Tracked processes are never left behind.
    pub fn run(&mut self, input: &mut dyn LineSource) -> i32 {
        loop {
            self.report_finished();
            match input.read_line(PROMPT) {
                Ok(Input::Line(line)) => {
                    if let Outcome::Exit(code) = self.dispatch(&line) {
                        return code;
                    }
                }
                Ok(Input::Interrupted) => {
                    if let Outcome::Exit(code) = self.relay.handle(Trigger::Interrupt) {
                        return code;
                    }
                    // Nothing pending to discard at the prompt.
                    self.relay.take_discard();
                }
                Ok(Input::Eof) => {
                    debug!("end of input");
                    lock(&self.jobs).terminate_all();
                    return 0;
                }
                Err(ShellError::InputInterrupted) => continue,
                Err(e) => {
                    report(&e);
                    lock(&self.jobs).terminate_all();
                    return 1;
                }
            }
        }
    }

    /// Runs one input line: the first sub-command in the foreground, the
    /// rest in the background, then one reap sweep.
    pub fn dispatch(&mut self, line: &str) -> Outcome {
        // A declined interrupt only drops the line it interrupted.
        self.relay.take_discard();
        let split = split_jobs(line, self.config.max_commands);
        if split.ignored > 0 {
            warn!(
                ignored = split.ignored,
                limit = self.config.max_commands,
                "sub-commands beyond the limit ignored"
            );
        }
        debug!(line = line.trim(), "received command");

        for (index, text) in split.commands.iter().enumerate() {
            if self.relay.take_discard() {
                debug!("rest of the line discarded");
                break;
            }
            match Builtin::recognize(text) {
                Some(Builtin::Die) => {
                    lock(&self.jobs).terminate_all();
                    return Outcome::Exit(0);
                }
                Some(Builtin::WaitAll) => {
                    jobs::reap_blocking_all(&self.jobs);
                    continue;
                }
                None => {}
            }
            let kind = if index == 0 {
                JobKind::Foreground
            } else {
                JobKind::Background
            };
            if let Err(e) = self.run_external(text, kind) {
                report(&e);
            }
        }

        self.reap_sweep();
        Outcome::Continue
    }

    fn run_external(&self, text: &str, kind: JobKind) -> Result<(), ShellError> {
        let command = parse_command(text, self.config.max_args)?;
        if command.truncated > 0 {
            eprintln!(
                "fsh: {}: {} argument(s) past the limit of {} dropped",
                command.argv[0], command.truncated, self.config.max_args
            );
        }
        let launched = self.launcher.launch(&self.jobs, &command, kind)?;
        match kind {
            JobKind::Foreground => {
                let pid = launched.handles[0].pid();
                let status = jobs::wait_foreground(&self.jobs, pid);
                if let Some(WaitStatus::Exited(_, EXEC_FAILURE_STATUS)) = status {
                    debug!(
                        program = %command.argv[0],
                        "foreground job exited with the exec failure status"
                    );
                }
            }
            JobKind::Background => {
                let pids: Vec<String> = launched
                    .handles
                    .iter()
                    .map(|h| h.pid().to_string())
                    .collect();
                println!("[{}] {}", launched.id, pids.join(" "));
            }
        }
        Ok(())
    }

    /// One non-blocking reap plus compaction, every cycle. The registry lock
    /// is only ever held briefly, so waiting for it here is fine.
    fn reap_sweep(&self) {
        let mut registry = lock(&self.jobs);
        registry.reap_non_blocking();
        registry.compact();
        debug_assert!(registry
            .foreground()
            .map_or(true, |job| job.state() != JobState::Terminated));
        debug_assert!(registry
            .background()
            .iter()
            .all(|job| job.kind() == JobKind::Background && job.state() != JobState::Terminated));
        debug!(
            jobs = ?registry
                .background()
                .iter()
                .map(|job| (job.id(), job.command(), job.state(), job.handles().count()))
                .collect::<Vec<_>>(),
            "background after sweep"
        );
    }

    fn report_finished(&self) {
        let finished = lock(&self.jobs).take_finished();
        for job in finished {
            println!("[{}] done {}", job.id, job.command);
        }
    }
}
