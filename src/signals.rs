use crate::error::ShellError;
use crate::input::Confirm;
use crate::jobs::{lock, Os, ProcessControl, SharedJobs};
use nix::sys::signal::Signal;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGTSTP};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// What an incoming signal asks the shell to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-Z.
    Suspend,
    ChildExited,
    /// The terminal went away or someone asked the shell to stop.
    Hangup,
}

impl Trigger {
    pub fn from_raw(signal: i32) -> Option<Trigger> {
        match signal {
            SIGINT => Some(Trigger::Interrupt),
            SIGTSTP => Some(Trigger::Suspend),
            SIGCHLD => Some(Trigger::ChildExited),
            SIGHUP | SIGTERM => Some(Trigger::Hangup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit(i32),
}

/// Turns interrupt and suspend triggers into registry actions.
///
/// Handlers installed by [`install`] only queue the signal number; the
/// relay runs on its own thread and reaches the registry through its mutex,
/// so no registry code ever runs in signal-handler context.
#[derive(Clone)]
pub struct SignalRelay<P = Os> {
    jobs: SharedJobs<P>,
    confirm: Arc<dyn Confirm>,
    discard: Arc<AtomicBool>,
}

impl<P: ProcessControl> SignalRelay<P> {
    pub fn new(jobs: SharedJobs<P>, confirm: Arc<dyn Confirm>) -> Self {
        SignalRelay {
            jobs,
            confirm,
            discard: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once after a declined interrupt: the rest of the line is dropped.
    pub fn take_discard(&self) -> bool {
        self.discard.swap(false, Ordering::SeqCst)
    }

    pub fn handle(&self, trigger: Trigger) -> Outcome {
        match trigger {
            Trigger::Interrupt => self.interrupt(),
            Trigger::Suspend => {
                let sent = lock(&self.jobs).signal_all(Signal::SIGSTOP);
                eprintln!("\nfsh: suspended {} process(es)", sent);
                Outcome::Continue
            }
            Trigger::ChildExited => {
                lock(&self.jobs).reap_non_blocking();
                Outcome::Continue
            }
            Trigger::Hangup => {
                lock(&self.jobs).terminate_all();
                Outcome::Exit(0)
            }
        }
    }

    fn interrupt(&self) -> Outcome {
        if lock(&self.jobs).is_idle() {
            return Outcome::Exit(0);
        }
        // The lock is not held while waiting for the answer.
        if self
            .confirm
            .confirm("fsh: jobs are still running. Terminate them and exit?")
        {
            eprintln!("fsh: terminating all jobs");
            lock(&self.jobs).terminate_all();
            Outcome::Exit(0)
        } else {
            self.discard.store(true, Ordering::SeqCst);
            Outcome::Continue
        }
    }
}

/// Registers the shell's signals and starts the relay thread.
pub fn install<P>(relay: SignalRelay<P>) -> Result<(), ShellError>
where
    P: ProcessControl + Send + 'static,
{
    let mut signals =
        Signals::new([SIGINT, SIGTSTP, SIGCHLD, SIGHUP, SIGTERM]).map_err(ShellError::Signals)?;
    thread::Builder::new()
        .name("signal-relay".to_string())
        .spawn(move || {
            for raw in signals.forever() {
                let Some(trigger) = Trigger::from_raw(raw) else {
                    continue;
                };
                debug!(?trigger, "signal received");
                if let Outcome::Exit(code) = relay.handle(trigger) {
                    process::exit(code);
                }
            }
        })
        .map_err(ShellError::Signals)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::mock::MockProcess;
    use crate::jobs::{JobRegistry, ProcessHandle};
    use nix::unistd::Pid;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Answer {
        yes: bool,
        asked: AtomicUsize,
    }

    impl Confirm for Answer {
        fn confirm(&self, _question: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.yes
        }
    }

    fn relay(yes: bool) -> (SignalRelay<MockProcess>, MockProcess, Arc<Answer>) {
        let process = MockProcess::default();
        let jobs = Arc::new(Mutex::new(JobRegistry::with_process(8, process.clone())));
        let answer = Arc::new(Answer {
            yes,
            asked: AtomicUsize::new(0),
        });
        (SignalRelay::new(jobs, answer.clone()), process, answer)
    }

    fn populate(relay: &SignalRelay<MockProcess>) {
        let mut jobs = lock(&relay.jobs);
        jobs.register_foreground(ProcessHandle::new(Pid::from_raw(10), Pid::from_raw(1)), "fg")
            .unwrap();
        for raw in [20, 30] {
            jobs.register_background(vec![ProcessHandle::leader(Pid::from_raw(raw))], "bg")
                .unwrap();
        }
    }

    #[test]
    fn test_trigger_mapping() {
        assert_eq!(Trigger::from_raw(SIGINT), Some(Trigger::Interrupt));
        assert_eq!(Trigger::from_raw(SIGTSTP), Some(Trigger::Suspend));
        assert_eq!(Trigger::from_raw(SIGTERM), Some(Trigger::Hangup));
        assert_eq!(Trigger::from_raw(SIGHUP), Some(Trigger::Hangup));
    }

    #[test]
    fn test_interrupt_when_idle_exits_without_asking() {
        let (relay, _, answer) = relay(false);
        assert_eq!(relay.handle(Trigger::Interrupt), Outcome::Exit(0));
        assert_eq!(answer.asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_declined_interrupt_discards_line() {
        let (relay, process, answer) = relay(false);
        populate(&relay);
        assert_eq!(relay.handle(Trigger::Interrupt), Outcome::Continue);
        assert_eq!(answer.asked.load(Ordering::SeqCst), 1);
        assert!(process.signals().is_empty());
        assert_eq!(lock(&relay.jobs).background().len(), 2);
        assert!(relay.take_discard());
        assert!(!relay.take_discard());
    }

    #[test]
    fn test_confirmed_interrupt_kills_everything() {
        let (relay, process, _) = relay(true);
        populate(&relay);
        assert_eq!(relay.handle(Trigger::Interrupt), Outcome::Exit(0));
        assert_eq!(process.count(Signal::SIGKILL), 3);
        assert!(lock(&relay.jobs).is_idle());
    }

    #[test]
    fn test_suspend_signals_without_removing() {
        let (relay, process, answer) = relay(true);
        populate(&relay);
        assert_eq!(relay.handle(Trigger::Suspend), Outcome::Continue);
        assert_eq!(process.count(Signal::SIGSTOP), 3);
        assert_eq!(answer.asked.load(Ordering::SeqCst), 0);
        let jobs = lock(&relay.jobs);
        assert!(jobs.foreground().is_some());
        assert_eq!(jobs.background().len(), 2);
    }

    #[test]
    fn test_child_exit_reaps_background() {
        let (relay, process, _) = relay(true);
        populate(&relay);
        process.exit(20);
        relay.handle(Trigger::ChildExited);
        let mut jobs = lock(&relay.jobs);
        assert_eq!(jobs.compact(), 1);
        assert!(jobs.foreground().is_some());
    }

    #[test]
    fn test_hangup_terminates() {
        let (relay, process, _) = relay(false);
        populate(&relay);
        assert_eq!(relay.handle(Trigger::Hangup), Outcome::Exit(0));
        assert_eq!(process.count(Signal::SIGKILL), 3);
    }
}
