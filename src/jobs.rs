use crate::error::ShellError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Default upper bound on tracked background jobs.
pub const DEFAULT_MAX_BACKGROUND: usize = 100;

/// The OS process surface the registry drives: `kill(2)` and `waitpid(2)`.
pub trait ProcessControl {
    fn signal(&self, target: Pid, signal: Signal) -> nix::Result<()>;
    fn wait(&self, pid: Pid, flags: Option<WaitPidFlag>) -> nix::Result<WaitStatus>;
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct Os;

impl ProcessControl for Os {
    fn signal(&self, target: Pid, sig: Signal) -> nix::Result<()> {
        signal::kill(target, sig)
    }

    fn wait(&self, pid: Pid, flags: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
        wait::waitpid(pid, flags)
    }
}

/// One OS process and the process group it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
    pgid: Pid,
}

impl ProcessHandle {
    pub fn new(pid: Pid, pgid: Pid) -> Self {
        ProcessHandle { pid, pgid }
    }

    /// A process that leads its own group.
    pub fn leader(pid: Pid) -> Self {
        ProcessHandle { pid, pgid: pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    /// The identifier `kill` should be given for this process.
    ///
    /// A group leader is signalled through its negative group id so every
    /// process the command forked receives it too. Any other process shares
    /// a group with someone else (the shell, or a paired primary) and is
    /// signalled by pid alone.
    pub fn signal_target(&self) -> Pid {
        if self.pgid == self.pid && self.pid.as_raw() > 1 {
            Pid::from_raw(-self.pgid.as_raw())
        } else {
            self.pid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Suspended,
    Terminated,
}

#[derive(Debug, Clone)]
struct Member {
    handle: ProcessHandle,
    reaped: bool,
}

/// A command the shell launched, made of one or two cooperating processes.
#[derive(Debug, Clone)]
pub struct Job {
    id: usize,
    kind: JobKind,
    state: JobState,
    command: String,
    members: Vec<Member>,
}

impl Job {
    fn new(id: usize, kind: JobKind, handles: Vec<ProcessHandle>, command: String) -> Self {
        Job {
            id,
            kind,
            state: JobState::Running,
            command,
            members: handles
                .into_iter()
                .map(|handle| Member {
                    handle,
                    reaped: false,
                })
                .collect(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle> + '_ {
        self.members.iter().map(|m| &m.handle)
    }

    fn live(&self) -> impl Iterator<Item = &ProcessHandle> + '_ {
        self.members.iter().filter(|m| !m.reaped).map(|m| &m.handle)
    }

    fn holds(&self, pid: Pid) -> bool {
        self.members.iter().any(|m| !m.reaped && m.handle.pid == pid)
    }

    /// Marks `pid` as reaped; the job terminates with its last member.
    fn mark_reaped(&mut self, pid: Pid) -> bool {
        let mut hit = false;
        for member in self.members.iter_mut().filter(|m| m.handle.pid == pid) {
            member.reaped = true;
            hit = true;
        }
        if hit && self.members.iter().all(|m| m.reaped) {
            self.state = JobState::Terminated;
        }
        hit
    }
}

/// A background job that left the registry, kept until the loop reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub id: usize,
    pub command: String,
}

/// Owns the single foreground slot and the ordered background list.
pub struct JobRegistry<P = Os> {
    foreground: Option<Job>,
    background: Vec<Job>,
    capacity: usize,
    next_id: usize,
    finished: Vec<Finished>,
    process: P,
}

/// The registry as shared between the dispatch loop and the signal relay.
pub type SharedJobs<P = Os> = Arc<Mutex<JobRegistry<P>>>;

impl JobRegistry<Os> {
    pub fn new(capacity: usize) -> Self {
        JobRegistry::with_process(capacity, Os)
    }
}

impl<P: ProcessControl> JobRegistry<P> {
    pub fn with_process(capacity: usize, process: P) -> Self {
        JobRegistry {
            foreground: None,
            background: Vec::new(),
            capacity,
            next_id: 1,
            finished: Vec::new(),
            process,
        }
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn foreground(&self) -> Option<&Job> {
        self.foreground.as_ref()
    }

    pub fn background(&self) -> &[Job] {
        &self.background
    }

    /// True when nothing is outstanding at all.
    pub fn is_idle(&self) -> bool {
        self.foreground.is_none() && self.background.is_empty()
    }

    fn tracks(&self, pid: Pid) -> bool {
        self.foreground.iter().any(|job| job.holds(pid))
            || self.background.iter().any(|job| job.holds(pid))
    }

    fn allocate_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Fails with `RegistryBusy` while a foreground job is outstanding.
    pub fn ensure_foreground_free(&self) -> Result<(), ShellError> {
        match &self.foreground {
            Some(job) => Err(ShellError::RegistryBusy {
                pid: job.members[0].handle.pid,
            }),
            None => Ok(()),
        }
    }

    pub fn register_foreground(
        &mut self,
        handle: ProcessHandle,
        command: &str,
    ) -> Result<usize, ShellError> {
        self.ensure_foreground_free()?;
        if self.tracks(handle.pid) {
            return Err(ShellError::AlreadyTracked { pid: handle.pid });
        }
        let id = self.allocate_id();
        debug!(id, pid = %handle.pid, command, "foreground job registered");
        self.foreground = Some(Job::new(
            id,
            JobKind::Foreground,
            vec![handle],
            command.to_string(),
        ));
        Ok(id)
    }

    pub fn clear_foreground(&mut self) {
        if let Some(job) = self.foreground.take() {
            debug!(id = job.id, "foreground slot cleared");
        }
    }

    /// Fails with `RegistryFull` when another background job would not fit.
    pub fn ensure_capacity(&self) -> Result<(), ShellError> {
        if self.background.len() >= self.capacity {
            return Err(ShellError::RegistryFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn register_background(
        &mut self,
        handles: Vec<ProcessHandle>,
        command: &str,
    ) -> Result<usize, ShellError> {
        self.ensure_capacity()?;
        if let Some(handle) = handles.iter().find(|h| self.tracks(h.pid)) {
            return Err(ShellError::AlreadyTracked { pid: handle.pid });
        }
        let id = self.allocate_id();
        debug!(id, processes = handles.len(), command, "background job registered");
        self.background.push(Job::new(
            id,
            JobKind::Background,
            handles,
            command.to_string(),
        ));
        Ok(id)
    }

    /// Sends `sig` to every live process of every job and returns how many
    /// signals went out. Processes that already died are not an error.
    pub fn signal_all(&mut self, sig: Signal) -> usize {
        let process = &self.process;
        let mut sent = 0;
        for job in self.foreground.iter_mut().chain(self.background.iter_mut()) {
            if job.state == JobState::Terminated {
                continue;
            }
            for handle in job.live() {
                match process.signal(handle.signal_target(), sig) {
                    Ok(()) | Err(Errno::ESRCH) => sent += 1,
                    Err(e) => warn!(pid = %handle.pid, %e, "cannot deliver {:?}", sig),
                }
            }
            match sig {
                Signal::SIGSTOP | Signal::SIGTSTP => job.state = JobState::Suspended,
                Signal::SIGCONT => job.state = JobState::Running,
                _ => {}
            }
        }
        debug!(signal = ?sig, sent, "signal broadcast");
        sent
    }

    /// Polls every live background process once, never blocking.
    /// Returns how many processes were reaped.
    pub fn reap_non_blocking(&mut self) -> usize {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let process = &self.process;
        let mut reaped = 0;
        for job in self.background.iter_mut() {
            let live: Vec<Pid> = job.live().map(|h| h.pid).collect();
            for pid in live {
                match process.wait(pid, Some(flags)) {
                    Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
                    Ok(WaitStatus::Stopped(..)) => job.state = JobState::Suspended,
                    Ok(WaitStatus::Continued(_)) => job.state = JobState::Running,
                    Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                        debug!(id = job.id, %pid, ?status, "background process reaped");
                        job.mark_reaped(pid);
                        reaped += 1;
                    }
                    Ok(_) => {}
                    // Someone else collected it; it is gone either way.
                    Err(Errno::ECHILD) => {
                        job.mark_reaped(pid);
                        reaped += 1;
                    }
                    Err(e) => warn!(%pid, %e, "non-blocking wait failed"),
                }
            }
        }
        reaped
    }

    /// Drops terminated background jobs, keeping insertion order of the rest.
    /// Returns how many jobs were removed.
    pub fn compact(&mut self) -> usize {
        let before = self.background.len();
        let finished = &mut self.finished;
        self.background.retain(|job| {
            if job.state == JobState::Terminated {
                finished.push(Finished {
                    id: job.id,
                    command: job.command.clone(),
                });
                false
            } else {
                true
            }
        });
        before - self.background.len()
    }

    /// Completion notices accumulated by `compact`, oldest first.
    pub fn take_finished(&mut self) -> Vec<Finished> {
        std::mem::take(&mut self.finished)
    }

    /// Pids of every background process not yet reaped.
    pub fn outstanding(&self) -> Vec<Pid> {
        self.background
            .iter()
            .flat_map(|job| job.live().map(|h| h.pid))
            .collect()
    }

    /// Records that `pid` has been collected by a wait performed elsewhere.
    pub fn mark_reaped(&mut self, pid: Pid) -> bool {
        self.foreground
            .iter_mut()
            .chain(self.background.iter_mut())
            .any(|job| job.mark_reaped(pid))
    }

    /// Kills every tracked process and blocks until each one is reaped.
    /// Leaves the registry empty; calling it again is a no-op.
    pub fn terminate_all(&mut self) {
        if self.is_idle() {
            return;
        }
        self.signal_all(Signal::SIGKILL);
        let pids: Vec<Pid> = self
            .foreground
            .iter()
            .chain(self.background.iter())
            .flat_map(|job| job.live().map(|h| h.pid))
            .collect();
        for pid in pids {
            wait_until_exit(&self.process, pid);
        }
        debug!(
            background = self.background.len(),
            foreground = self.foreground.is_some(),
            "all jobs terminated"
        );
        self.foreground = None;
        self.background.clear();
    }
}

/// Blocks until `pid` exits, retrying interrupted waits.
///
/// Returns `None` when the process was already collected elsewhere.
pub fn wait_until_exit<P: ProcessControl>(process: &P, pid: Pid) -> Option<WaitStatus> {
    loop {
        match process.wait(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => return Some(status),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return None,
            Err(e) => {
                warn!(%pid, %e, "blocking wait failed");
                return None;
            }
        }
    }
}

/// Locks the registry, recovering it if a previous holder panicked.
pub fn lock<P>(jobs: &Mutex<JobRegistry<P>>) -> MutexGuard<'_, JobRegistry<P>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Waits on the foreground process without holding the registry lock, then
/// clears the slot. Returns the exit report, if the wait saw one.
pub fn wait_foreground<P>(jobs: &Mutex<JobRegistry<P>>, pid: Pid) -> Option<WaitStatus>
where
    P: ProcessControl + Clone,
{
    let process = lock(jobs).process().clone();
    let status = wait_until_exit(&process, pid);
    let mut registry = lock(jobs);
    registry.mark_reaped(pid);
    registry.clear_foreground();
    status
}

/// The `waitall` command: blocks until every background process has been
/// reaped, then compacts.
///
/// Each wait happens with the lock released so the signal relay keeps
/// working while the loop is parked here. An interrupted wait is retried.
pub fn reap_blocking_all<P>(jobs: &Mutex<JobRegistry<P>>)
where
    P: ProcessControl + Clone,
{
    loop {
        let (process, pending) = {
            let registry = lock(jobs);
            (registry.process().clone(), registry.outstanding())
        };
        if pending.is_empty() {
            break;
        }
        for pid in pending {
            wait_until_exit(&process, pid);
            lock(jobs).mark_reaped(pid);
        }
    }
    lock(jobs).compact();
}
