use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Everything that can go wrong inside one dispatch cycle.
///
/// None of these propagate past the loop iteration that produced them;
/// the loop reports them on stderr and moves on.
#[derive(Debug, Error)]
pub enum ShellError {
    /// `fork` itself failed, typically resource exhaustion.
    #[error("cannot create a process for `{command}`: {source}")]
    LaunchFailure {
        command: String,
        #[source]
        source: Errno,
    },

    /// The child could not replace its image. Reported by the child itself;
    /// the parent only sees the distinct exit status.
    #[error("cannot execute `{program}`")]
    ExecFailure { program: String },

    #[error("background job limit of {capacity} reached")]
    RegistryFull { capacity: usize },

    #[error("foreground job {pid} is still outstanding")]
    RegistryBusy { pid: Pid },

    #[error("process {pid} is already tracked")]
    AlreadyTracked { pid: Pid },

    #[error("input interrupted")]
    InputInterrupted,

    #[error("cannot read input: {0}")]
    InputFailure(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("argument contains a NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("{0}")]
    Config(String),

    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}
