use crate::error::ShellError;
use crate::jobs::DEFAULT_MAX_BACKGROUND;
use crate::parser::{DEFAULT_MAX_ARGS, DEFAULT_MAX_COMMANDS};

/// How a sub-command becomes a process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Tokenize into argv and exec the program through `PATH`.
    Direct,
    /// Hand the whole sub-command to `/bin/sh -c`.
    Interpreter,
}

/// How many processes a background job consists of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundPolicy {
    Single,
    /// A primary plus a helper running the same command in the primary's
    /// process group. Both are signalled and reaped.
    Paired,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub emit_prompt: bool,
    pub verbose: bool,
    pub max_commands: usize,
    pub max_background: usize,
    pub max_args: usize,
    pub exec_mode: ExecMode,
    pub background_policy: BackgroundPolicy,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            emit_prompt: true,
            verbose: false,
            max_commands: DEFAULT_MAX_COMMANDS,
            max_background: DEFAULT_MAX_BACKGROUND,
            max_args: DEFAULT_MAX_ARGS,
            exec_mode: ExecMode::Direct,
            background_policy: BackgroundPolicy::Single,
        }
    }
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Run(ShellConfig),
    Help,
}

impl ShellConfig {
    /// Parses the flags following the program name.
    pub fn from_args<I>(args: I) -> Result<Invocation, ShellError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = ShellConfig::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" => return Ok(Invocation::Help),
                "-v" => config.verbose = true,
                "-p" => config.emit_prompt = false,
                "-c" => config.exec_mode = ExecMode::Interpreter,
                "-2" => config.background_policy = BackgroundPolicy::Paired,
                "-n" => config.max_commands = limit(&arg, args.next())?,
                "-j" => config.max_background = limit(&arg, args.next())?,
                "-a" => config.max_args = limit(&arg, args.next())?,
                other => return Err(ShellError::Config(format!("unknown option `{}`", other))),
            }
        }
        Ok(Invocation::Run(config))
    }
}

fn limit(flag: &str, value: Option<String>) -> Result<usize, ShellError> {
    let value = value.ok_or_else(|| ShellError::Config(format!("{} needs a value", flag)))?;
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ShellError::Config(format!(
            "{} expects a positive integer, got `{}`",
            flag, value
        ))),
    }
}

pub fn usage() -> &'static str {
    "Usage: fsh [-hvpc2] [-n commands] [-j jobs] [-a args]\n   \
     -h   Print this help message\n   \
     -v   Enable verbose mode\n   \
     -p   Do not print a command prompt\n   \
     -c   Run each sub-command through /bin/sh -c\n   \
     -2   Run every background job as a primary and a helper process\n   \
     -n   Sub-commands accepted per line\n   \
     -j   Background jobs tracked at once\n   \
     -a   Arguments accepted per sub-command"
}
