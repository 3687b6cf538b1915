use crate::error::ShellError;

/// Character separating the sub-commands of one input line.
pub const JOB_SEPARATOR: char = '#';
pub const DEFAULT_MAX_COMMANDS: usize = 5;
pub const DEFAULT_MAX_ARGS: usize = 128;

/// An input line divided into its sub-commands.
#[derive(Debug, PartialEq, Eq)]
pub struct SplitLine {
    /// Trimmed, non-empty sub-commands in input order.
    pub commands: Vec<String>,
    /// Sub-commands beyond the limit that were left out.
    pub ignored: usize,
}

/// Splits `line` on the job separator, keeping at most `max` sub-commands.
/// Empty segments (`a ## b`, trailing `#`) do not count.
pub fn split_jobs(line: &str, max: usize) -> SplitLine {
    let mut segments = line
        .split(JOB_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let commands: Vec<String> = segments.by_ref().take(max).map(String::from).collect();
    SplitLine {
        commands,
        ignored: segments.count(),
    }
}

/// One sub-command ready to launch.
#[derive(Debug)]
pub struct Command {
    /// The trimmed sub-command text, used for `sh -c` and for reporting.
    pub text: String,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Arguments dropped because argv hit the limit.
    pub truncated: usize,
}

/// Tokenizes a sub-command into argv, bounded to `max_args` entries.
pub fn parse_command(text: &str, max_args: usize) -> Result<Command, ShellError> {
    let mut argv = tokenize(text);
    if argv.is_empty() {
        return Err(ShellError::EmptyCommand);
    }
    let truncated = argv.len().saturating_sub(max_args);
    argv.truncate(max_args);
    Ok(Command {
        text: text.trim().to_string(),
        argv,
        truncated,
    })
}

/// Splits a sub-command on whitespace, keeping single- or double-quoted
/// spans together as one token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
            if c == '"' || c == '\'' {
                for q in chars.by_ref() {
                    if q == c {
                        break;
                    }
                    token.push(q);
                }
            } else {
                token.push(c);
            }
        }
        tokens.push(token);
    }
    tokens
}
