/// Sub-commands the shell interprets itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Kill every tracked process and exit with status 0.
    Die,
    /// Block until every background process has exited.
    WaitAll,
}

impl Builtin {
    /// Matches the whole trimmed sub-command exactly; `die now` is a program.
    pub fn recognize(command: &str) -> Option<Builtin> {
        match command.trim() {
            "die" => Some(Builtin::Die),
            "waitall" => Some(Builtin::WaitAll),
            _ => None,
        }
    }
}
