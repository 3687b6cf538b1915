use crate::error::ShellError;
use once_cell::sync::Lazy;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, warn};

static HISTORY_PATH: Lazy<Option<PathBuf>> =
    Lazy::new(|| dirs_next::home_dir().map(|home| home.join(".fsh_history")));

/// One result of asking for the next line.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Line(String),
    /// Ctrl-C typed at the prompt itself.
    Interrupted,
    Eof,
}

/// Blocking source of input lines.
pub trait LineSource {
    /// Reads one line. A read cut short by signal delivery comes back as
    /// `ShellError::InputInterrupted` and should simply be retried.
    fn read_line(&mut self, prompt: &str) -> Result<Input, ShellError>;
}

/// Line editing with persistent history, for a terminal on stdin.
pub struct Interactive {
    editor: DefaultEditor,
}

impl Interactive {
    pub fn new() -> Result<Self, ShellError> {
        let mut editor =
            DefaultEditor::new().map_err(|e| ShellError::InputFailure(e.to_string()))?;
        if let Some(path) = &*HISTORY_PATH {
            if editor.load_history(path).is_err() {
                debug!(path = %path.display(), "no history loaded");
            }
        }
        Ok(Interactive { editor })
    }
}

impl LineSource for Interactive {
    fn read_line(&mut self, prompt: &str) -> Result<Input, ShellError> {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                    if let Some(path) = &*HISTORY_PATH {
                        if let Err(e) = self.editor.save_history(path) {
                            warn!(%e, "cannot save history");
                        }
                    }
                }
                Ok(Input::Line(line))
            }
            Err(ReadlineError::Interrupted) => Ok(Input::Interrupted),
            Err(ReadlineError::Eof) => Ok(Input::Eof),
            Err(ReadlineError::Io(e)) if e.kind() == ErrorKind::Interrupted => {
                Err(ShellError::InputInterrupted)
            }
            Err(e) => Err(ShellError::InputFailure(e.to_string())),
        }
    }
}

/// Stdin lines gathered by a single reader thread.
///
/// The dispatch loop and the interrupt confirmation both read through the
/// feed, so nothing else ever touches stdin. While a question is open the
/// loop gets no lines; the first line that arrives after the question is
/// its answer. The thread only reads while someone is waiting, so a
/// foreground program can still read stdin in between.
pub struct LineFeed {
    state: Mutex<FeedState>,
    ready: Condvar,
}

#[derive(Default)]
struct FeedState {
    lines: VecDeque<String>,
    end: Option<FeedEnd>,
    questions: usize,
    /// A reader is blocked with nothing to take.
    starved: bool,
}

enum FeedEnd {
    Eof,
    Failed(String),
}

impl LineFeed {
    pub fn stdin() -> Result<Arc<Self>, ShellError> {
        LineFeed::spawn(BufReader::new(io::stdin()))
    }

    /// Starts the reader thread over `reader`.
    pub fn spawn<R>(reader: R) -> Result<Arc<Self>, ShellError>
    where
        R: BufRead + Send + 'static,
    {
        let feed = Arc::new(LineFeed {
            state: Mutex::new(FeedState::default()),
            ready: Condvar::new(),
        });
        let pump = feed.clone();
        thread::Builder::new()
            .name("line-feed".to_string())
            .spawn(move || pump.pump(reader))
            .map_err(|e| ShellError::InputFailure(e.to_string()))?;
        Ok(feed)
    }

    fn pump<R: BufRead>(&self, mut reader: R) {
        loop {
            {
                let mut state = self.lock();
                while !state.starved {
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
            let mut line = String::new();
            let end = match reader.read_line(&mut line) {
                Ok(0) => Some(FeedEnd::Eof),
                Ok(_) => None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Some(FeedEnd::Failed(e.to_string())),
            };
            let done = end.is_some();
            {
                let mut state = self.lock();
                match end {
                    Some(end) => state.end = Some(end),
                    None => state.lines.push_back(line),
                }
                state.starved = false;
            }
            self.ready.notify_all();
            if done {
                debug!("stdin closed");
                return;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks for the next line meant for the dispatch loop.
    pub fn next_line(&self) -> Result<Input, ShellError> {
        let mut state = self.lock();
        loop {
            if state.questions == 0 {
                if let Some(line) = state.lines.pop_front() {
                    return Ok(Input::Line(line));
                }
                match &state.end {
                    Some(FeedEnd::Eof) => return Ok(Input::Eof),
                    Some(FeedEnd::Failed(e)) => return Err(ShellError::InputFailure(e.clone())),
                    None => {}
                }
            }
            state.starved = true;
            self.ready.notify_all();
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Asks `question` on stderr and waits for the next line typed after it.
    /// `None` once input has ended.
    fn answer(&self, question: &str) -> Option<String> {
        let mut state = self.lock();
        state.questions += 1;
        let typed_before = state.lines.len();
        eprint!("\n{} (y/n): ", question);
        let _ = io::stderr().flush();
        let answer = loop {
            if state.lines.len() > typed_before {
                break state.lines.remove(typed_before);
            }
            if state.end.is_some() {
                break None;
            }
            state.starved = true;
            self.ready.notify_all();
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        };
        state.questions -= 1;
        drop(state);
        self.ready.notify_all();
        answer
    }
}

/// Line reader for scripts and pipes, fed by a [`LineFeed`].
pub struct Plain {
    emit_prompt: bool,
    feed: Arc<LineFeed>,
}

impl Plain {
    pub fn new(emit_prompt: bool, feed: Arc<LineFeed>) -> Self {
        Plain { emit_prompt, feed }
    }
}

impl LineSource for Plain {
    fn read_line(&mut self, prompt: &str) -> Result<Input, ShellError> {
        if self.emit_prompt {
            print!("{}", prompt);
            let _ = io::stdout().flush();
        }
        self.feed.next_line()
    }
}

/// Asks the user a yes/no question.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

fn affirmative(answer: &str) -> bool {
    matches!(answer.trim_start().chars().next(), Some('y' | 'Y'))
}

impl Confirm for LineFeed {
    fn confirm(&self, question: &str) -> bool {
        self.answer(question).map_or(false, |answer| affirmative(&answer))
    }
}

/// Asks on stderr and reads the answer straight from the terminal, for use
/// next to the line editor. End of input means no.
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str) -> bool {
        eprint!("\n{} (y/n): ", question);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        loop {
            match io::stdin().read_line(&mut answer) {
                Ok(0) => return false,
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        affirmative(&answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn feed() -> (Arc<LineFeed>, UnixStream) {
        let (writer, reader) = UnixStream::pair().unwrap();
        (LineFeed::spawn(BufReader::new(reader)).unwrap(), writer)
    }

    fn starve(feed: &LineFeed) {
        feed.lock().starved = true;
        feed.ready.notify_all();
    }

    fn wait_until(feed: &LineFeed, ready: impl Fn(&FeedState) -> bool) {
        while !ready(&*feed.lock()) {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_lines_then_sticky_eof() {
        let (feed, mut writer) = feed();
        writer.write_all(b"true # sleep 1\nwaitall\n").unwrap();
        drop(writer);
        assert_eq!(
            feed.next_line().unwrap(),
            Input::Line("true # sleep 1\n".to_string())
        );
        assert_eq!(feed.next_line().unwrap(), Input::Line("waitall\n".to_string()));
        assert_eq!(feed.next_line().unwrap(), Input::Eof);
        assert_eq!(feed.next_line().unwrap(), Input::Eof);
    }

    #[test]
    fn test_answer_is_not_dispatched() {
        let (feed, mut writer) = feed();
        let waiting = {
            let feed = feed.clone();
            thread::spawn(move || feed.next_line())
        };
        let asking = {
            let feed = feed.clone();
            thread::spawn(move || feed.confirm("Terminate them and exit?"))
        };
        wait_until(&feed, |state| state.questions == 1);
        writer.write_all(b"y\n").unwrap();
        assert!(asking.join().unwrap());

        writer.write_all(b"sleep 1\n").unwrap();
        assert_eq!(
            waiting.join().unwrap().unwrap(),
            Input::Line("sleep 1\n".to_string())
        );
    }

    #[test]
    fn test_lines_typed_before_the_question_stay_queued() {
        let (feed, mut writer) = feed();
        writer.write_all(b"yes\n").unwrap();
        starve(&feed);
        wait_until(&feed, |state| state.lines.len() == 1);
        let asking = {
            let feed = feed.clone();
            thread::spawn(move || feed.confirm("Terminate them and exit?"))
        };
        wait_until(&feed, |state| state.questions == 1);
        writer.write_all(b"n\n").unwrap();
        assert!(!asking.join().unwrap());
        assert_eq!(feed.next_line().unwrap(), Input::Line("yes\n".to_string()));
    }

    #[test]
    fn test_end_of_input_declines() {
        let (feed, writer) = feed();
        drop(writer);
        assert!(!feed.confirm("Terminate them and exit?"));
        assert_eq!(feed.next_line().unwrap(), Input::Eof);
    }

    #[test]
    fn test_affirmative() {
        assert!(affirmative("y\n"));
        assert!(affirmative("  Yes"));
        assert!(!affirmative("n"));
        assert!(!affirmative(""));
    }
}
