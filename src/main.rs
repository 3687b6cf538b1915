mod builtins;
mod config;
mod error;
mod exec;
mod input;
mod jobs;
mod parser;
mod shell;
mod signals;
mod utils;

use config::{Invocation, ShellConfig};
use input::{Interactive, LineFeed, LineSource, Plain};
use shell::Shell;
use std::env;
use std::io::{self, IsTerminal};
use std::process;

fn main() {
    // Parse command-line arguments.
    let config = match ShellConfig::from_args(env::args().skip(1)) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => utils::print_usage(),
        Err(e) => {
            utils::report(&e);
            utils::print_usage();
        }
    };
    utils::init_logging(config.verbose);

    // A terminal gets the line editor; anything else is read by the feed
    // thread, which also answers the interrupt confirmation.
    let editor = if config.emit_prompt && io::stdin().is_terminal() {
        Interactive::new()
            .map_err(|e| utils::report(&e))
            .ok()
    } else {
        None
    };
    let (mut shell, mut input): (Shell, Box<dyn LineSource>) = match editor {
        Some(editor) => (Shell::new(config.clone()), Box::new(editor)),
        None => {
            let feed = match LineFeed::stdin() {
                Ok(feed) => feed,
                Err(e) => {
                    utils::report(&e);
                    process::exit(1);
                }
            };
            (
                Shell::with_confirm(config.clone(), feed.clone()),
                Box::new(Plain::new(config.emit_prompt, feed)),
            )
        }
    };

    // Install signal handlers.
    if let Err(e) = signals::install(shell.relay()) {
        utils::report(&e);
        process::exit(1);
    }

    // Run the main shell loop.
    let code = shell.run(input.as_mut());
    process::exit(code);
}
