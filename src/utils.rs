use crate::config;
use crate::error::ShellError;
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "FSH_LOG";

pub fn print_usage() -> ! {
    println!("{}", config::usage());
    process::exit(1);
}

/// Reports a failure on stderr without touching the prompt on stdout.
pub fn report(err: &ShellError) {
    debug!(%err, "reported");
    eprintln!("fsh: {}", err);
}

/// Logs go to stderr; `FSH_LOG` overrides the default level.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
