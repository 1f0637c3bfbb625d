//! Shelflife.
//!
//! Command line companion of the shelflife caches. It produces the seed snapshots shipped with a
//! deployment, shows which snapshot a failing fetch would fall back to, and cleans up the
//! volatile snapshot directory.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
