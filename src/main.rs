//! polcache: index policy definition trees and search them from the shell
//!
//! Subcommands map onto `PolicyCache` operations; see `polcache --help`.
//! Failures print the full context chain and exit with a status from
//! [`policy_cache::cli::exit_code`].

use clap::Parser;

use policy_cache::cli::{exit_code, Cli};
use policy_cache::output;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        output::error(&format!("polcache: {:#}", e));
        std::process::exit(exit_code(&e));
    }
}
