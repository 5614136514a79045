//! User-facing terminal messages, kept apart from log output

use owo_colors::OwoColorize;

/// Yellow message padded with blank lines
///
/// ```ignore
/// output::warn("Another process is writing to the cache; try again later.");
/// ```
pub fn warn(message: &str) {
    eprintln!("\n{}\n", message.yellow());
}

/// Red message padded with blank lines
pub fn error(message: &str) {
    eprintln!("\n{}\n", message.red());
}

pub fn info(message: &str) {
    eprintln!("\n{}\n", message);
}
