pub use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints a warning. By using our own function for this, it'll be easier to find places that issue
/// warnings if we want to say have a flag to suppress them.
pub fn warning(message: impl Display) {
    println!("WARNING: bold: {message}");
}
