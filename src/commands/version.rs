//! Command: print version information.

/// The version string embedded at build time.
#[must_use]
pub fn version() -> &'static str {
    option_env!("SPITO_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Print the spito version to stdout.
#[allow(clippy::print_stdout)]
pub fn run() {
    println!("spito {}", version());
}
