//! Version subcommand implementation

pub fn run() {
    println!("poglets {}", env!("CARGO_PKG_VERSION"));
    println!("commit: {}", git_commit());

    #[cfg(target_os = "linux")]
    println!("target: linux");
    #[cfg(target_os = "macos")]
    println!("target: macos");
    #[cfg(target_os = "windows")]
    println!("target: windows");
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    println!("target: unknown");
}

/// Commit baked in through `GIT_COMMIT` at build time.
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}
