//! Logging initialization

fn builder() -> env_logger::Builder {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
}

/// Install env_logger with a default filter of `info`.
///
/// Override with the RUST_LOG environment variable, e.g.
/// `RUST_LOG=brickcache::streaming=trace` for per-brick transitions.
/// Safe to call more than once.
///
/// # Example
/// ```
/// brickcache::core::logging::init();
/// log::info!("Brick cache started");
/// ```
pub fn init() {
    let _ = builder().try_init();
}

/// Same as [`init`] with millisecond timestamps, for command-line tools
pub fn init_with_timestamps() {
    let _ = builder().format_timestamp_millis().try_init();
}
