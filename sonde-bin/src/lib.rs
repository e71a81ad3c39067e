//! Shared plumbing for the Sonde demo binaries.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Initializes env_logger behind an indicatif progress display.
///
/// Log records route through the progress area so bars are not torn apart
/// by interleaved lines. Filtering follows `RUST_LOG`, defaulting to info.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let env = env_logger::Env::default().default_filter_or("info");
    let logger = env_logger::Builder::from_env(env).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
