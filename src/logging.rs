//! Logging setup for the CLI. The engine crate only ever calls into
//! `log`'s facade; this is where a real subscriber gets wired in.

use log::LevelFilter;

/// Map a `-v` repeat count to a level. One flag turns on the engine's
/// `debug!` traffic (delta commits, allocator exhaustion); two or more
/// adds per-operation `trace!` noise once the engine starts emitting it.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}
