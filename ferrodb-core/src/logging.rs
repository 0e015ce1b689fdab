// ferrodb-core/src/logging.rs
// Observability setup: the engine emits structured events through the
// `tracing` facade (fields like collection, doc id and tx id ride on the
// event, not inside the message text).
//
// Standalone processes call init() once to install a compact stderr
// subscriber honoring `logging.level`; embedders that already run their
// own subscriber simply skip init() and receive the engine's events
// through it.

use tracing::level_filters::LevelFilter;

/// Map a `logging.level` config string onto a tracing filter.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::OFF),
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

/// Install the process-wide stderr subscriber at the configured level.
///
/// Returns false when the level string is unknown or another subscriber
/// is already installed; the engine keeps running either way, since
/// events flow to whichever subscriber owns the process.
pub fn init(level: &str) -> bool {
    let filter = match parse_level(level) {
        Some(filter) => filter,
        None => return false,
    };
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_known_names() {
        assert_eq!(parse_level("error"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("Info"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("trace"), Some(LevelFilter::TRACE));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
    }

    #[test]
    fn test_parse_level_rejects_unknown_names() {
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level(""), None);
    }

    #[test]
    fn test_init_with_unknown_level_is_refused() {
        assert!(!init("chatty"));
    }
}
