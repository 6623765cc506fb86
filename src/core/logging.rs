use tracing::Level;

/// Install a formatting subscriber for the process.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let _ = init_logging(Level::DEBUG);
        assert!(!init_logging(Level::INFO));
    }
}
