use tracing::Level;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Installs a formatting subscriber printing events up to `level`.
///
/// Records of the `log` facade, used by the `qport` crates, are forwarded
/// to the same subscriber.
///
/// # Errors
///
/// Fails if a global subscriber or logger is already installed.
pub fn init_logging(level: Level) -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish()
        .try_init()
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::init_logging;

    #[test]
    fn test_single_install() {
        assert!(init_logging(Level::DEBUG).is_ok());
        log::info!("forwarded from the log facade");
        assert!(init_logging(Level::INFO).is_err());
    }
}
