use std::sync::Once;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogLevel;
use crate::error::{RelayError, Result};

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// Only the first call has any effect. An already installed subscriber is
/// left in place.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let directive = |s: String| -> Result<Directive> {
        s.parse()
            .map_err(|e| RelayError::config(format!("Invalid log directive: {}", e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(directive(format!("tunguard_relay={}", tracing_level))?)
        .add_directive(directive(format!("tunguard={}", tracing_level))?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        assert!(init_logging(LogLevel::Debug).is_ok());
        assert!(init_logging(LogLevel::Error).is_ok());
    }
}
