//! Process-wide tracing setup. Library crates only emit events; the binary
//! installs the subscriber once.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

/// Pick the filter: an explicit command-line directive first, then
/// `RUST_LOG`, then the `[logging]` section.
pub fn build_filter(logging: &LoggingSection, cli_filter: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Some(directive) = cli_filter {
        return EnvFilter::try_new(directive).with_context(|| format!("invalid log filter {directive:?}"));
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .with_context(|| format!("invalid log filter {:?}", logging.filter))
}

/// Install a compact fmt subscriber using [`build_filter`].
pub fn init_tracing(logging: &LoggingSection, cli_filter: Option<&str>) -> anyhow::Result<()> {
    let filter = build_filter(logging, cli_filter)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .with_thread_ids(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        let logging = LoggingSection {
            filter: "error".into(),
            ..LoggingSection::default()
        };

        std::env::set_var("RUST_LOG", "warn");
        let from_cli = build_filter(&logging, Some("hive_agent=trace")).unwrap();
        let from_env = build_filter(&logging, None).unwrap();
        std::env::remove_var("RUST_LOG");
        let from_config = build_filter(&logging, None).unwrap();

        assert_eq!(from_cli.to_string(), "hive_agent=trace");
        assert_eq!(from_env.to_string(), "warn");
        assert_eq!(from_config.to_string(), "error");
        assert!(build_filter(&logging, Some("hive_agent=loud")).is_err());
    }
}
