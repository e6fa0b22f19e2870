use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config, cli_level_override)?;

    match resolve_log_format(config) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}

#[cfg(test)]
mod tests {
    use super::{resolve_log_format, resolve_log_level};
    use crate::config::{Config, LogFormat};
    use tracing_subscriber::filter::LevelFilter;

    fn configured_logging() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = "warn"
format = "pretty"
"#,
        )
        .expect("config should parse")
    }

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(
            resolve_log_level(&Config::default(), None).expect("default level should resolve"),
            LevelFilter::INFO
        );
    }

    #[test]
    fn log_level_prefers_cli_override() {
        assert_eq!(
            resolve_log_level(&configured_logging(), Some("debug"))
                .expect("cli level should resolve"),
            LevelFilter::DEBUG
        );
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = resolve_log_level(&Config::default(), Some("verbose")).unwrap_err();
        assert!(
            err.to_string().contains("invalid log level"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn log_format_defaults_to_json_and_can_be_pretty() {
        assert_eq!(resolve_log_format(&Config::default()), LogFormat::Json);
        assert_eq!(resolve_log_format(&configured_logging()), LogFormat::Pretty);
    }
}
