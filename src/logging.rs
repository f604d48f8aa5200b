use anyhow::{Context as _, anyhow};
use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Installs the process-wide subscriber writing to stderr.
///
/// The filter comes from `--log-level` when given, else `RUST_LOG`, else `info`
/// (`debug` with `-v`).
pub fn init(verbose: bool, cli_level: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(verbose, cli_level, env.as_deref())?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.compact().with_target(false).try_init(),
    }
    .map_err(|err| anyhow!("install log subscriber: {err}"))
}

fn log_filter(verbose: bool, cli_level: Option<&str>, env: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Some(level) = cli_level {
        let level = level.trim().parse::<LevelFilter>().map_err(|_| {
            anyhow!("invalid log level `{level}`; expected one of trace, debug, info, warn, error, off")
        })?;
        return Ok(EnvFilter::new(level.to_string()));
    }

    if let Some(directives) = env.map(str::trim).filter(|directives| !directives.is_empty()) {
        return EnvFilter::try_new(directives)
            .with_context(|| format!("parse {} `{directives}`", EnvFilter::DEFAULT_ENV));
    }

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    Ok(EnvFilter::new(level.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serde_json::Value;
    use tracing_subscriber::filter::LevelFilter;

    use super::log_filter;

    fn max_level(verbose: bool, cli_level: Option<&str>, env: Option<&str>) -> Option<LevelFilter> {
        log_filter(verbose, cli_level, env).unwrap().max_level_hint()
    }

    #[test]
    fn defaults_to_info_and_verbose_means_debug() {
        assert_eq!(max_level(false, None, None), Some(LevelFilter::INFO));
        assert_eq!(max_level(true, None, None), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn rust_log_applies_without_cli_level() {
        assert_eq!(max_level(false, None, Some("mitmcache=trace")), Some(LevelFilter::TRACE));
        assert_eq!(max_level(true, None, Some("  ")), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn cli_level_beats_rust_log_and_verbose() {
        assert_eq!(max_level(true, Some("WARN"), Some("trace")), Some(LevelFilter::WARN));
    }

    #[test]
    fn rejects_unknown_level() {
        let err = log_filter(false, Some("verbose"), None).unwrap_err();
        assert!(err.to_string().contains("invalid log level"), "error: {err}");
    }

    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines_carry_level_message_and_fields() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(log_filter(false, None, None).unwrap())
            .json()
            .with_writer(move || Buffer(Arc::clone(&writer)))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("dropped below info");
            tracing::info!(key = "fa7af48cb9", "recorded");
        });

        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1, "output: {output}");
        let line: Value = serde_json::from_str(lines[0]).unwrap();
        assert!(line.get("timestamp").is_some(), "line: {line}");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["fields"]["message"], "recorded");
        assert_eq!(line["fields"]["key"], "fa7af48cb9");
    }
}
