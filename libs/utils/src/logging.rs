use std::fs::File;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Context;
use strum_macros::{EnumString, VariantNames};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(EnumString, strum_macros::Display, VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
    Test,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        LogFormat::from_str(s).with_context(|| {
            format!(
                "Unrecognized log format. Please specify one of: {:?}",
                LogFormat::VARIANTS
            )
        })
    }
}

/// Where the logging should output to.
pub enum Output {
    Stdout,
    Stderr,
    /// Append to an already opened file. Used by tests that inspect the emitted lines.
    File(File),
}

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Fails if a global subscriber
/// has already been installed in this process.
pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    // We fall back to printing all spans at info-level or above if
    // the RUST_LOG environment variable is not set.
    let rust_log_env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let writer = match output {
        Output::Stdout => BoxMakeWriter::new(std::io::stdout),
        Output::Stderr => BoxMakeWriter::new(std::io::stderr),
        Output::File(file) => BoxMakeWriter::new(Mutex::new(file)),
    };

    use tracing_subscriber::prelude::*;
    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    let log_layer = match log_format {
        LogFormat::Json => log_layer.json().boxed(),
        LogFormat::Plain => log_layer.boxed(),
        LogFormat::Test => log_layer.with_test_writer().boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(rust_log_env_filter))
        .try_init()
        .context("install global tracing subscriber")?;

    Ok(())
}

/// Replace the default rust panic hook with one that logs the panic through tracing.
///
/// Panics inside background tasks are caught and reported by the task supervisor, but the
/// message itself only reaches the log through this hook.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicHookInfo) {
    let location = info.location();

    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<dyn Any>",
        },
    };

    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");

    let _entered = if let Some(location) = location {
        tracing::error_span!("panic", %thread, location = %PrettyLocation(location))
    } else {
        tracing::error_span!("panic", %thread)
    }
    .entered();

    tracing::error!("{msg}");
}

struct PrettyLocation<'a, 'b>(&'a std::panic::Location<'b>);

impl std::fmt::Display for PrettyLocation<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_config() {
        assert_eq!(LogFormat::from_config("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_config("plain").unwrap(), LogFormat::Plain);
        let err = LogFormat::from_config("yaml").unwrap_err();
        assert!(format!("{err:#}").contains("Unrecognized log format"));
    }
}
