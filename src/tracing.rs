use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Output shape for the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Full format with file/line, used for interactive commands.
    #[default]
    Full,
    /// One compact line per event, used by long-running workers.
    Compact,
}

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set, e.g. `"info,catalogue_ingest=debug"`.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = SubscriberBuilder::default().with_env_filter(filter);
    let res = match format {
        LogFormat::Full => builder
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .try_init(),
        LogFormat::Compact => builder.with_target(false).compact().try_init(),
    };
    res.map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
