use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Default)]
pub struct Logger;

impl Logger {
    /// Install the global subscriber. `mx_level` is the `log.mx` setting and
    /// controls the verbosity of SMTP session logging independently of the
    /// rest of the process.
    pub fn init(mx_level: &str) {
        let level = if let Ok(level) = std::env::var("LOG_LEVEL") {
            Self::parse_level(&level)
        } else if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        let targets = Targets::new()
            .with_default(level)
            .with_target("posthaste_smtp", Self::parse_level(mx_level));

        tracing_subscriber::registry()
            .with(
                (if cfg!(debug_assertions) {
                    tracing_subscriber::fmt::layer()
                } else {
                    tracing_subscriber::fmt::layer()
                        .with_file(false)
                        .with_line_number(false)
                })
                .compact()
                .with_ansi(true)
                .with_filter(targets),
            )
            .init();
    }

    fn parse_level(level: &str) -> LevelFilter {
        match level.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        }
    }
}
