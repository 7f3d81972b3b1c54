//! Log formatting for the agent.
//!
//! Lines look like `APM_AGENT | DEBUG | harvest{cycle=3}: message`, which keeps
//! agent output easy to pick out of the host application's logs.

use std::error::Error;
use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

pub const LOG_PREFIX: &str = "APM_AGENT";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn filter(level: LogLevel) -> Result<EnvFilter, Box<dyn Error + Send + Sync>> {
    Ok(EnvFilter::try_new(level.as_ref().to_lowercase())?)
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(level: LogLevel) -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = filter(level)?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Logging subsystem enabled at {}", level.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
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
    fn test_filter_follows_configured_level() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(
                filter(level).unwrap().max_level_hint(),
                Some(level.as_level_filter()),
                "{}",
                level.as_ref()
            );
        }
    }

    #[test]
    fn test_prefix_and_spans() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .event_format(Formatter)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("harvest", cycle = 3);
            let _entered = span.enter();
            tracing::warn!("reporter failed");
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output, "APM_AGENT | WARN | harvest{cycle=3}: reporter failed\n");
    }
}
