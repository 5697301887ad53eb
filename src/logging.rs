use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Event formatter for the stderr diagnostics layer.
///
/// qperf's diagnostics are one-line messages aimed at a person running a
/// measurement: version-gate rejections, set-but-unused parameter warnings,
/// per-test failures. Render them the way command-line tools report, a
/// colored severity tag followed by the plain message. Informational lines
/// carry no tag at all, and timestamps or targets belong in the optional
/// log file, not on the terminal.
pub struct DiagnosticFormatter;

fn severity_tag(level: Level) -> Option<ColoredString> {
    match level {
        Level::ERROR => Some("error:".red().bold()),
        Level::WARN => Some("warning:".yellow().bold()),
        Level::INFO => None,
        Level::DEBUG => Some("debug:".blue()),
        Level::TRACE => Some("trace:".purple()),
    }
}

impl<S, N> FormatEvent<S, N> for DiagnosticFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if let Some(tag) = severity_tag(*event.metadata().level()) {
            write!(writer, "{} ", tag)?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
