use std::fmt::{self, Write as _};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Line format: `[timestamp] [tunnel-<component>] [level] message key=value...`
pub struct TunnelLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl TunnelLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Component column: an explicit `component` field wins, otherwise the
    /// last segment of the event target
    fn format_component(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => match target.rsplit("::").next() {
                Some(last) if target.starts_with("tunnel") && last != "tunnel" => format!("{}-{}", self.service_name, last),
                _ => self.service_name.clone(),
            },
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{truncated}…")
        } else {
            format!("{name:<COMPONENT_WIDTH$}")
        }
    }

    fn format_level(level: &tracing::Level) -> String {
        let label = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        format!("{label:<LOG_LEVEL_WIDTH$}")
    }

    fn level_color(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for TunnelLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.level_color(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{cyan}[{timestamp}] [{}] [{color}{}{reset}] ",
            self.format_component(visitor.component.as_deref(), metadata.target()),
            Self::format_level(level),
        )?;
        writeln!(writer, "{}{}{reset}", visitor.message, visitor.fields)
    }
}

/// Splits an event into its message, component and remaining fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(&rendered);
        match field.name() {
            "message" => self.message = unquoted.to_string(),
            "component" => self.component = Some(unquoted.to_string()),
            name => {
                let _ = write!(self.fields, " {name}={unquoted}");
            }
        }
    }
}

fn is_terminal() -> bool {
    matches!(std::env::var("TERM"), Ok(term) if term != "dumb")
}
