//! Tracing setup shared by the sandbox binaries.
//!
//! Everything is driven by environment variables so the worker can be tuned
//! without a config file:
//!
//! - `SANDBOX_LOG_LEVEL`  default filter when `RUST_LOG` is unset (`info`)
//! - `SANDBOX_LOG_OUTPUT` `console`, `file`, `both` or `none`
//! - `SANDBOX_LOG_FORMAT` `human` or `json`
//! - `SANDBOX_LOG_FILE`   log file path, rolled daily
//! - `SANDBOX_LOG_TAGS`   comma separated `field:value` span filters,
//!   e.g. `workshop_id:ws-42` to follow a single workshop through the executors

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            "none" | "off" => LogOutput::None,
            _ => LogOutput::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanTag {
    pub key: String,
    pub value: String,
}

/// Resolved logging settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub file_path: PathBuf,
    pub tags: Vec<SpanTag>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let level = env::var("SANDBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let output = env::var("SANDBOX_LOG_OUTPUT")
            .map(|v| LogOutput::parse(&v))
            .unwrap_or(LogOutput::Console);
        let json = env::var("SANDBOX_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let file_path = env::var("SANDBOX_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("sandbox-worker.log"));
        let tags = env::var("SANDBOX_LOG_TAGS")
            .map(|v| parse_tags(&v))
            .unwrap_or_default();

        Self {
            level,
            output,
            json,
            file_path,
            tags,
        }
    }
}

/// Parses `key:value,key2:value2`. Entries without a colon are ignored.
pub fn parse_tags(raw: &str) -> Vec<SpanTag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(SpanTag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

/// Drops events that are not inside a span carrying every configured tag.
/// A tag value of `*` only requires the field to be present.
struct SpanTagFilter {
    tags: Vec<SpanTag>,
}

impl<S> Layer<S> for SpanTagFilter
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut seen: HashMap<String, String> = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    seen.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.tags.iter().all(|tag| {
            seen.get(&tag.key)
                .is_some_and(|value| tag.value == "*" || value.contains(&tag.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Installs the global subscriber from [`LogSettings::from_env`].
///
/// The returned guard must be held for the lifetime of the process when file
/// output is enabled, otherwise buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level))
        .add_directive(static_directive("sqlx=warn"))
        .add_directive(static_directive("tokio=warn"));

    let subscriber = registry().with(env_filter).with(SpanTagFilter {
        tags: settings.tags.clone(),
    });

    let log_dir = settings
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let log_filename = settings
        .file_path
        .file_name()
        .unwrap_or_else(|| "sandbox-worker.log".as_ref());

    match (settings.output.console(), settings.output.file()) {
        (true, true) => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let writer = MakeTee {
                make_a: std::io::stderr,
                make_b: non_blocking,
            };
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
            Some(guard)
        }
        (true, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
            None
        }
        (false, true) => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            if settings.json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
            Some(guard)
        }
        (false, false) => {
            subscriber.init();
            None
        }
    }
}

fn static_directive(directive: &'static str) -> tracing_subscriber::filter::Directive {
    // Literal directives above are always valid.
    directive
        .parse()
        .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::WARN.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parses_tags_and_skips_garbage() {
        let tags = parse_tags("workshop_id:ws-1, member_id:*,broken,:empty");
        assert_eq!(
            tags,
            vec![
                SpanTag {
                    key: "workshop_id".into(),
                    value: "ws-1".into()
                },
                SpanTag {
                    key: "member_id".into(),
                    value: "*".into()
                },
            ]
        );
    }

    #[test]
    fn output_parsing_defaults_to_console() {
        assert_eq!(LogOutput::parse("both"), LogOutput::Both);
        assert_eq!(LogOutput::parse("FILE"), LogOutput::File);
        assert_eq!(LogOutput::parse("off"), LogOutput::None);
        assert_eq!(LogOutput::parse("whatever"), LogOutput::Console);
    }

    #[test]
    #[serial]
    fn settings_read_from_env() {
        env::set_var("SANDBOX_LOG_LEVEL", "debug");
        env::set_var("SANDBOX_LOG_OUTPUT", "file");
        env::set_var("SANDBOX_LOG_FORMAT", "json");
        env::set_var("SANDBOX_LOG_FILE", "/var/log/sandbox/worker.log");
        env::set_var("SANDBOX_LOG_TAGS", "workshop_id:abc");

        let settings = LogSettings::from_env();

        env::remove_var("SANDBOX_LOG_LEVEL");
        env::remove_var("SANDBOX_LOG_OUTPUT");
        env::remove_var("SANDBOX_LOG_FORMAT");
        env::remove_var("SANDBOX_LOG_FILE");
        env::remove_var("SANDBOX_LOG_TAGS");

        assert_eq!(settings.level, "debug");
        assert_eq!(settings.output, LogOutput::File);
        assert!(settings.json);
        assert_eq!(
            settings.file_path,
            PathBuf::from("/var/log/sandbox/worker.log")
        );
        assert_eq!(settings.tags.len(), 1);
    }
}
