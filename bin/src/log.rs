//! Logging implementation based on [`tracing`].
//!
//! The library logs through the [`log`] facade, so its records are bridged
//! into [`tracing`] with a [`LogTracer`].
//!
//! [`log`]: https://docs.rs/log

use std::{collections::HashMap, fmt, io};

use serde_json::{Map, Value};
use time::{OffsetDateTime as DateTime, format_description::well_known::Rfc3339};
use tracing::{Event, Metadata, Subscriber, field::Field, subscriber::Interest};
use tracing_log::{LogTracer, NormalizeEvent as _};
use tracing_serde::AsSerde as _;
use tracing_subscriber::{
    Layer as _,
    field::Visit,
    filter::{LevelFilter, filter_fn},
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer,
    layer::{Filter, SubscriberExt as _},
    registry::LookupSpan,
    util::SubscriberInitExt as _,
};

use crate::conf;

/// Initializes [`tracing`] backend and all the tools relying on it:
/// - [`LogTracer`] forwarding [`log`] records;
/// - global JSON logger, writing warnings and errors to `stderr` and the
///   rest to `stdout`.
///
/// [`log`]: https://docs.rs/log
pub(crate) fn init(config: conf::Log) {
    /// `Level`s outputted in `stderr`.
    const STDERR_LEVELS: &[tracing::Level] =
        &[tracing::Level::WARN, tracing::Level::ERROR];

    if let Err(e) = LogTracer::init() {
        eprintln!("`log` records won't be logged: {e}");
    }

    let filter = ModuleFilter::from(config);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .event_format(JsonLine)
                .with_filter(filter_fn(|meta| {
                    STDERR_LEVELS.contains(meta.level())
                }))
                .with_filter(filter.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(JsonLine)
                .with_filter(filter_fn(|meta| {
                    !STDERR_LEVELS.contains(meta.level())
                }))
                .with_filter(filter),
        )
        .init();
}

/// [`tracing`] [`Filter`] overriding the [`LevelFilter`] for specific
/// modules and their submodules.
#[derive(Clone, Debug)]
struct ModuleFilter {
    /// Levels of specifically handled modules.
    modules: HashMap<String, LevelFilter>,

    /// [`LevelFilter`] of all other modules.
    default_level: LevelFilter,
}

impl From<conf::Log> for ModuleFilter {
    fn from(conf: conf::Log) -> Self {
        Self {
            default_level: conf.level,
            modules: conf
                .r#mod
                .into_iter()
                .map(|(path, m)| (path, m.level))
                .collect(),
        }
    }
}

impl ModuleFilter {
    /// Returns the [`LevelFilter`] of the provided module `path`, picking the
    /// most specific configured module.
    fn level_of(&self, path: &str) -> LevelFilter {
        self.modules
            .iter()
            .filter(|(m, _)| {
                path.strip_prefix(m.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
            })
            .max_by_key(|(m, _)| m.len())
            .map_or(self.default_level, |(_, lvl)| *lvl)
    }

    /// Indicates whether the provided [`Metadata`] is enabled.
    fn is_enabled(&self, meta: &Metadata<'_>) -> bool {
        meta.is_span()
            || self.level_of(meta.module_path().unwrap_or_else(|| meta.target()))
                >= *meta.level()
    }
}

impl<S> Filter<S> for ModuleFilter
where
    S: for<'a> LookupSpan<'a> + Subscriber,
{
    fn enabled(&self, meta: &Metadata<'_>, _: &layer::Context<'_, S>) -> bool {
        self.is_enabled(meta)
    }

    fn callsite_enabled(&self, meta: &'static Metadata<'static>) -> Interest {
        if self.is_enabled(meta) {
            Interest::always()
        } else {
            Interest::never()
        }
    }
}

/// Formatter writing every [`Event`] as a single JSON object line.
struct JsonLine;

impl<S, N> FormatEvent<S, N> for JsonLine
where
    S: for<'a> LookupSpan<'a> + Subscriber,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut line = Map::new();
        if let Ok(time) = DateTime::now_utc().format(&Rfc3339) {
            drop(line.insert("time".into(), time.into()));
        }
        if let Ok(lvl) = serde_json::to_value(meta.level().as_serde()) {
            drop(line.insert("lvl".into(), lvl));
        }
        if let Some(path) = meta.module_path() {
            drop(line.insert("mod".into(), path.into()));
        }
        if *meta.level() != tracing::Level::INFO {
            if let (Some(file), Some(no)) = (meta.file(), meta.line()) {
                drop(line.insert("src".into(), format!("{file}:{no}").into()));
            }
        }
        event.record(&mut Fields(&mut line));

        let json = serde_json::to_string(&line).map_err(|_| fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

/// [`Visit`]or collecting [`Event`] fields into a JSON object.
///
/// Fields of [`log`] records are normalized to look like [`tracing`] ones.
///
/// [`log`]: https://docs.rs/log
struct Fields<'a>(&'a mut Map<String, Value>);

impl Fields<'_> {
    /// Records the provided `value` of the `field`.
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        let name = match name.strip_prefix("log.").unwrap_or(name) {
            "message" => "msg",
            "mod" | "module_path" | "file" | "target" | "line" => return,
            other => other,
        };
        drop(self.0.insert(name.to_owned(), value));
    }
}

impl Visit for Fields<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}").into());
    }
}

#[cfg(test)]
mod log_spec {
    use super::*;

    fn filter() -> ModuleFilter {
        ModuleFilter {
            modules: HashMap::from([
                (String::from("turn_relay"), LevelFilter::WARN),
                (String::from("turn_relay::server"), LevelFilter::TRACE),
            ]),
            default_level: LevelFilter::INFO,
        }
    }

    #[test]
    fn picks_most_specific_module() {
        let filter = filter();

        assert_eq!(filter.level_of("turn_relay::server::request"), LevelFilter::TRACE);
        assert_eq!(filter.level_of("turn_relay::client"), LevelFilter::WARN);
        assert_eq!(filter.level_of("turn_relay"), LevelFilter::WARN);
        assert_eq!(filter.level_of("turn_relay_bin"), LevelFilter::INFO);
        assert_eq!(filter.level_of("tokio::net"), LevelFilter::INFO);
    }
}
