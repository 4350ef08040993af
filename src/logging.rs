use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::{LevelFilter, Record};
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Optional fields written between the level and the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineFields {
    pid: bool,
    caller: bool,
    trace_id: bool,
}

impl Default for LineFields {
    fn default() -> Self {
        Self {
            pid: true,
            caller: false,
            trace_id: true,
        }
    }
}

impl LineFields {
    fn from_config(config: &Logger) -> Self {
        Self {
            pid: !config.nopid,
            caller: config.caller,
            trace_id: config.traceid,
        }
    }

    fn write(&self, w: &mut dyn Write, record: &Record) -> std::io::Result<()> {
        write!(w, "[{}]", record.level())?;
        if self.pid {
            write!(w, " pid={}", std::process::id())?;
        }
        if self.trace_id {
            let id = current_trace_id();
            write!(w, " trace_id={}", id.as_deref().unwrap_or("-"))?;
        }
        if self.caller {
            write!(w, " {}:{}", record.file().unwrap_or("-"), record.line().unwrap_or(0))?;
        }
        writeln!(w, " {}", record.args())
    }
}

static LINE_FIELDS: OnceLock<LineFields> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

/// Installs the global logger. Lines go to stdout, or to `config.path` with
/// size based rotation when a path is set; warnings are echoed to stderr.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose { LevelFilter::Debug } else { parse_level(&config.level) };
    LINE_FIELDS.get_or_init(|| LineFields::from_config(config));

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(format_line);

    let path = config.path.trim();
    if !path.is_empty() {
        let spec = FileSpec::try_from(Path::new(path)).with_context(|| format!("log path {path}"))?;
        logger = logger.log_to_file(spec).format(format_line).write_mode(WriteMode::BufferAndFlush);
        if let Some(cleanup) = rotation_cleanup(config) {
            logger = logger.rotate(Criterion::Size(config.max_size * 1024 * 1024), Naming::Numbers, cleanup);
        }
    }

    // Dropping the handle would stop the writer and lose buffered lines.
    std::mem::forget(logger.start()?);
    Ok(())
}

/// `None` leaves the log file unrotated.
fn rotation_cleanup(config: &Logger) -> Option<Cleanup> {
    match (config.max_size, config.max_backups) {
        (0, _) => None,
        (_, 0) => Some(Cleanup::Never),
        (_, backups) => Some(Cleanup::KeepLogFiles(backups as usize)),
    }
}

/// Unknown names fall back to info.
fn parse_level(raw: &str) -> LevelFilter {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("warning") {
        return LevelFilter::Warn;
    }
    raw.parse().unwrap_or(LevelFilter::Info)
}

fn format_line(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let fields = LINE_FIELDS.get().copied().unwrap_or_default();
    write!(w, "{} ", now.now_utc_owned().format(TIMESTAMP_FORMAT))?;
    fields.write(w, record)
}

/// Runs `fut` with `trace_id` attached to every log line it emits.
pub async fn with_trace_id<T>(trace_id: String, fut: impl Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}
