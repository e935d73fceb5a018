//! Process logging: a daily-rolling file, stdout, and store forwarding.
//!
//! Every process writes one file at `<base>/<experiment>/YYYY/MM.DD/<name>.log`
//! with pipe-separated lines, rotating when the local date changes. Records
//! at WARN and above are additionally inserted into the store's `logs`
//! collection so the operators' console can show them.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate, Utc};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogDoc;
use crate::store::ConfigStore;

/// Flush after this many writes rather than on every line.
const FLUSH_EVERY: u32 = 4;

/// The directory holding one day's log files.
pub fn log_dir(base: &str, experiment: &str, date: NaiveDate) -> PathBuf {
    Path::new(base)
        .join(experiment)
        .join(format!("{}", date.format("%Y")))
        .join(format!("{}", date.format("%m.%d")))
}

struct RollingState {
    base: String,
    experiment: String,
    filename: String,
    file: Option<File>,
    today: NaiveDate,
    flush_cycle: u32,
}

impl RollingState {
    fn rotate(&mut self) -> std::io::Result<()> {
        self.today = Local::now().date_naive();
        let dir = log_dir(&self.base, &self.experiment, self.today);
        std::fs::create_dir_all(&dir)?;
        self.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(&self.filename))?,
        );
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.file.is_none() || Local::now().date_naive() != self.today {
            self.rotate()?;
        }
        let file = self.file.as_mut().expect("rotate just opened the file");
        file.write_all(buf)?;
        self.flush_cycle += 1;
        if self.flush_cycle >= FLUSH_EVERY {
            file.flush()?;
            self.flush_cycle = 0;
        }
        Ok(buf.len())
    }
}

/// A `MakeWriter` whose output file follows the local date.
#[derive(Clone)]
pub struct RollingWriter {
    state: Arc<Mutex<RollingState>>,
}

impl RollingWriter {
    pub fn new(base: &str, experiment: &str, name: &str) -> std::io::Result<Self> {
        let mut state = RollingState {
            base: base.to_string(),
            experiment: experiment.to_string(),
            filename: format!("{}.log", name),
            file: None,
            today: Local::now().date_naive(),
            flush_cycle: 0,
        };
        state.rotate()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }
}

pub struct RollingHandle {
    state: Arc<Mutex<RollingState>>,
}

impl IoWrite for RollingHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.state.lock() {
            Ok(mut state) => state.write_bytes(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut state) = self.state.lock() {
            if let Some(file) = state.file.as_mut() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RollingWriter {
    type Writer = RollingHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RollingHandle {
            state: self.state.clone(),
        }
    }
}

/// `ISO8601 | LEVEL | name | target | lineno | message`
pub struct LineFormat {
    process: String,
}

impl<S, N> FormatEvent<S, N> for LineFormat
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
        let meta = event.metadata();
        write!(
            writer,
            "{} | {} | {} | {} | {} | ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            meta.level(),
            self.process,
            meta.target(),
            meta.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// Forwards WARN-and-above records into the store's `logs` collection.
pub struct StoreLayer {
    process: String,
    tx: mpsc::UnboundedSender<LogDoc>,
}

impl<S: Subscriber> Layer<S> for StoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.send(LogDoc {
            msg: visitor.message,
            level: meta.level().to_string(),
            name: self.process.clone(),
            target: meta.target().to_string(),
            line: meta.line(),
            date: Utc::now(),
        });
    }
}

/// Build the store layer and spawn its forwarding task. Must be called
/// from within a runtime.
pub fn store_layer(process: &str, store: Arc<dyn ConfigStore>) -> StoreLayer {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogDoc>();
    tokio::spawn(async move {
        while let Some(doc) = rx.recv().await {
            let _ = store.insert_log(doc).await;
        }
    });
    StoreLayer {
        process: process.to_string(),
        tx,
    }
}

/// Wire the whole logging stack for one process: rolling file + stdout,
/// plus store forwarding when a store is given.
pub fn init(
    name: &str,
    experiment: &str,
    base: &str,
    debug: bool,
    store: Option<Arc<dyn ConfigStore>>,
) -> anyhow::Result<()> {
    let base = shellexpand::tilde(base).to_string();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let file_writer = RollingWriter::new(&base, experiment, name)?;
    let file_layer = tracing_subscriber::fmt::layer()
        .event_format(LineFormat {
            process: name.to_string(),
        })
        .with_ansi(false)
        .with_writer(file_writer);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(LineFormat {
            process: name.to_string(),
        })
        .with_writer(std::io::stdout);
    let forwarding = store.map(|store| store_layer(name, store));
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .with(forwarding)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_log_dir_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            log_dir("/global/logs", "pancake", date),
            PathBuf::from("/global/logs/pancake/2024/03.07")
        );
    }

    #[test]
    fn test_rolling_writer_creates_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let writer = RollingWriter::new(base, "testing", "pl_alarm").unwrap();
        let mut handle = writer.make_writer();
        handle.write_all(b"hello log\n").unwrap();
        handle.flush().unwrap();

        let expected = log_dir(base, "testing", Local::now().date_naive()).join("pl_alarm.log");
        let content = std::fs::read_to_string(expected).unwrap();
        assert_eq!(content, "hello log\n");
    }

    #[tokio::test]
    async fn test_store_layer_forwards_warnings_only() {
        let store = Arc::new(MemoryStore::new());
        let layer = store_layer("pl_test", store.clone());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("something is off");
            tracing::info!("all fine");
        });
        // give the forwarder a moment to drain
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let logs = store.snapshot().await.logs;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].msg, "something is off");
        assert_eq!(logs[0].level, "WARN");
        assert_eq!(logs[0].name, "pl_test");
    }
}
