use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};

use anyhow::Result;
use slog::{o, Drain};

use crate::logging::{Level, Log, To};

pub use slog::Logger;

/// Build the root logger described by `log` and route the `log` facade into it.
///
/// The returned logger owns the async drain, keep it alive for the lifetime of the process.
pub fn logger_init(log: &Log) -> Result<Logger> {
    let logger = config_logger(log.filename(), log.to, log.level)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))?;
    log::set_max_level(slog_to_log_level(log.level.inner()).to_level_filter());
    Ok(logger)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

fn timestamp_local(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

pub fn config_logger(filename: String, to: To, level: Level) -> Result<Logger> {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to)?);
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp_local).build().fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct LevelFilter<D> {
    drain: D,
    level: Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(*self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(&filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.off() {
            return Ok(buf.len());
        }
        let mut n = buf.len();
        if self.to.console() {
            n = self.console.write(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            n = file.write(buf)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow::Error::msg(format!("logger file config error, filename: {}, {:?}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger() {
        let filename = std::env::temp_dir()
            .join(format!("mqttd-{}.log", uuid::Uuid::new_v4().simple()))
            .to_string_lossy()
            .to_string();
        let logger = config_logger(filename.clone(), To::File, Level::new(slog::Level::Info)).unwrap();
        slog::info!(logger, "hello file");
        slog::debug!(logger, "filtered out");
        drop(logger);
        std::thread::sleep(std::time::Duration::from_millis(200));
        let content = std::fs::read_to_string(&filename).unwrap_or_default();
        let _ = std::fs::remove_file(&filename);
        assert!(content.contains("hello file"));
        assert!(!content.contains("filtered out"));
    }
}
