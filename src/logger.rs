//! Leveled file logger with day/line-count rotation and optional
//! asynchronous delivery through a bounded queue.
//!
//! The logger is an ordinary [`log::Log`] backend: construct one with
//! [`Logger::new`] (tests do exactly that and tear it down per test) and
//! [`install`](Logger::install) it when it should serve the `log` macros
//! process-wide. With a non-zero queue capacity a dedicated writer thread
//! drains records in the background; a full queue falls back to a
//! synchronous write so records are never dropped.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::queue::BlockQueue;

/// Lines per log file before rotating to a numbered sibling.
const MAX_LINES: usize = 50_000;

const TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");
const FILE_DATE: &[FormatItem<'static>] = format_description!("[year]_[month]_[day]");

/// Construction parameters for [`Logger`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Most verbose level that gets written.
    pub level: LevelFilter,
    /// Directory holding the log files; created if missing.
    pub dir: PathBuf,
    /// File name suffix, e.g. `.log`.
    pub suffix: String,
    /// Queue capacity for asynchronous delivery; `0` writes synchronously.
    pub queue_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LevelFilter::Info,
            dir: PathBuf::from("./log"),
            suffix: String::from(".log"),
            queue_capacity: 1024,
        }
    }
}

/// Maps the numeric verbosity knob of the server config surface
/// (0 = debug .. 3 = error) onto a [`LevelFilter`].
pub fn verbosity_level(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Debug,
        1 => LevelFilter::Info,
        2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

/// The open log file plus everything rotation needs.
#[derive(Debug)]
struct Sink {
    file: BufWriter<File>,
    day: Date,
    lines: usize,
    dir: PathBuf,
    suffix: String,
}

impl Sink {
    fn new(dir: &Path, suffix: &str) -> io::Result<Sink> {
        fs::create_dir_all(dir)?;
        let today = OffsetDateTime::now_utc().date();
        Ok(Sink {
            file: Self::open_file(dir, suffix, today, None)?,
            day: today,
            lines: 0,
            dir: dir.to_path_buf(),
            suffix: suffix.to_owned(),
        })
    }

    fn open_file(
        dir: &Path,
        suffix: &str,
        day: Date,
        rotation: Option<usize>,
    ) -> io::Result<BufWriter<File>> {
        let stamp = day
            .format(FILE_DATE)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let name = match rotation {
            Some(n) => format!("{stamp}-{n}{suffix}"),
            None => format!("{stamp}{suffix}"),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(BufWriter::new(file))
    }

    /// Switches files when the day changed or the line counter reached a
    /// [`MAX_LINES`] multiple. Checked before every write.
    fn roll(&mut self, now: OffsetDateTime) -> io::Result<()> {
        let today = now.date();
        if today != self.day {
            self.file.flush()?;
            self.file = Self::open_file(&self.dir, &self.suffix, today, None)?;
            self.day = today;
            self.lines = 0;
        } else if self.lines != 0 && self.lines % MAX_LINES == 0 {
            self.file.flush()?;
            self.file =
                Self::open_file(&self.dir, &self.suffix, today, Some(self.lines / MAX_LINES))?;
        }
        Ok(())
    }

    fn write_line(&mut self, now: OffsetDateTime, line: &str) -> io::Result<()> {
        self.roll(now)?;
        self.file.write_all(line.as_bytes())?;
        self.lines += 1;
        Ok(())
    }
}

/// File logger with level filtering and sync or async delivery.
#[derive(Debug)]
pub struct Logger {
    level: LevelFilter,
    sink: Arc<Mutex<Sink>>,
    queue: Option<Arc<BlockQueue<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    /// Opens the log directory and, for a non-zero queue capacity, starts
    /// the background writer thread.
    pub fn new(config: &LogConfig) -> io::Result<Logger> {
        let sink = Arc::new(Mutex::new(Sink::new(&config.dir, &config.suffix)?));
        let (queue, writer) = if config.queue_capacity > 0 {
            let queue: Arc<BlockQueue<String>> = Arc::new(BlockQueue::new(config.queue_capacity));
            let handle = {
                let queue = Arc::clone(&queue);
                let sink = Arc::clone(&sink);
                thread::Builder::new()
                    .name("log-writer".into())
                    .spawn(move || {
                        while let Some(line) = queue.pop() {
                            let mut sink = sink.lock().unwrap();
                            let _ = sink.write_line(OffsetDateTime::now_utc(), &line);
                        }
                        let _ = sink.lock().unwrap().file.flush();
                    })?
            };
            (Some(queue), Some(handle))
        } else {
            (None, None)
        };
        Ok(Logger {
            level: config.level,
            sink,
            queue,
            writer: Mutex::new(writer),
        })
    }

    /// Registers this logger as the process-wide `log` backend and
    /// returns a handle the owner can still [`shutdown`](Self::shutdown).
    /// A second install is a no-op for the facade but the handle stays
    /// usable.
    pub fn install(self) -> Arc<Logger> {
        let shared = Arc::new(self);
        log::set_max_level(shared.level);
        let _ = log::set_boxed_logger(Box::new(GlobalLogger(Arc::clone(&shared))));
        shared
    }

    /// Drains the queue, closes it, joins the writer thread, and flushes
    /// the file. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            let writer = self.writer.lock().unwrap().take();
            if let Some(writer) = writer {
                while !queue.is_empty() {
                    queue.flush();
                    thread::yield_now();
                }
                queue.close();
                let _ = writer.join();
            } else {
                queue.close();
            }
        }
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.file.flush();
        }
    }

    fn write_sync(&self, line: &str) {
        let mut sink = self.sink.lock().unwrap();
        let _ = sink.write_line(OffsetDateTime::now_utc(), line);
    }

    fn format_record(args: &fmt::Arguments<'_>, level: Level) -> String {
        let stamp = OffsetDateTime::now_utc()
            .format(TIMESTAMP)
            .unwrap_or_default();
        format!("{stamp} {}{args}\n", level_tag(level))
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "[error]: ",
        Level::Warn => "[warn] : ",
        Level::Info => "[info] : ",
        Level::Debug | Level::Trace => "[debug]: ",
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format_record(record.args(), record.level());
        if let Some(queue) = &self.queue {
            match queue.try_push_back(line) {
                Ok(()) => return,
                // full or closed queue: write this record synchronously
                Err(line) => self.write_sync(&line),
            }
        } else {
            self.write_sync(&line);
        }
    }

    fn flush(&self) {
        if let Some(queue) = &self.queue {
            queue.flush();
        }
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.file.flush();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Facade wrapper handed to `log::set_boxed_logger`; keeps the real
/// logger shareable so its owner can drain it at shutdown.
struct GlobalLogger(Arc<Logger>);

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.0.log(record)
    }

    fn flush(&self) {
        self.0.flush()
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use log::{Level, LevelFilter, Log, Record};

    use super::{verbosity_level, LogConfig, Logger, MAX_LINES};

    fn config(dir: &Path, queue_capacity: usize) -> LogConfig {
        LogConfig {
            level: LevelFilter::Debug,
            dir: dir.to_path_buf(),
            suffix: ".log".into(),
            queue_capacity,
        }
    }

    fn log_dir_contents(dir: &Path) -> String {
        let mut out = String::new();
        for entry in fs::read_dir(dir).unwrap() {
            out.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        out
    }

    #[test]
    fn verbosity_maps_onto_level_filters() {
        assert_eq!(LevelFilter::Debug, verbosity_level(0));
        assert_eq!(LevelFilter::Info, verbosity_level(1));
        assert_eq!(LevelFilter::Warn, verbosity_level(2));
        assert_eq!(LevelFilter::Error, verbosity_level(3));
    }

    #[test]
    fn record_format_has_timestamp_and_level_tag() {
        let line = Logger::format_record(&format_args!("ready"), Level::Warn);
        // 2026-08-01 12:00:00.000000 [warn] : ready\n
        assert!(line.ends_with("[warn] : ready\n"), "got {line:?}");
        assert_eq!(Some(10), line.find(' '));
        assert!(line[..10].chars().all(|c| c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn sync_logger_writes_and_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&LogConfig {
            level: LevelFilter::Info,
            ..config(dir.path(), 0)
        })
        .unwrap();
        logger.log(
            &Record::builder()
                .args(format_args!("kept"))
                .level(Level::Info)
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("dropped"))
                .level(Level::Debug)
                .build(),
        );
        logger.shutdown();
        let written = log_dir_contents(dir.path());
        assert!(written.contains("[info] : kept"));
        assert!(!written.contains("dropped"));
    }

    #[test]
    fn async_logger_drains_everything_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config(dir.path(), 4)).unwrap();
        for i in 0..64 {
            logger.log(
                &Record::builder()
                    .args(format_args!("record {i}"))
                    .level(Level::Info)
                    .build(),
            );
        }
        logger.shutdown();
        let written = log_dir_contents(dir.path());
        assert_eq!(64, written.lines().count());
    }

    #[test]
    fn line_counter_rotates_to_numbered_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config(dir.path(), 0)).unwrap();
        for _ in 0..MAX_LINES + 1 {
            logger.log(
                &Record::builder()
                    .args(format_args!("x"))
                    .level(Level::Info)
                    .build(),
            );
        }
        logger.shutdown();
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(2, names.len(), "expected rotation, got {names:?}");
        assert!(names[0].ends_with("-1.log"), "got {names:?}");
    }
}
