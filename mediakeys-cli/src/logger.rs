use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

/// Stderr logger. Plain messages by default, target and source location
/// once debug output is requested.
pub struct Logger {
    level: LevelFilter,
}

impl Logger {
    fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    /// Install the logger, printing records up to `level`.
    pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(Self::new(level)))?;
        log::set_max_level(level);
        Ok(())
    }

    fn detailed(&self) -> bool {
        self.level >= LevelFilter::Debug
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if !self.detailed() {
            match record.level() {
                Level::Info => eprintln!("{}", record.args()),
                level => eprintln!("{} {}", label(level), record.args()),
            }
            return;
        }

        let location = match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            _ => record.module_path().unwrap_or("?").to_owned(),
        };

        eprintln!(
            "{} {} {}",
            label(record.level()),
            format!("[{} {}]", record.target(), location).dimmed(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn label(level: Level) -> ColoredString {
    match level {
        Level::Error => "error:".bold().red(),
        Level::Warn => "warning:".bold().yellow(),
        Level::Info => "info:".bold().green(),
        Level::Debug => "debug:".bold().blue(),
        Level::Trace => "trace:".bold().purple(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Log, MetadataBuilder};

    fn metadata(level: Level) -> Metadata<'static> {
        MetadataBuilder::new()
            .level(level)
            .target("mediakeys::transform")
            .build()
    }

    #[test]
    fn filters_by_own_level() {
        let quiet = Logger::new(LevelFilter::Error);
        assert!(quiet.enabled(&metadata(Level::Error)));
        assert!(!quiet.enabled(&metadata(Level::Warn)));
        assert!(!quiet.detailed());

        let verbose = Logger::new(LevelFilter::Debug);
        assert!(verbose.enabled(&metadata(Level::Debug)));
        assert!(!verbose.enabled(&metadata(Level::Trace)));
        assert!(verbose.detailed());
    }
}
