//! Console-backed diagnostics
//!
//! Routes the `log` facade to the HAL console. Installed once during boot;
//! tests install `env_logger` instead and never call [`init`].

use argon_hal::Console;
use log::{LevelFilter, Log, Metadata, Record};

struct ConsoleLogger {
    console: &'static dyn Console,
}

impl Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let mut line = String::with_capacity(96);
        line.push('[');
        line.push_str(record.level().as_str());
        line.push_str("] ");
        line.push_str(record.target());
        line.push_str(": ");
        line.push_str(&record.args().to_string());
        line.push('\n');
        self.console.write(&line);
    }

    fn flush(&self) {}
}

/// Install the console logger. Called once from the boot sequence.
pub fn init(console: &'static dyn Console, level: LevelFilter) {
    let logger = Box::leak(Box::new(ConsoleLogger { console }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_hal::mock::RecordingConsole;

    #[test]
    fn test_logger_formats_line() {
        let console = Box::leak(Box::new(RecordingConsole::new()));
        let logger = ConsoleLogger { console };
        logger.log(
            &Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Info)
                .target("argon::test")
                .build(),
        );
        let out = console.contents();
        assert!(out.contains("[INFO] argon::test: hello"));
    }
}
