//! Buffered stdout logger for the lunet server.
//!
//! Formatting happens on the logging thread; the formatted line is handed to
//! a dedicated writer thread over a bounded channel so the network task
//! never blocks on stdout.

use chrono::Local;
use log::{Level, Log, SetLoggerError, set_boxed_logger, set_max_level};
use std::io::{BufWriter, Write, stdout};
use std::sync::mpsc;
use std::thread;

const CHANNEL_DEPTH: usize = 512;

enum LogCommand {
    Record(String),
    Flush,
}

pub struct LunetLogger {
    max_level: Level,
    sender: mpsc::SyncSender<LogCommand>,
}

impl LunetLogger {
    /// Installs the logger as the global `log` backend and spawns its
    /// writer thread.
    pub fn init(max_level: Level) -> Result<(), SetLoggerError> {
        let (sender, receiver) = mpsc::sync_channel(CHANNEL_DEPTH);

        thread::Builder::new()
            .name("lunet-log-writer".into())
            .spawn(move || {
                let mut writer = BufWriter::new(stdout());
                while let Ok(command) = receiver.recv() {
                    match command {
                        LogCommand::Record(line) => {
                            if let Err(e) = writer.write_all(line.as_bytes()) {
                                eprintln!("[lunet-log] failed to write record: {e}");
                            }
                        }
                        LogCommand::Flush => {
                            if let Err(e) = writer.flush() {
                                eprintln!("[lunet-log] failed to flush: {e}");
                            }
                        }
                    }
                }
                // Sender dropped; flush whatever is left.
                let _ = writer.flush();
            })
            .expect("failed to spawn logger thread");

        set_boxed_logger(Box::new(LunetLogger { max_level, sender }))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

impl Log for LunetLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let line = format!(
                "{} {} [{}] {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            );
            // Queue full or writer gone: drop the record rather than stall
            // the caller.
            let _ = self.sender.try_send(LogCommand::Record(line));
        }
    }

    fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }
}
