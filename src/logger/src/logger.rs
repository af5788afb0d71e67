// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::{stderr, Write};
use std::sync::Mutex;
use std::thread;

use lazy_static::lazy_static;
use log::{max_level, set_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record};

/// Default instance id until the host supplies one.
pub const DEFAULT_INSTANCE_ID: &str = "anonymous-instance";

lazy_static! {
    /// Static instance used for logging.
    pub static ref LOGGER: Logger = Logger::new();
}

struct LoggerState {
    instance_id: String,
    dest: Option<Box<dyn Write + Send>>,
}

/// Line-oriented logger writing to an arbitrary destination (stderr until
/// one is configured).
pub struct Logger {
    state: Mutex<LoggerState>,
}

impl Logger {
    fn new() -> Logger {
        Logger {
            state: Mutex::new(LoggerState {
                instance_id: String::from(DEFAULT_INSTANCE_ID),
                dest: None,
            }),
        }
    }

    /// Installs the logger as the `log` crate backend.
    ///
    /// Calling it a second time fails with `SetLoggerError`; the first
    /// configuration stays in effect.
    pub fn init(
        &self,
        instance_id: String,
        level: Level,
        dest: Option<Box<dyn Write + Send>>,
    ) -> Result<(), log::SetLoggerError> {
        {
            // Poisoning can only happen on a panicking `log()` writer, at
            // which point losing the logger is the smaller problem.
            let mut state = self.state.lock().unwrap();
            state.instance_id = instance_id;
            state.dest = dest;
        }
        set_max_level(level.to_level_filter());
        set_logger(&*LOGGER)
    }

    /// Changes the maximum logged level at runtime.
    pub fn set_max_level(&self, level: LevelFilter) {
        set_max_level(level);
    }

    fn timestamp() -> String {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safe because the timespec is valid for the duration of the call.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        format!("{}.{:09}", ts.tv_sec, ts.tv_nsec)
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let thread = thread::current();
        let mut state = self.state.lock().unwrap();
        let line = format!(
            "{} [{}:{}:{}:{}:{}] {}",
            Logger::timestamp(),
            state.instance_id,
            thread.name().unwrap_or("-"),
            record.level(),
            record.file().unwrap_or("-"),
            record.line().unwrap_or(0),
            record.args()
        );
        match state.dest {
            Some(ref mut dest) => {
                let _ = writeln!(dest, "{}", line);
            }
            None => {
                let _ = writeln!(stderr(), "{}", line);
            }
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(ref mut dest) = state.dest {
            let _ = dest.flush();
        }
    }
}
