/*
 * Copyright (C) 2025-2026 The Caldera authors
 *
 * This file is part of Caldera (a capability-based microhypervisor for x86-64).
 *
 * Caldera is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * Caldera is distributed in the hope that it will be useful, but
 * WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
 * General Public License version 2 for more details.
 */

//! Contains the logger

use core::cell::RefMut;
use core::fmt;

use crate::cell::{StaticCell, StaticRefCell};
use crate::io::{LogFlags, Serial};

const MAX_LINE_LEN: usize = 160;
const SUFFIX: &[u8] = b"\x1B[0m";

static LOG: StaticRefCell<Option<Log>> = StaticRefCell::new(None);
static FLAGS: StaticCell<LogFlags> = StaticCell::new(LogFlags::Info.union(LogFlags::Error));

/// Returns the currently enabled log flags
pub fn flags() -> LogFlags {
    FLAGS.get()
}

/// Enables exactly the given log flags
pub fn set_flags(flags: LogFlags) {
    FLAGS.set(flags);
}

/// A line-buffered logger that writes to the serial line
pub struct Log {
    serial: Serial,
    buf: [u8; MAX_LINE_LEN],
    pos: usize,
    start_pos: usize,
}

impl Log {
    /// Returns the logger, if it has been initialized
    pub fn get() -> Option<RefMut<'static, Log>> {
        let log = LOG.borrow_mut();
        if log.is_none() {
            return None;
        }
        Some(RefMut::map(log, |l| l.as_mut().unwrap()))
    }

    fn put_char(&mut self, c: u8) {
        self.buf[self.pos] = c;
        self.pos += 1;

        if c == b'\n' || self.pos + SUFFIX.len() + 1 >= MAX_LINE_LEN {
            for c in SUFFIX {
                self.buf[self.pos] = *c;
                self.pos += 1;
            }
            if c != b'\n' {
                self.buf[self.pos] = b'\n';
                self.pos += 1;
            }

            self.flush();
        }
    }

    fn flush(&mut self) {
        self.serial.write(&self.buf[0..self.pos]);
        self.pos = self.start_pos;
    }

    fn init(&mut self, cpu: usize, name: &str) {
        let colors = ["31", "32", "33", "34", "35", "36"];

        self.pos = 0;
        fmt::Write::write_fmt(
            self,
            format_args!("\x1B[0;{}m[{:<6}@{:X}] ", colors[cpu % colors.len()], name, cpu),
        )
        .unwrap();
        self.start_pos = self.pos;
    }
}

impl Default for Log {
    fn default() -> Self {
        Log {
            serial: Serial::default(),
            buf: [0; MAX_LINE_LEN],
            pos: 0,
            start_pos: 0,
        }
    }
}

impl fmt::Write for Log {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.as_bytes() {
            self.put_char(*b);
        }
        Ok(())
    }
}

/// Initializes the logger
pub fn init(cpu: usize, name: &str) {
    LOG.replace(Some(Log::default()));
    reinit(cpu, name);
}

/// Reinitializes the logger (when another CPU takes over the serial line)
pub fn reinit(cpu: usize, name: &str) {
    Log::get().unwrap().init(cpu, name);
}
