//! Side channel for emulated outputs
//!
//! Real controllers drive lines and send serial-output codes to a sound or image
//! module. The emulator reports the same effects to an [`OutputSink`] instead,
//! which a collaborator (e.g. a sound player) watches.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::Sender;

/// An externally visible effect of entering a state or forcing an output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SideEffect {
    /// Output line changed value
    Output { line: usize, value: bool, time: f64 },
    /// Serial-output code emitted on state entry
    Serial { code: u8, time: f64 },
}

impl SideEffect {
    pub fn time(&self) -> f64 {
        match self {
            SideEffect::Output { time, .. } => *time,
            SideEffect::Serial { time, .. } => *time,
        }
    }
}

/// Receiver of emulated side effects
pub trait OutputSink: Send {
    fn emit(&mut self, effect: &SideEffect);
}

/// Discards every effect
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn emit(&mut self, _effect: &SideEffect) {}
}

/// Any `FnMut(&SideEffect)` closure is a sink
impl<F> OutputSink for F
where
    F: FnMut(&SideEffect) + Send,
{
    fn emit(&mut self, effect: &SideEffect) {
        self(effect)
    }
}

/// Forwards effects over an mpsc channel
pub struct ChannelSink {
    tx: Sender<SideEffect>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SideEffect>) -> Self {
        Self { tx }
    }
}

impl OutputSink for ChannelSink {
    fn emit(&mut self, effect: &SideEffect) {
        if self.tx.send(*effect).is_err() {
            log::trace!("Side-effect receiver dropped; discarding {:?}", effect);
        }
    }
}

/// Appends one line per effect to a file
///
/// Line format: `<wall clock RFC 3339> <session seconds> output <line> <0|1>` or
/// `<wall clock RFC 3339> <session seconds> serial <code>`.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        log::info!("Writing emulator side effects to {:?}", path);
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl OutputSink for FileSink {
    fn emit(&mut self, effect: &SideEffect) {
        let wall = Utc::now().to_rfc3339();
        let result = match effect {
            SideEffect::Output { line, value, time } => {
                writeln!(self.writer, "{} {:.4} output {} {}", wall, time, line, u8::from(*value))
            }
            SideEffect::Serial { code, time } => writeln!(self.writer, "{} {:.4} serial {}", wall, time, code),
        };
        // Watchers tail the file, so every effect is flushed immediately
        if let Err(e) = result.and_then(|_| self.writer.flush()) {
            log::warn!("Failed to write side effect: {}", e);
        }
    }
}
