//! Temperature sampling from a diagnostic stream.
//!
//! A long-lived producer (by default `nvidia-smi -l 5 -q -d TEMPERATURE`)
//! prints one block per device per polling round. Readings arrive in device
//! enumeration order, so each matched line is attributed to the slot under a
//! round-robin cursor.

use std::io;
use std::process::Stdio;

use anyhow::Result;
use bytes::BytesMut;
use tokio::process::Command;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info};

use super::process_manager::ProcessManager;
use tokio::process::ChildStdout;

/// Longest line accepted from the producer; longer runs are cut here.
pub const MAX_LINE_LENGTH: usize = 10240;

pub const DEFAULT_PROGRAM: &str = "nvidia-smi";
pub const DEFAULT_ARGS: [&str; 5] = ["-l", "5", "-q", "-d", "TEMPERATURE"];

/// Per-device temperature lookup used by the reporter.
pub trait TemperatureSource {
    /// Last known temperature of `device_id` in degrees Celsius.
    fn sample(&self, device_id: usize) -> Option<i32>;
}

/// What a producer line means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmiLine {
    /// `GPU Current Temp : <int> C`
    Reading(i32),
    /// `Gpu : N/A`
    Unavailable,
    Other,
}

pub fn classify_line(line: &str) -> SmiLine {
    let Some((key, value)) = line.split_once(':') else {
        return SmiLine::Other;
    };
    let value = value.trim();

    match key.trim() {
        "GPU Current Temp" => {
            let number = value.strip_suffix('C').unwrap_or(value).trim_end();
            number
                .parse()
                .map(SmiLine::Reading)
                .unwrap_or(SmiLine::Other)
        }
        "Gpu" if value == "N/A" => SmiLine::Unavailable,
        _ => SmiLine::Other,
    }
}

/// One slot per device id, `None` until first reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemperatureTable {
    slots: Vec<Option<i32>>,
}

impl TemperatureTable {
    pub fn new(devices: usize) -> Self {
        Self {
            slots: vec![None; devices],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<i32> {
        self.slots.get(slot).copied().flatten()
    }

    fn set(&mut self, slot: usize, value: i32) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(value);
        }
    }
}

/// Scrapes producer lines into a [`TemperatureTable`].
#[derive(Debug, Clone)]
pub struct SmiTemperatureAdapter {
    table: TemperatureTable,
    cursor: usize,
    done: bool,
}

impl SmiTemperatureAdapter {
    pub fn new(devices: usize) -> Self {
        Self {
            table: TemperatureTable::new(devices),
            cursor: 0,
            done: false,
        }
    }

    /// An adapter with no producer behind it.
    pub fn disabled(devices: usize) -> Self {
        Self {
            done: true,
            ..Self::new(devices)
        }
    }

    /// Apply one line; returns whether the cursor moved.
    pub fn ingest_line(&mut self, line: &str) -> bool {
        if self.done || self.table.is_empty() {
            return false;
        }

        match classify_line(line) {
            SmiLine::Reading(temp) => {
                self.table.set(self.cursor, temp);
                self.advance();
                true
            }
            SmiLine::Unavailable => {
                self.advance();
                true
            }
            SmiLine::Other => false,
        }
    }

    /// Latch the adapter off after the stream ended or failed.
    pub fn finish(&mut self) {
        if !self.done {
            info!("Temperature stream ended, temperatures frozen");
        }
        self.done = true;
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.table.len();
    }
}

impl TemperatureSource for SmiTemperatureAdapter {
    fn sample(&self, device_id: usize) -> Option<i32> {
        self.table.get(device_id)
    }
}

/// Newline framing with a hard cap on line length.
///
/// Unlike `LinesCodec` an overlong run is not an error: it is emitted as a
/// line of `max_length` bytes and scanning continues. A trailing partial line
/// at end of stream is dropped.
#[derive(Debug, Clone, Copy)]
pub struct BoundedLineCodec {
    max_length: usize,
}

impl BoundedLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
        }
    }
}

impl Default for BoundedLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LENGTH)
    }
}

impl Decoder for BoundedLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let window = src.len().min(self.max_length);
        let line = match src[..window].iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                line
            }
            None if src.len() >= self.max_length => src.split_to(self.max_length),
            None => return Ok(None),
        };

        let text = String::from_utf8_lossy(&line);
        Ok(Some(text.strip_suffix('\r').unwrap_or(&text).to_string()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Dropping partial temperature line");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

/// The running producer and its framed output.
pub struct TemperatureSampler {
    pub process: ProcessManager,
    pub lines: FramedRead<ChildStdout, BoundedLineCodec>,
}

impl TemperatureSampler {
    /// Start the producer; `command` is run through `sh -c` when given.
    pub fn launch(command: Option<&str>) -> Result<Self> {
        let mut cmd = match command {
            Some(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            None => {
                let mut cmd = Command::new(DEFAULT_PROGRAM);
                cmd.args(DEFAULT_ARGS);
                cmd
            }
        };
        cmd.stderr(Stdio::null());

        let (process, stdout) = ProcessManager::spawn("temperature sampler", cmd)?;
        Ok(Self {
            process,
            lines: FramedRead::new(stdout, BoundedLineCodec::default()),
        })
    }
}
