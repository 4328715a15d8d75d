//! Fixed-width record codec for the telemetry channel.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::{TelemetryRecord, RECORD_SIZE};

/// Splits a telemetry byte stream into [`TelemetryRecord`]s.
///
/// A trailing partial record at end of stream is reported as an error by
/// the default `decode_eof`, which the supervisor treats as a closed channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryCodec;

impl Decoder for TelemetryCodec {
    type Item = TelemetryRecord;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RECORD_SIZE {
            src.reserve(RECORD_SIZE - src.len());
            return Ok(None);
        }

        let ops = src.get_i32_le();
        let errors = src.get_i32_le();
        Ok(Some(TelemetryRecord { ops, errors }))
    }
}
