//! Packet capture and deterministic replay.
//!
//! The file format is a plain sequence of records:
//! `<timestamp µs: u64 le> <length: u32 le> <packet bytes>`.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{ProlinkError, Result};

/// Largest packet a capture record may carry; oversized records abort
/// replay.
pub(crate) const MAX_RECORD_SIZE: usize = 2048;

/// Appends received packets to a capture stream.
pub(crate) struct CaptureWriter<W: Write> {
    out: W,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(out: W) -> CaptureWriter<W> {
        CaptureWriter { out }
    }

    pub fn record(&mut self, timestamp_us: u64, packet: &[u8]) -> io::Result<()> {
        self.out.write_u64::<LittleEndian>(timestamp_us)?;
        self.out.write_u32::<LittleEndian>(packet.len() as u32)?;
        self.out.write_all(packet)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

pub(crate) struct ReplayRecord {
    pub timestamp_us: u64,
    pub packet: Vec<u8>,
}

/// Reads capture records back for replay.
pub(crate) struct ReplayReader<R: Read> {
    input: R,
}

impl<R: Read> ReplayReader<R> {
    pub fn new(input: R) -> ReplayReader<R> {
        ReplayReader { input }
    }

    /// The next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<ReplayRecord>> {
        let timestamp_us = match self.input.read_u64::<LittleEndian>() {
            Ok(timestamp) => timestamp,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let length = self.input.read_u32::<LittleEndian>()? as usize;
        if length > MAX_RECORD_SIZE {
            return Err(ProlinkError::ReplayRecordTooLarge(length));
        }
        let mut packet = vec![0u8; length];
        self.input.read_exact(&mut packet)?;
        Ok(Some(ReplayRecord {
            timestamp_us,
            packet,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn records_round_trip() {
        let mut buffer = Vec::new();
        let mut writer = CaptureWriter::new(&mut buffer);
        writer.record(1_000, &[0x51, 0x73, 0x70]).unwrap();
        writer.record(3_500, &[0xff]).unwrap();

        let mut reader = ReplayReader::new(Cursor::new(buffer));
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.timestamp_us, 1_000);
        assert_eq!(first.packet, vec![0x51, 0x73, 0x70]);

        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.timestamp_us, 3_500);
        assert_eq!(second.packet, vec![0xff]);

        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn oversized_record_aborts() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&0u64.to_le_bytes());
        buffer.extend_from_slice(&(MAX_RECORD_SIZE as u32 + 1).to_le_bytes());

        let mut reader = ReplayReader::new(Cursor::new(buffer));
        assert!(matches!(
            reader.next_record(),
            Err(ProlinkError::ReplayRecordTooLarge(_))
        ));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buffer = Vec::new();
        let mut writer = CaptureWriter::new(&mut buffer);
        writer.record(0, &[0x01, 0x02, 0x03, 0x04]).unwrap();
        buffer.truncate(buffer.len() - 2);

        let mut reader = ReplayReader::new(Cursor::new(buffer));
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn empty_stream_is_exhausted() {
        let mut reader = ReplayReader::new(Cursor::new(Vec::new()));
        assert!(reader.next_record().unwrap().is_none());
    }
}
