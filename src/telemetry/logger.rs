//! JSONL packet logger with size-based rotation

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::comm::manager::{PacketHandler, ReceivedPacket};
use crate::comm::protocol::PacketType;
use crate::config::TelemetryConfig;
use crate::error::Result;

/// One logged packet
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PacketRecord {
    /// Wall-clock time the record was written (RFC 3339)
    pub timestamp: String,
    pub interface: u8,
    pub packet_type: u8,
    pub counter: u8,
    pub payload_len: usize,
    /// Queue timestamp (ms since queue creation)
    pub tick_ms: u32,
    /// Payload as lowercase hex
    pub payload: String,
}

impl PacketRecord {
    pub fn from_packet(packet: &ReceivedPacket<'_>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            interface: packet.interface,
            packet_type: packet.header.packet_type.as_u8(),
            counter: packet.header.counter,
            payload_len: packet.payload.len(),
            tick_ms: packet.timestamp,
            payload: packet.payload.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

/// Writes inbound packets to rotating JSONL files
///
/// A new file is started after `max_records_per_file` records; only the newest
/// `max_files_to_keep` files written by this logger are kept on disk.
///
/// Records are buffered. They reach the file when the buffer fills, on
/// rotation, or on [`PacketHandler::flush`], which the manager task calls
/// periodically and at shutdown.
pub struct PacketLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    files: VecDeque<PathBuf>,
    file_seq: u64,
}

impl std::fmt::Debug for PacketLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLogger")
            .field("dir", &self.dir)
            .field("records_in_file", &self.records_in_file)
            .finish_non_exhaustive()
    }
}

impl PacketLogger {
    /// Create a logger writing into `config.log_dir`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;
        info!("Packet log directory: {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            files: VecDeque::new(),
            file_seq: 0,
        })
    }

    /// Buffer one record, rotating first if the current file is full
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Json` if the record cannot be written
    pub fn log(&mut self, record: &PacketRecord) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
        }
        Ok(())
    }

    /// File currently being written
    pub fn current_file(&self) -> Option<&Path> {
        self.files.back().map(PathBuf::as_path)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        self.file_seq += 1;
        let name = format!(
            "packets_{}_{:04}.jsonl",
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.file_seq
        );
        let path = self.dir.join(name);

        let file = File::create(&path)?;
        debug!("Opened packet log {}", path.display());

        self.writer = Some(BufWriter::new(file));
        self.records_in_file = 0;
        self.files.push_back(path);

        while self.files.len() > self.max_files_to_keep {
            if let Some(old) = self.files.pop_front() {
                if let Err(e) = fs::remove_file(&old) {
                    warn!("Failed to remove old packet log {}: {}", old.display(), e);
                }
            }
        }

        Ok(())
    }
}

impl PacketHandler for PacketLogger {
    fn accepts(&self, _packet_type: PacketType) -> bool {
        true
    }

    fn handle(&mut self, packet: &ReceivedPacket<'_>) -> Result<()> {
        self.log(&PacketRecord::from_packet(packet))
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
