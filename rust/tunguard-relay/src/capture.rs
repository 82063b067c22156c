//! Diagnostic packet capture in classic libpcap format.
//!
//! Every packet crossing the tunnel can be offered to a [`CaptureSink`].
//! Capture failures are reported to the caller but never change how the
//! packet itself is handled.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
/// Raw IP, no link-layer header.
pub const LINKTYPE_RAW: u32 = 101;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

/// Receiver of captured tunnel packets.
pub trait CaptureSink: Send {
    fn capture(&mut self, packet: &[u8], time: SystemTime) -> io::Result<()>;
}

/// Build the pcap global header.
pub fn global_header(snaplen: u32) -> Vec<u8> {
    let mut hdr = Vec::with_capacity(GLOBAL_HEADER_LEN);
    hdr.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
    hdr.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    hdr.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    hdr.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    hdr.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    hdr.extend_from_slice(&snaplen.to_le_bytes());
    hdr.extend_from_slice(&LINKTYPE_RAW.to_le_bytes());
    hdr
}

/// Build one record: header plus the packet truncated to `snaplen`.
pub fn record(packet: &[u8], time: SystemTime, snaplen: u32) -> Vec<u8> {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let incl = packet.len().min(snaplen as usize);

    let mut rec = Vec::with_capacity(RECORD_HEADER_LEN + incl);
    rec.extend_from_slice(&(since.as_secs() as u32).to_le_bytes());
    rec.extend_from_slice(&since.subsec_micros().to_le_bytes());
    rec.extend_from_slice(&(incl as u32).to_le_bytes());
    rec.extend_from_slice(&(packet.len() as u32).to_le_bytes());
    rec.extend_from_slice(&packet[..incl]);
    rec
}

/// Capture into any writer.
pub struct PcapWriter<W: Write> {
    writer: W,
    snaplen: u32,
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut writer: W, snaplen: u32) -> io::Result<Self> {
        writer.write_all(&global_header(snaplen))?;
        Ok(Self { writer, snaplen })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> CaptureSink for PcapWriter<W> {
    fn capture(&mut self, packet: &[u8], time: SystemTime) -> io::Result<()> {
        self.writer.write_all(&record(packet, time, self.snaplen))
    }
}

/// Capture file that starts over with a fresh header once it would grow
/// past `max_size`.
pub struct PcapFile {
    path: PathBuf,
    file: File,
    snaplen: u32,
    max_size: u64,
    size: u64,
}

impl PcapFile {
    pub fn create(path: impl AsRef<Path>, snaplen: u32, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut pcap = Self {
            path,
            file,
            snaplen,
            max_size,
            size: 0,
        };
        pcap.write_header()?;
        info!("Capturing packets to {}", pcap.path.display());
        Ok(pcap)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let hdr = global_header(self.snaplen);
        self.file.write_all(&hdr)?;
        self.size = hdr.len() as u64;
        Ok(())
    }

    fn restart(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.write_header()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl CaptureSink for PcapFile {
    fn capture(&mut self, packet: &[u8], time: SystemTime) -> io::Result<()> {
        let rec = record(packet, time, self.snaplen);
        if self.size + rec.len() as u64 > self.max_size {
            info!("Truncating capture file {}", self.path.display());
            self.restart()?;
        }
        self.file.write_all(&rec)?;
        self.size += rec.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_global_header_layout() {
        let hdr = global_header(128);
        assert_eq!(hdr.len(), GLOBAL_HEADER_LEN);
        assert_eq!(&hdr[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(u16::from_le_bytes([hdr[4], hdr[5]]), 2);
        assert_eq!(u16::from_le_bytes([hdr[6], hdr[7]]), 4);
        assert_eq!(u32::from_le_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]), 128);
        assert_eq!(u32::from_le_bytes([hdr[20], hdr[21], hdr[22], hdr[23]]), 101);
    }

    #[test]
    fn test_record_truncated_to_snaplen() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        let packet = vec![0x45u8; 300];
        let rec = record(&packet, time, 128);
        assert_eq!(rec.len(), RECORD_HEADER_LEN + 128);
        assert_eq!(u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]), 1_700_000_000);
        assert_eq!(u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]), 250_000);
        assert_eq!(u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]), 128);
        assert_eq!(u32::from_le_bytes([rec[12], rec[13], rec[14], rec[15]]), 300);
    }

    #[test]
    fn test_writer_into_vec() {
        let mut w = PcapWriter::new(Vec::new(), 64).unwrap();
        w.capture(&[1, 2, 3], SystemTime::now()).unwrap();
        let buf = w.into_inner();
        assert_eq!(buf.len(), GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 3);
    }

    #[test]
    fn test_file_restarts_at_max_size() {
        let name = format!("tunguard-capture-{}.pcap", std::process::id());
        let path = std::env::temp_dir().join(name);
        let max = (GLOBAL_HEADER_LEN + 2 * (RECORD_HEADER_LEN + 40)) as u64;
        let mut pcap = PcapFile::create(&path, 128, max).unwrap();
        let packet = [0u8; 40];
        pcap.capture(&packet, SystemTime::now()).unwrap();
        pcap.capture(&packet, SystemTime::now()).unwrap();
        assert_eq!(pcap.size(), max);

        pcap.capture(&packet, SystemTime::now()).unwrap();
        let expected = (GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 40) as u64;
        assert_eq!(pcap.size(), expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
        std::fs::remove_file(&path).unwrap();
    }
}
