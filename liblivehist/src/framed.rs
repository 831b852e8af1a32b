//! A minimal length-prefixed buffer format, readable from files or a TCP stream.
//!
//! Each buffer is laid out as
//!
//! ```text
//! [u32 LE payload length][u16 LE event code][payload bytes]
//! ```
//!
//! Reads are accumulated in a pending buffer and frames are cut out of it only once complete,
//! so a frame split across reads (or across appends to a file being written) is never lost.
//! A partial frame left at the end of a finished file is handed out by
//! [`BufferSource::take_partial`] as a truncated buffer.
//!
//! A frame declaring more than `max_buffer_bytes` of payload is handed out as truncated as soon
//! as the first `max_buffer_bytes` have arrived; the rest is dropped as it is read, so the
//! pending buffer never holds much more than one maximal frame.
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use super::error::SourceError;
use super::event::EventCode;
use super::source::{BufferSource, ReadOutcome};

pub const FRAME_HEADER_BYTES: usize = 6;
const READ_CHUNK_BYTES: usize = 8192;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Write one frame
pub fn write_frame<W: Write>(
    writer: &mut W,
    code: EventCode,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_u16::<LittleEndian>(code)?;
    writer.write_all(payload)
}

#[derive(Debug)]
enum Stream {
    Closed,
    File(File),
    Online(TcpStream),
}

#[derive(Debug)]
pub struct FramedSource {
    stream: Stream,
    pending: Vec<u8>,
    buffer: Vec<u8>,
    event_code: EventCode,
    max_buffer_bytes: usize,
    /// Payload bytes of an oversized frame still to be dropped
    discard: usize,
    poll_interval: Duration,
    connect_timeout: Duration,
    bytes_read: u64,
}

impl FramedSource {
    /// Payloads longer than `max_buffer_bytes` are cut and reported as truncated
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            stream: Stream::Closed,
            pending: Vec::new(),
            buffer: Vec::new(),
            event_code: 0,
            max_buffer_bytes: max_buffer_bytes.max(1),
            discard: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bytes_read: 0,
        }
    }

    /// How long an online read waits before reporting [`ReadOutcome::Idle`]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// How long `connect_online` waits for each resolved address
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.discard = 0;
        self.buffer.clear();
        self.bytes_read = 0;
    }

    fn store(&mut self, code: EventCode, payload_end: usize, length: usize) -> ReadOutcome {
        let kept = (payload_end - FRAME_HEADER_BYTES).min(self.max_buffer_bytes);
        self.event_code = code;
        self.buffer.clear();
        self.buffer
            .extend_from_slice(&self.pending[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + kept]);
        if kept < length {
            ReadOutcome::Truncated {
                expected: length,
                received: kept,
            }
        } else {
            ReadOutcome::Buffer
        }
    }

    fn drop_discarded(&mut self) {
        let dropped = self.discard.min(self.pending.len());
        self.pending.drain(..dropped);
        self.discard -= dropped;
    }

    /// Cut a frame out of the pending bytes once its kept part is complete
    fn take_frame(&mut self) -> Option<ReadOutcome> {
        self.drop_discarded();
        if self.pending.len() < FRAME_HEADER_BYTES {
            return None;
        }
        let length = LittleEndian::read_u32(&self.pending[..4]) as usize;
        let code = LittleEndian::read_u16(&self.pending[4..FRAME_HEADER_BYTES]);
        let kept = length.min(self.max_buffer_bytes);
        let end = FRAME_HEADER_BYTES + kept;
        if self.pending.len() < end {
            return None;
        }
        let outcome = self.store(code, end, length);
        self.pending.drain(..end);
        self.discard = length - kept;
        self.drop_discarded();
        Some(outcome)
    }
}

impl BufferSource for FramedSource {
    fn open_file(&mut self, path: &Path, _extra: &[String]) -> Result<(), SourceError> {
        if !path.exists() {
            return Err(SourceError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        self.reset();
        self.stream = Stream::File(file);
        spdlog::info!("Opened framed file {path:?}");
        Ok(())
    }

    fn connect_online(
        &mut self,
        host: &str,
        secondary: &str,
        _extra: &[String],
    ) -> Result<(), SourceError> {
        let address = if host.contains(':') || secondary.is_empty() {
            host.to_string()
        } else {
            format!("{host}:{secondary}")
        };
        let failed = |e: std::io::Error| SourceError::ConnectionFailed {
            host: address.clone(),
            reason: e.to_string(),
        };
        let mut last_error = std::io::Error::new(ErrorKind::NotFound, "no address resolved");
        let mut connected = None;
        for candidate in address.to_socket_addrs().map_err(failed)? {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = e,
            }
        }
        let stream = connected.ok_or_else(|| failed(last_error))?;
        stream
            .set_read_timeout(Some(self.poll_interval))
            .map_err(failed)?;
        self.reset();
        self.stream = Stream::Online(stream);
        spdlog::info!("Connected to online source {address}");
        Ok(())
    }

    fn read_buffer_offline(&mut self) -> Result<ReadOutcome, SourceError> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(outcome) = self.take_frame() {
                return Ok(outcome);
            }
            let file = match &mut self.stream {
                Stream::File(file) => file,
                _ => return Err(SourceError::Unsupported("offline reads without an open file")),
            };
            match file.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Exhausted),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    self.bytes_read += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_buffer_online(&mut self) -> Result<ReadOutcome, SourceError> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(outcome) = self.take_frame() {
                return Ok(outcome);
            }
            let stream = match &mut self.stream {
                Stream::Online(stream) => stream,
                _ => return Err(SourceError::Unsupported("online reads without a connection")),
            };
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Exhausted),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    self.bytes_read += n as u64;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Idle)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_partial(&mut self) -> Option<ReadOutcome> {
        if self.pending.len() <= FRAME_HEADER_BYTES {
            return None;
        }
        let length = LittleEndian::read_u32(&self.pending[..4]) as usize;
        let code = LittleEndian::read_u16(&self.pending[4..FRAME_HEADER_BYTES]);
        let end = self.pending.len();
        let outcome = self.store(code, end, length);
        self.pending.clear();
        Some(outcome)
    }

    fn event_code(&self) -> EventCode {
        self.event_code
    }

    fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn close_file(&mut self) {
        if matches!(self.stream, Stream::File(_)) {
            self.stream = Stream::Closed;
        }
    }

    fn disconnect_online(&mut self) {
        if let Stream::Online(stream) = &self.stream {
            // The peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
            self.stream = Stream::Closed;
        }
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use std::net::TcpListener;

    fn frames(entries: &[(EventCode, &[u8])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (code, payload) in entries {
            write_frame(&mut bytes, *code, payload).unwrap();
        }
        bytes
    }

    #[test]
    fn test_read_file_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&frames(&[(1, &[1, 2, 3]), (7, &[]), (2, &[9; 5])]))
            .unwrap();

        let mut source = FramedSource::new(1024);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.event_code(), 1);
        assert_eq!(source.buffer(), &[1, 2, 3]);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.event_code(), 7);
        assert!(source.buffer().is_empty());
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.buffer(), &[9; 5]);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);
        assert_eq!(source.bytes_read(), 3 * 6 + 8);
    }

    #[test]
    fn test_truncated_final_payload() {
        let mut bytes = frames(&[(1, &[1, 2, 3, 4])]);
        bytes.extend(frames(&[(1, &[5, 6, 7, 8])]));
        bytes.truncate(bytes.len() - 2);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let mut source = FramedSource::new(1024);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);
        assert_eq!(
            source.take_partial(),
            Some(ReadOutcome::Truncated {
                expected: 4,
                received: 2
            })
        );
        assert_eq!(source.buffer(), &[5, 6]);
        assert_eq!(source.take_partial(), None);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);
    }

    #[test]
    fn test_oversized_payload_is_cut() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&frames(&[(3, &[1; 10]), (4, &[2; 2])])).unwrap();
        let mut source = FramedSource::new(4);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(
            source.read_buffer_offline().unwrap(),
            ReadOutcome::Truncated {
                expected: 10,
                received: 4
            }
        );
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.event_code(), 4);
    }

    #[test]
    fn test_hostile_length_is_not_buffered() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(u32::MAX).unwrap();
        bytes.write_u16::<LittleEndian>(9).unwrap();
        bytes.extend((0..8 << 20).map(|i| i as u8));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let mut source = FramedSource::new(16);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(
            source.read_buffer_offline().unwrap(),
            ReadOutcome::Truncated {
                expected: u32::MAX as usize,
                received: 16
            }
        );
        assert_eq!(source.event_code(), 9);
        assert_eq!(source.buffer(), &(0..16).collect::<Vec<u8>>()[..]);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);
        assert!(source.pending.is_empty());
        assert_eq!(source.take_partial(), None);
        assert_eq!(source.bytes_read(), bytes.len() as u64);
    }

    #[test]
    fn test_oversized_frame_split_across_appends() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes = frames(&[(3, &[1; 40]), (4, &[2; 2])]);
        file.write_all(&bytes[..20]).unwrap();

        let mut source = FramedSource::new(8);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(
            source.read_buffer_offline().unwrap(),
            ReadOutcome::Truncated {
                expected: 40,
                received: 8
            }
        );
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);
        assert!(source.pending.is_empty());

        file.seek(std::io::SeekFrom::End(0)).unwrap();
        file.write_all(&bytes[20..]).unwrap();
        file.flush().unwrap();
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.event_code(), 4);
        assert_eq!(source.buffer(), &[2, 2]);
    }

    #[test]
    fn test_appended_data_is_picked_up() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes = frames(&[(1, &[1, 1]), (2, &[2, 2])]);
        // first frame plus half of the second header
        file.write_all(&bytes[..11]).unwrap();

        let mut source = FramedSource::new(1024);
        source.open_file(file.path(), &[]).unwrap();
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Exhausted);

        file.seek(std::io::SeekFrom::End(0)).unwrap();
        file.write_all(&bytes[11..]).unwrap();
        file.flush().unwrap();
        assert_eq!(source.read_buffer_offline().unwrap(), ReadOutcome::Buffer);
        assert_eq!(source.event_code(), 2);
    }

    #[test]
    fn test_missing_file() {
        let mut source = FramedSource::new(16);
        assert!(matches!(
            source.open_file(Path::new("/definitely/not/here.frames"), &[]),
            Err(SourceError::BadFilePath(_))
        ));
        assert!(matches!(
            source.read_buffer_offline(),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_online_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let server = std::thread::spawn(move || {
            let (mut client, _) = listener.accept().unwrap();
            let bytes = frames(&[(5, &[1, 2]), (6, &[3])]);
            client.write_all(&bytes[..4]).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            client.write_all(&bytes[4..]).unwrap();
        });

        let mut source = FramedSource::new(1024).with_poll_interval(Duration::from_millis(20));
        source.connect_online("127.0.0.1", &port, &[]).unwrap();
        let mut codes = Vec::new();
        for _ in 0..200 {
            match source.read_buffer_online().unwrap() {
                ReadOutcome::Buffer => codes.push(source.event_code()),
                ReadOutcome::Idle => continue,
                ReadOutcome::Exhausted => break,
                ReadOutcome::Truncated { .. } => panic!("unexpected truncation"),
            }
        }
        server.join().unwrap();
        source.disconnect_online();
        assert_eq!(codes, vec![5, 6]);
    }

    #[test]
    fn test_connect_gives_up_after_timeout() {
        let start = std::time::Instant::now();
        // TEST-NET-1 is never routed
        let mut source = FramedSource::new(16).with_connect_timeout(Duration::from_millis(100));
        assert!(matches!(
            source.connect_online("192.0.2.1", "9", &[]),
            Err(SourceError::ConnectionFailed { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut source = FramedSource::new(16);
        assert!(matches!(
            source.connect_online(&format!("127.0.0.1:{port}"), "", &[]),
            Err(SourceError::ConnectionFailed { .. })
        ));
    }
}
