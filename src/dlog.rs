//! Data-log file retrieval and decoding.
//!
//! A dlog file is an ASCII/XML header closed by `</dlog>\n`, an 8-byte
//! binary prologue, then a flat run of 4-byte big-endian sample words in
//! acquisition order.

use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Scpi;
use crate::transport::{ReadOutcome, Transport};

/// Where the instrument writes its log. Each run overwrites it.
pub const DEFAULT_LOG_PATH: &str = "internal:\\data1.dlog";

/// Read budget used when draining a file transfer.
pub const CHUNK_SIZE: usize = 512;

const HEADER_END: &[u8] = b"</dlog>\n";
const PROLOGUE_LEN: usize = 8;

/// Bytes received for one log file transfer.
#[derive(Debug, Clone)]
pub struct RawLog {
    /// Size reported by `MMEM:ATTR?`. Advisory only: the transfer usually
    /// carries more bytes than this (block framing and terminator).
    pub reported_size: i32,
    pub bytes: Bytes,
    pub elapsed: Duration,
}

impl RawLog {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Transfer rate in KiB/s.
    pub fn throughput_kib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes.len() as f64 / 1024.0 / secs
        } else {
            f64::INFINITY
        }
    }

    /// The file contents inside an IEEE 488.2 definite-length block
    /// (`#<n><len><data>`), or the whole buffer when no block header is
    /// present or it cannot be honoured.
    pub fn payload(&self) -> Bytes {
        match definite_block(&self.bytes) {
            Some((start, len)) => self.bytes.slice(start..start + len),
            None => self.bytes.clone(),
        }
    }
}

fn definite_block(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.first() != Some(&b'#') {
        return None;
    }
    let digits = (*buf.get(1)? as char).to_digit(10)? as usize;
    if digits == 0 {
        return None;
    }
    let len: usize = std::str::from_utf8(buf.get(2..2 + digits)?).ok()?.parse().ok()?;
    let start = 2 + digits;
    (start + len <= buf.len()).then_some((start, len))
}

/// Fetch `path` from instrument mass storage.
///
/// Reads [`CHUNK_SIZE`] bytes at a time until the transport stops
/// signalling pending data; the reported file size plays no part in
/// deciding when the transfer is complete.
pub async fn download<T: Transport + ?Sized>(scpi: &mut Scpi<'_, T>, path: &str) -> Result<RawLog> {
    let command = format!("MMEM:ATTR? \"{path}\",\"FileSize\"");
    let resp = scpi.query(&command).await?;
    let reported_size = resp
        .replace('"', "")
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::response(&command, &resp))?;
    debug!("File {} size is {} bytes", path, reported_size);

    scpi.write(&format!("MMEM:DATA:DEF? \"{path}\"")).await?;

    let start = Instant::now();
    let mut buffer = BytesMut::new();
    loop {
        let chunk = scpi.read_chunk(CHUNK_SIZE).await;
        match chunk.outcome {
            ReadOutcome::Error(status) => {
                return Err(Error::Transfer {
                    status,
                    received: buffer.len(),
                });
            }
            ReadOutcome::More => buffer.extend_from_slice(&chunk.bytes),
            ReadOutcome::End => {
                buffer.extend_from_slice(&chunk.bytes);
                break;
            }
        }
    }

    let raw = RawLog {
        reported_size,
        bytes: buffer.freeze(),
        elapsed: start.elapsed(),
    };
    debug!("bytes read   {}", raw.len());
    debug!("FileSize?    {}", raw.reported_size);
    debug!("speed        {:.3} KB/s", raw.throughput_kib_s());
    Ok(raw)
}

/// How a caller wants the 32-bit sample words read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SampleFormat {
    /// IEEE-754 single precision (amps or volts).
    Float,
    /// The raw word, printed as hex.
    Hex,
}

/// Decoded view of a dlog file.
#[derive(Debug, Clone)]
pub struct SampleStream {
    file: Bytes,
    header_len: usize,
    offset: usize,
}

/// Split a downloaded file into header, prologue and sample words.
pub fn parse(file: impl Into<Bytes>) -> Result<SampleStream> {
    let file = file.into();
    let header_len = file
        .windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
        .ok_or_else(|| Error::MalformedFile("header terminator </dlog> not found".into()))?;
    let offset = header_len + PROLOGUE_LEN;
    if offset > file.len() {
        return Err(Error::MalformedFile(format!(
            "file ends {} bytes into the {}-byte prologue",
            file.len() - header_len,
            PROLOGUE_LEN
        )));
    }
    let len = file.len() - offset;
    if len % 4 != 0 {
        return Err(Error::Framing {
            len,
            trailing: len % 4,
        });
    }

    let stream = SampleStream {
        file,
        header_len,
        offset,
    };
    let [first, second] = stream.prologue();
    debug!("1st dword    {:x}", first);
    debug!("2nd dword    {:x}", second);
    debug!("Offset       {} B", offset);
    Ok(stream)
}

impl SampleStream {
    /// The text header, including its closing tag.
    pub fn header(&self) -> String {
        String::from_utf8_lossy(&self.file[..self.header_len]).into_owned()
    }

    /// The two words between the header and the samples.
    pub fn prologue(&self) -> [u32; 2] {
        let p = &self.file[self.header_len..self.offset];
        [word(&p[..4]), word(&p[4..])]
    }

    /// Byte offset of the first sample in the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        (self.file.len() - self.offset) / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sample region as raw bytes.
    pub fn sample_bytes(&self) -> Bytes {
        self.file.slice(self.offset..)
    }

    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?.checked_add(self.offset)?;
        self.file.get(start..start.checked_add(4)?).map(word)
    }

    /// Raw sample words in acquisition order.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.file[self.offset..].chunks_exact(4).map(word)
    }

    /// Samples reinterpreted as IEEE-754 floats.
    pub fn floats(&self) -> impl Iterator<Item = f32> + '_ {
        self.words().map(f32::from_bits)
    }

    /// Render one sample according to `format`.
    pub fn format_sample(&self, index: usize, format: SampleFormat) -> Option<String> {
        let raw = self.word(index)?;
        Some(match format {
            SampleFormat::Float => format!("{:e}", f32::from_bits(raw)),
            SampleFormat::Hex => format!("{raw:08x}"),
        })
    }
}

fn word(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, synthetic_dlog};
    use crate::transport::{SessionId, Status};

    fn file(samples: &[u32]) -> Vec<u8> {
        let mut buf = b"<dlog>\n<channel id=\"1\"/>\n</dlog>\n".to_vec();
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x02]);
        for s in samples {
            buf.extend_from_slice(&s.to_be_bytes());
        }
        buf
    }

    #[test]
    fn samples_follow_header_and_prologue() {
        let stream = parse(file(&[0x3521_1000, 0x3442_c000, 0xb407_c000])).unwrap();
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.offset(), 33 + 8);
        assert_eq!(stream.words().collect::<Vec<_>>(), vec![0x3521_1000, 0x3442_c000, 0xb407_c000]);
        assert_eq!(stream.prologue(), [0xdead_beef, 2]);
        assert!(stream.header().ends_with("</dlog>\n"));
    }

    #[test]
    fn streams_are_re_iterable() {
        let stream = parse(file(&[1, 2, 3, 4])).unwrap();
        let first: u32 = stream.words().sum();
        let second: u32 = stream.words().sum();
        assert_eq!(first, 10);
        assert_eq!(first, second);
    }

    #[test]
    fn float_interpretation_is_the_callers_choice() {
        let stream = parse(file(&[1.5f32.to_bits(), (-2.0f32).to_bits()])).unwrap();
        assert_eq!(stream.floats().collect::<Vec<_>>(), vec![1.5, -2.0]);
        assert_eq!(stream.format_sample(0, SampleFormat::Hex).as_deref(), Some("3fc00000"));
        assert_eq!(stream.format_sample(2, SampleFormat::Float), None);
    }

    #[test]
    fn out_of_range_index_is_none() {
        let stream = parse(file(&[1, 2, 3])).unwrap();
        assert_eq!(stream.word(2), Some(3));
        assert_eq!(stream.word(3), None);
        assert_eq!(stream.word(usize::MAX), None);
        assert_eq!(stream.word(usize::MAX / 4), None);
        assert_eq!(stream.format_sample(usize::MAX, SampleFormat::Hex), None);
    }

    #[test]
    fn empty_sample_region_is_valid() {
        let stream = parse(file(&[])).unwrap();
        assert!(stream.is_empty());
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let err = parse(b"<dlog>\n<channel/>\n\x00\x00\x00\x00\x00\x00\x00\x00".to_vec()).unwrap_err();
        assert!(matches!(err, Error::MalformedFile(_)));
    }

    #[test]
    fn truncated_prologue_is_malformed() {
        let err = parse(b"<dlog></dlog>\n\x00\x00\x00".to_vec()).unwrap_err();
        assert!(matches!(err, Error::MalformedFile(_)));
    }

    #[test]
    fn trailing_partial_word_is_framing_error() {
        let mut buf = file(&[7, 8]);
        buf.push(b'\n');
        let err = parse(buf).unwrap_err();
        assert!(matches!(err, Error::Framing { len: 9, trailing: 1 }));
    }

    #[test]
    fn first_terminator_wins() {
        // A terminator sequence inside the sample region must not move the offset.
        let mut buf = file(&[]);
        buf.extend_from_slice(HEADER_END);
        let stream = parse(buf).unwrap();
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn payload_unwraps_definite_length_block() {
        let block = synthetic_dlog(&[0.25, 0.5, 0.75]);
        let raw = RawLog {
            reported_size: 0,
            bytes: Bytes::from(block.clone()),
            elapsed: Duration::from_millis(1),
        };
        // the trailing newline terminator makes the raw buffer unframeable
        assert!(matches!(parse(raw.bytes.clone()), Err(Error::Framing { .. })));
        let stream = parse(raw.payload()).unwrap();
        assert_eq!(stream.floats().collect::<Vec<_>>(), vec![0.25, 0.5, 0.75]);
    }

    #[test]
    fn payload_without_block_header_is_whole_buffer() {
        let raw = RawLog {
            reported_size: 0,
            bytes: Bytes::from(file(&[1])),
            elapsed: Duration::ZERO,
        };
        assert_eq!(raw.payload(), raw.bytes);
        assert_eq!(definite_block(b"#9123"), None);
    }

    async fn session(mock: &mut MockTransport) -> SessionId {
        let (_, rm) = mock.open_default_rm().await;
        let (_, vi) = mock.open(rm, "USB0::1::INSTR", Duration::from_secs(2)).await;
        vi
    }

    #[tokio::test]
    async fn download_concatenates_until_end_of_data() {
        let chunks = vec![
            (Status::SUCCESS_MAX_CNT, vec![1u8; 512]),
            (Status::SUCCESS_MAX_CNT, vec![2u8; 512]),
            (Status::SUCCESS, vec![3u8; 40]),
        ];
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "N6705B")
            .with_reply("MMEM:ATTR? \"internal:\\data1.dlog\",\"FileSize\"", "\"17\"")
            .with_transfer(chunks.clone());
        let vi = session(&mut mock).await;

        let raw = download(&mut Scpi::new(&mut mock, vi), DEFAULT_LOG_PATH).await.unwrap();
        let expected: Vec<u8> = chunks.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(raw.reported_size, 17);
        assert_eq!(raw.bytes.as_ref(), expected.as_slice());
        assert_eq!(
            mock.commands(),
            vec![
                "MMEM:ATTR? \"internal:\\data1.dlog\",\"FileSize\"".to_string(),
                "MMEM:DATA:DEF? \"internal:\\data1.dlog\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn zero_length_final_read_ends_transfer() {
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "N6705B")
            .with_reply("MMEM:ATTR? \"internal:\\data1.dlog\",\"FileSize\"", "\"1024\"")
            .with_transfer(vec![
                (Status::SUCCESS_MAX_CNT, vec![9u8; 512]),
                (Status::SUCCESS, Vec::new()),
            ]);
        let vi = session(&mut mock).await;
        let raw = download(&mut Scpi::new(&mut mock, vi), DEFAULT_LOG_PATH).await.unwrap();
        assert_eq!(raw.len(), 512);
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_time_follows_the_runtime_clock() {
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "N6705B")
            .with_file(&[7u8; 1000]);
        let vi = session(&mut mock).await;
        let raw = download(&mut Scpi::new(&mut mock, vi), DEFAULT_LOG_PATH).await.unwrap();
        assert_eq!(raw.len(), 1000);
        assert_eq!(raw.elapsed, Duration::ZERO);
        assert_eq!(raw.throughput_kib_s(), f64::INFINITY);
    }

    #[tokio::test]
    async fn hard_error_mid_transfer_aborts() {
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "N6705B")
            .with_reply("MMEM:ATTR? \"internal:\\data1.dlog\",\"FileSize\"", "\"2048\"")
            .with_transfer(vec![
                (Status::SUCCESS_MAX_CNT, vec![0u8; 512]),
                (Status::ERROR_IO, Vec::new()),
            ]);
        let vi = session(&mut mock).await;
        let err = download(&mut Scpi::new(&mut mock, vi), DEFAULT_LOG_PATH).await.unwrap_err();
        assert!(matches!(err, Error::Transfer { status, received: 512 } if status == Status::ERROR_IO));
    }

    #[tokio::test]
    async fn unquoted_size_garbage_is_response_error() {
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "N6705B")
            .with_reply("MMEM:ATTR? \"internal:\\data1.dlog\",\"FileSize\"", "\"huge\"");
        let vi = session(&mut mock).await;
        let err = download(&mut Scpi::new(&mut mock, vi), DEFAULT_LOG_PATH).await.unwrap_err();
        assert!(matches!(err, Error::Response { .. }));
    }
}
