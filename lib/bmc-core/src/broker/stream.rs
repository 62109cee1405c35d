//! File-backed durable streams.
//!
//! Each stream is an append-only file, `<store_dir>/<stream>.stream`, holding a sequence of records:
//!
//! ```text
//! +----------------+-------------+-----------------+
//! | sequence (u64) | length (u32)| payload (bytes) |
//! +----------------+-------------+-----------------+
//! ```
//!
//! Integers are big-endian. Sequences start at 1 and increase by one per record. A torn record at the end of a file
//! (from a crash mid-append) is dropped, and the file truncated, when the stream is recovered.
//!
//! Recent records are also retained in memory so that reading the tail of a stream does not touch the disk. Memory and
//! storage limits apply per stream.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt as _,
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::collections::FastHashMap;

const STREAM_FILE_EXTENSION: &str = "stream";
const RECORD_HEADER_LEN: usize = 12;

/// Stream errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StreamError {
    /// The stream name cannot be used as a file name.
    #[snafu(display("Invalid stream name '{}': only alphanumerics, '-' and '_' are allowed.", name))]
    InvalidStreamName {
        /// The rejected name.
        name: String,
    },

    /// Appending the record would exceed the stream's storage limit.
    #[snafu(display("Stream '{}' would exceed its storage limit of {} bytes.", stream, limit))]
    StorageLimitExceeded {
        /// The stream that is full.
        stream: String,

        /// The storage limit, in bytes.
        limit: u64,
    },

    /// The record payload does not fit in a record's length field.
    #[snafu(display("Record of {} bytes is too large for stream '{}'.", size, stream))]
    RecordTooLarge {
        /// The stream the record was appended to.
        stream: String,

        /// The payload size, in bytes.
        size: usize,
    },

    /// Reading or writing a stream file failed.
    #[snafu(display("I/O error on stream file '{}': {}", path.display(), source))]
    Io {
        /// The file or directory involved.
        path: PathBuf,

        /// The underlying error.
        source: io::Error,
    },
}

/// A record in a durable stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamRecord {
    /// Position of the record in its stream, starting at 1.
    pub sequence: u64,

    /// The record payload.
    pub payload: Bytes,
}

impl StreamRecord {
    fn encoded_len(&self) -> u64 {
        (RECORD_HEADER_LEN + self.payload.len()) as u64
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + self.payload.len());
        buf.put_u64(self.sequence);
        // Payload lengths are checked against `u32::MAX` on append.
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Decodes every complete record in `data`, returning them along with the number of bytes they span.
fn decode_records(data: Bytes) -> (Vec<StreamRecord>, usize) {
    let mut buf = data;
    let mut records: Vec<StreamRecord> = Vec::new();
    let mut consumed = 0;

    while buf.len() >= RECORD_HEADER_LEN {
        let sequence = (&buf[0..8]).get_u64();
        let len = (&buf[8..12]).get_u32() as usize;
        if buf.len() < RECORD_HEADER_LEN + len {
            break;
        }
        if records.last().is_some_and(|last| sequence <= last.sequence) {
            break;
        }

        buf.advance(RECORD_HEADER_LEN);
        let payload = buf.split_to(len);
        consumed += RECORD_HEADER_LEN + len;
        records.push(StreamRecord { sequence, payload });
    }

    (records, consumed)
}

fn check_payload_len(stream: &str, size: usize) -> Result<(), StreamError> {
    if u32::try_from(size).is_ok() {
        Ok(())
    } else {
        Err(StreamError::RecordTooLarge {
            stream: stream.to_string(),
            size,
        })
    }
}

fn is_valid_stream_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate_stream_name(name: &str) -> Result<(), StreamError> {
    if is_valid_stream_name(name) {
        Ok(())
    } else {
        Err(StreamError::InvalidStreamName { name: name.to_string() })
    }
}

struct StreamLog {
    path: PathBuf,
    file: Option<File>,
    next_sequence: u64,
    retained: VecDeque<StreamRecord>,
    retained_bytes: u64,
    stored_bytes: u64,
}

impl StreamLog {
    fn new(path: PathBuf, next_sequence: u64, stored_bytes: u64) -> Self {
        Self {
            path,
            file: None,
            next_sequence,
            retained: VecDeque::new(),
            retained_bytes: 0,
            stored_bytes,
        }
    }

    fn retain(&mut self, record: StreamRecord, max_memory: Option<u64>) {
        self.retained_bytes += record.payload.len() as u64;
        self.retained.push_back(record);

        if let Some(limit) = max_memory {
            while self.retained_bytes > limit {
                match self.retained.pop_front() {
                    Some(evicted) => self.retained_bytes -= evicted.payload.len() as u64,
                    None => break,
                }
            }
        }
    }

    /// Returns the open stream file, opening it if needed.
    ///
    /// A freshly opened file is cut back to `stored_bytes`, so bytes past the last acknowledged record never precede a
    /// new one.
    async fn file(&mut self) -> Result<&mut File, StreamError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .context(Io { path: &self.path })?;

                let len = file.metadata().await.context(Io { path: &self.path })?.len();
                if len > self.stored_bytes {
                    warn!(
                        path = %self.path.display(),
                        dropped_bytes = len - self.stored_bytes,
                        "Stream file has bytes past its last record. Truncating."
                    );
                    file.set_len(self.stored_bytes).await.context(Io { path: &self.path })?;
                }
                file
            }
        };

        Ok(self.file.insert(file))
    }

    async fn write(&mut self, record: &StreamRecord) -> Result<(), StreamError> {
        let encoded = record.encode();
        let path = self.path.clone();
        let result = async {
            let file = self.file().await?;
            file.write_all(&encoded).await.context(Io { path: &path })?;
            file.flush().await.context(Io { path: &path })
        }
        .await;

        if let Err(e) = result {
            // Part of the record may have reached the file. Drop the handle and cut the file back to the last
            // acknowledged record; if that fails too, the next open does it.
            self.file = None;
            if let Err(truncate_error) = truncate(&self.path, self.stored_bytes).await {
                warn!(error = %truncate_error, "Failed to discard partially written stream record.");
            }
            return Err(e);
        }

        self.stored_bytes += encoded.len() as u64;
        Ok(())
    }
}

/// Durable streams of a single bus.
pub(super) struct StreamStore {
    dir: PathBuf,
    max_memory: Option<u64>,
    max_storage: Option<u64>,
    streams: Mutex<FastHashMap<String, StreamLog>>,
}

impl StreamStore {
    pub fn new(dir: PathBuf, max_memory: Option<u64>, max_storage: Option<u64>) -> Self {
        Self {
            dir,
            max_memory,
            max_storage,
            streams: Mutex::new(FastHashMap::default()),
        }
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stream, STREAM_FILE_EXTENSION))
    }

    /// Recovers every stream found in the store directory, creating the directory if needed.
    ///
    /// Returns the number of streams recovered.
    pub async fn recover(&self) -> Result<usize, StreamError> {
        fs::create_dir_all(&self.dir).await.context(Io { path: &self.dir })?;
        let mut entries = fs::read_dir(&self.dir).await.context(Io { path: &self.dir })?;

        let mut streams = self.streams.lock().await;
        while let Some(entry) = entries.next_entry().await.context(Io { path: &self.dir })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STREAM_FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|name| is_valid_stream_name(name))
                .map(str::to_string)
            else {
                continue;
            };

            let log = self.load(&name, path).await?;
            debug!(stream = %name, next_sequence = log.next_sequence, "Recovered stream.");
            streams.insert(name, log);
        }

        Ok(streams.len())
    }

    async fn load(&self, name: &str, path: PathBuf) -> Result<StreamLog, StreamError> {
        let data = fs::read(&path).await.context(Io { path: &path })?;
        let total_len = data.len();
        let (records, valid_len) = decode_records(Bytes::from(data));

        if valid_len < total_len {
            warn!(
                stream = name,
                dropped_bytes = total_len - valid_len,
                "Stream file ends with an incomplete record. Truncating."
            );
            truncate(&path, valid_len as u64).await?;
        }

        let next_sequence = records.last().map_or(1, |record| record.sequence + 1);
        let mut log = StreamLog::new(path, next_sequence, valid_len as u64);
        for record in records {
            log.retain(record, self.max_memory);
        }

        Ok(log)
    }

    /// Appends a record to `stream`, creating the stream if it does not exist yet.
    ///
    /// Returns the sequence number assigned to the record.
    pub async fn append(&self, stream: &str, payload: Bytes) -> Result<u64, StreamError> {
        validate_stream_name(stream)?;
        check_payload_len(stream, payload.len())?;

        let mut streams = self.streams.lock().await;
        let log = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamLog::new(self.stream_path(stream), 1, 0));

        let record = StreamRecord {
            sequence: log.next_sequence,
            payload,
        };
        if let Some(limit) = self.max_storage {
            if log.stored_bytes + record.encoded_len() > limit {
                return Err(StreamError::StorageLimitExceeded {
                    stream: stream.to_string(),
                    limit,
                });
            }
        }

        log.write(&record).await?;
        log.next_sequence += 1;

        let sequence = record.sequence;
        log.retain(record, self.max_memory);
        Ok(sequence)
    }

    /// Reads every record of `stream` with a sequence at or after `from_sequence`.
    ///
    /// Records still retained in memory are served from memory; older ones are read back from disk.
    pub async fn read(&self, stream: &str, from_sequence: u64) -> Result<Vec<StreamRecord>, StreamError> {
        validate_stream_name(stream)?;

        let streams = self.streams.lock().await;
        let Some(log) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        let from_sequence = from_sequence.max(1);
        let oldest_retained = log
            .retained
            .front()
            .map_or(log.next_sequence, |record| record.sequence);
        if from_sequence >= oldest_retained {
            return Ok(log
                .retained
                .iter()
                .filter(|record| record.sequence >= from_sequence)
                .cloned()
                .collect());
        }

        let data = fs::read(&log.path).await.context(Io { path: &log.path })?;
        let (records, _) = decode_records(Bytes::from(data));
        Ok(records
            .into_iter()
            .filter(|record| record.sequence >= from_sequence)
            .collect())
    }
}

async fn truncate(path: &Path, len: u64) -> Result<(), StreamError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .context(Io { path })?;
    file.set_len(len).await.context(Io { path })
}
