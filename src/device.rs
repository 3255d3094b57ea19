//! Where checkpoints go.
//!
//! The store is generic over a [`Device`]: [`NullDisk`] keeps nothing and
//! refuses checkpoints, [`FileDisk`] writes each checkpoint into its own
//! directory under an exclusively locked storage path:
//!
//! ```text
//! <path>/
//!   DO_NOT_PUT_YOUR_FILES_HERE
//!   checkpoints/<token>/log.snapshot   [len u64][crc32 u32][value bytes]*
//!   checkpoints/<token>/log.meta       frame(bincode(LogMetadata))
//!   checkpoints/<token>/index.snapshot frame(zstd(bincode(IndexSnapshot)))
//! ```
//!
//! A frame is an 8 byte LE payload length, the payload, and the LE crc32
//! of both XOR 0xAF.
use std::fs;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fault_injection::{annotate, fallible};
use fnv::FnvHashMap;
use inline_array::InlineArray;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SessionId;

const WARN: &str = "DO_NOT_PUT_YOUR_FILES_HERE";
const CHECKPOINT_DIR: &str = "checkpoints";
const LOG_SNAPSHOT: &str = "log.snapshot";
const LOG_META: &str = "log.meta";
const INDEX_SNAPSHOT: &str = "index.snapshot";
const TMP_SUFFIX: &str = ".tmp";

const ZSTD_LEVEL: i32 = 3;
const RECORD_HEADER_LEN: usize = 12;

/// Everything a checkpoint persists, gathered by the engine.
#[derive(Debug, Default)]
pub(crate) struct CheckpointImage {
    pub version: u64,
    pub table_size: u64,
    pub sessions: Vec<(SessionId, u64)>,
    pub records: Vec<(InlineArray, Vec<u8>)>,
}

/// What recovery hands back to the engine. Values stay in the log and
/// are fetched on demand by offset.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub version: u64,
    pub table_size: u64,
    pub sessions: Vec<(SessionId, u64)>,
    pub entries: Vec<(InlineArray, u64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogMetadata {
    token: Uuid,
    version: u64,
    sessions: Vec<(SessionId, u64)>,
    record_count: u64,
    log_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    token: Uuid,
    log_token: Uuid,
    table_size: u64,
    entries: Vec<(InlineArray, u64)>,
}

/// The durability capability behind a store.
pub(crate) trait Device: Send + Sync + 'static {
    /// Whether checkpoints can be taken at all.
    fn is_durable(&self) -> bool;

    fn write_checkpoint(
        &self,
        token: Uuid,
        image: &CheckpointImage,
    ) -> io::Result<()>;

    fn recover(&self, index_token: Uuid, log_token: Uuid)
    -> io::Result<Recovered>;

    /// Reads the value stored at `offset` of a checkpoint log.
    fn read_record(&self, log_token: Uuid, offset: u64) -> io::Result<Vec<u8>>;
}

/// In-memory only.
#[derive(Debug, Default)]
pub(crate) struct NullDisk;

impl Device for NullDisk {
    fn is_durable(&self) -> bool {
        false
    }

    fn write_checkpoint(
        &self,
        _token: Uuid,
        _image: &CheckpointImage,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-memory store cannot checkpoint",
        ))
    }

    fn recover(
        &self,
        _index_token: Uuid,
        _log_token: Uuid,
    ) -> io::Result<Recovered> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "in-memory store has no checkpoints",
        ))
    }

    fn read_record(
        &self,
        _log_token: Uuid,
        _offset: u64,
    ) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "in-memory store has no checkpoint log",
        ))
    }
}

/// Checkpoint files in a locked storage directory.
#[derive(Debug)]
pub(crate) struct FileDisk {
    path: PathBuf,
    logs: Mutex<FnvHashMap<Uuid, Arc<Mutex<fs::File>>>>,
    #[allow(unused)]
    directory_lock: fs::File,
}

impl FileDisk {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileDisk> {
        use fs2::FileExt;

        let path = path.as_ref();
        let checkpoints = path.join(CHECKPOINT_DIR);

        // initialize directories if not present
        for p in [path, &checkpoints] {
            if let Err(e) = fs::read_dir(p) {
                if e.kind() == io::ErrorKind::NotFound {
                    fallible!(fs::create_dir_all(p));
                }
            }
        }

        let _ = fs::File::create(path.join(WARN));

        let directory_lock = fallible!(fs::File::open(path));
        fallible!(directory_lock.try_lock_exclusive());

        remove_incomplete_checkpoints(&checkpoints)?;

        log::debug!("opened FileDisk at {:?}", path);

        Ok(FileDisk {
            path: path.into(),
            logs: Default::default(),
            directory_lock,
        })
    }

    fn checkpoint_dir(&self, token: Uuid) -> PathBuf {
        self.path.join(CHECKPOINT_DIR).join(token.to_string())
    }

    fn log_file(&self, log_token: Uuid) -> io::Result<Arc<Mutex<fs::File>>> {
        let mut logs = self.logs.lock();
        if let Some(file) = logs.get(&log_token) {
            return Ok(file.clone());
        }
        let path = self.checkpoint_dir(log_token).join(LOG_SNAPSHOT);
        let file = Arc::new(Mutex::new(fallible!(fs::File::open(path))));
        logs.insert(log_token, file.clone());
        Ok(file)
    }
}

impl Device for FileDisk {
    fn is_durable(&self) -> bool {
        true
    }

    fn write_checkpoint(
        &self,
        token: Uuid,
        image: &CheckpointImage,
    ) -> io::Result<()> {
        let final_dir = self.checkpoint_dir(token);
        let tmp_dir = final_dir.with_extension(&TMP_SUFFIX[1..]);
        fallible!(fs::create_dir_all(&tmp_dir));

        // values go to the log, keys and offsets to the index
        let log_path = tmp_dir.join(LOG_SNAPSHOT);
        let mut log_file =
            BufWriter::new(fallible!(fs::File::create(log_path)));
        let mut entries = Vec::with_capacity(image.records.len());
        let mut offset = 0_u64;
        for (key, value) in &image.records {
            let hash = crc32fast::hash(value) ^ 0xAF;
            fallible!(log_file.write_all(&(value.len() as u64).to_le_bytes()));
            fallible!(log_file.write_all(&hash.to_le_bytes()));
            fallible!(log_file.write_all(value));
            entries.push((key.clone(), offset));
            offset += (RECORD_HEADER_LEN + value.len()) as u64;
        }
        let log_file = log_file.into_inner().map_err(|e| e.into_error())?;
        fallible!(log_file.sync_all());

        let meta = LogMetadata {
            token,
            version: image.version,
            sessions: image.sessions.clone(),
            record_count: image.records.len() as u64,
            log_bytes: offset,
        };
        let meta_bytes = serialize_frame(&encode(&meta)?);
        write_synced(&tmp_dir.join(LOG_META), &meta_bytes)?;

        let index = IndexSnapshot {
            token,
            log_token: token,
            table_size: image.table_size,
            entries,
        };
        let raw = encode(&index)?;
        let compressed = fallible!(zstd::encode_all(&*raw, ZSTD_LEVEL));
        let frame = serialize_frame(&compressed);
        write_synced(&tmp_dir.join(INDEX_SNAPSHOT), &frame)?;

        fallible!(fs::rename(&tmp_dir, &final_dir));
        let checkpoints_path = self.path.join(CHECKPOINT_DIR);
        let checkpoints = fallible!(fs::File::open(checkpoints_path));
        fallible!(checkpoints.sync_all());

        log::debug!(
            "wrote checkpoint {} with {} records ({} log bytes)",
            token,
            image.records.len(),
            offset
        );

        Ok(())
    }

    fn recover(
        &self,
        index_token: Uuid,
        log_token: Uuid,
    ) -> io::Result<Recovered> {
        let index_path = self.checkpoint_dir(index_token).join(INDEX_SNAPSHOT);
        let mut index_file = fallible!(fs::File::open(index_path));
        let compressed = read_frame(&mut index_file)?;
        let raw = fallible!(zstd::decode_all(&*compressed));
        let index: IndexSnapshot = decode(&raw)?;

        let meta_path = self.checkpoint_dir(log_token).join(LOG_META);
        let meta: LogMetadata =
            decode(&read_frame(&mut fallible!(fs::File::open(meta_path)))?)?;

        if index.log_token != meta.token {
            let e = io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "index checkpoint {} refers to log {}, not {}",
                    index.token, index.log_token, meta.token
                ),
            );
            return Err(annotate!(e));
        }

        if index.entries.len() as u64 != meta.record_count {
            let e = io::Error::new(
                io::ErrorKind::InvalidData,
                "index and log checkpoints disagree on record count",
            );
            return Err(annotate!(e));
        }

        log::trace!(
            "recovered {} index entries from checkpoint {}",
            index.entries.len(),
            index_token
        );

        Ok(Recovered {
            version: meta.version,
            table_size: index.table_size,
            sessions: meta.sessions,
            entries: index.entries,
        })
    }

    fn read_record(&self, log_token: Uuid, offset: u64) -> io::Result<Vec<u8>> {
        let file = self.log_file(log_token)?;
        let mut file = file.lock();

        fallible!(file.seek(SeekFrom::Start(offset)));
        let mut header = [0_u8; RECORD_HEADER_LEN];
        fallible!(file.read_exact(&mut header));

        let mut len_buf = [0_u8; 8];
        len_buf.copy_from_slice(&header[..8]);
        let len = usize::try_from(u64::from_le_bytes(len_buf)).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "record length overflow")
        })?;
        let mut crc_buf = [0_u8; 4];
        crc_buf.copy_from_slice(&header[8..]);
        let crc_recorded = u32::from_le_bytes(crc_buf);

        let file_len = fallible!(file.metadata()).len();
        let end = offset
            .saturating_add(RECORD_HEADER_LEN as u64)
            .saturating_add(len as u64);
        if end > file_len {
            let e = io::Error::new(
                io::ErrorKind::InvalidData,
                "record extends past the end of the log",
            );
            return Err(annotate!(e));
        }

        let mut value = vec![0_u8; len];
        fallible!(file.read_exact(&mut value));

        if crc32fast::hash(&value) ^ 0xAF != crc_recorded {
            log::warn!(
                "encountered incorrect crc for record at {} in log {}",
                offset,
                log_token
            );
            let e = io::Error::new(
                io::ErrorKind::InvalidData,
                "crc mismatch for read of log record",
            );
            return Err(annotate!(e));
        }

        Ok(value)
    }
}

fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        let e = io::Error::new(io::ErrorKind::InvalidData, e);
        annotate!(e)
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fallible!(fs::File::create(path));
    fallible!(file.write_all(bytes));
    fallible!(file.sync_all());
    Ok(())
}

fn serialize_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 12);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);

    let hash: u32 = crc32fast::hash(&frame) ^ 0xAF;
    frame.extend_from_slice(&hash.to_le_bytes());
    frame
}

fn read_frame(file: &mut fs::File) -> io::Result<Vec<u8>> {
    let mut frame_size_buf: [u8; 8] = [0; 8];
    fallible!(file.read_exact(&mut frame_size_buf));

    let len = usize::try_from(u64::from_le_bytes(frame_size_buf)).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "frame length overflow")
    })?;

    let file_len = fallible!(file.metadata()).len();
    if (len as u64).saturating_add(12) > file_len {
        let e = io::Error::new(
            io::ErrorKind::InvalidData,
            "frame extends past the end of the file",
        );
        return Err(annotate!(e));
    }

    let mut frame = vec![0_u8; len + 12];
    frame[..8].copy_from_slice(&frame_size_buf);
    fallible!(file.read_exact(&mut frame[8..]));

    let crc_actual = crc32fast::hash(&frame[..len + 8]) ^ 0xAF;
    let crc_recorded = u32::from_le_bytes([
        frame[len + 8],
        frame[len + 9],
        frame[len + 10],
        frame[len + 11],
    ]);

    if crc_actual != crc_recorded {
        log::warn!("encountered incorrect crc for checkpoint frame");
        let e = io::Error::new(
            io::ErrorKind::InvalidData,
            "crc mismatch for read of checkpoint frame",
        );
        return Err(annotate!(e));
    }

    frame.truncate(len + 8);
    frame.drain(..8);
    Ok(frame)
}

fn remove_incomplete_checkpoints(checkpoints: &Path) -> io::Result<()> {
    for dir_entry_res in fallible!(fs::read_dir(checkpoints)) {
        let dir_entry = fallible!(dir_entry_res);
        let file_name = dir_entry.file_name();
        if file_name.to_string_lossy().ends_with(TMP_SUFFIX) {
            log::warn!("removing incomplete checkpoint {file_name:?}");
            fallible!(fs::remove_dir_all(dir_entry.path()));
        }
    }
    Ok(())
}
