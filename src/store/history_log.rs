//! Append-only location history log
//!
//! Every accepted location update becomes one fixed-size record:
//! `[MAGIC:4][SEQUENCE:8][DRIVER_ID:8][OBSERVED_AT_MS:8][LAT:8][LNG:8][CRC32:4]`
//!
//! On open the file is replayed into a per-driver, time-ordered view that
//! serves `query` and `latest`. Replay stops at the first torn or corrupted
//! record and the file is cut back to the last good one, so later appends
//! never land behind garbage.

use crate::common::config::SyncPolicy;
use crate::common::utils::from_millis;
use crate::common::{Error, Result};
use crate::model::{DriverId, LocationSample};
use crate::store::HistoryLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

const LOG_MAGIC: [u8; 4] = [0x4C, 0x4F, 0x43, 0x31]; // "LOC1"
const RECORD_LEN: usize = 4 + 8 + 8 + 8 + 8 + 8 + 4;

/// Per-driver samples kept sorted by `observed_at`.
///
/// Samples that arrive with an older timestamp than the newest one are
/// inserted at their sorted position; equal timestamps keep arrival order.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    by_driver: HashMap<DriverId, Vec<LocationSample>>,
}

impl Timeline {
    pub(crate) fn insert(&mut self, sample: LocationSample) {
        let samples = self.by_driver.entry(sample.driver_id).or_default();
        let pos = samples.partition_point(|s| s.observed_at <= sample.observed_at);
        samples.insert(pos, sample);
    }

    pub(crate) fn since(&self, driver_id: DriverId, since: DateTime<Utc>) -> Vec<LocationSample> {
        match self.by_driver.get(&driver_id) {
            Some(samples) => {
                let start = samples.partition_point(|s| s.observed_at <= since);
                samples[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn latest(&self, driver_id: DriverId) -> Option<LocationSample> {
        self.by_driver
            .get(&driver_id)
            .and_then(|samples| samples.last().cloned())
    }

    pub(crate) fn len(&self) -> usize {
        self.by_driver.values().map(Vec::len).sum()
    }
}

/// Writer half of the log. Only appends and syncs take this lock.
struct LogWriter {
    writer: BufWriter<File>,
    next_sequence: u64,
    /// File length covering every accepted record, written out or still buffered
    accepted_len: u64,
    sync_policy: SyncPolicy,
}

impl LogWriter {
    /// Write one record. On failure nothing of it is left behind, in the
    /// buffer or in the file, and the sequence number is reused.
    fn append(&mut self, sample: &LocationSample) -> Result<u64> {
        let sequence = self.next_sequence;
        let record = encode_record(sequence, sample);

        if let Err(e) = self.write_record(&record) {
            if let Err(cleanup) = self.discard_rejected() {
                tracing::error!("Failed to roll back rejected history record: {}", cleanup);
            }
            return Err(e);
        }

        self.next_sequence += 1;
        self.accepted_len += RECORD_LEN as u64;
        Ok(sequence)
    }

    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.writer.write_all(record)?;
        self.maybe_sync()
    }

    /// Sync based on policy
    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            SyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            SyncPolicy::Interval => {
                self.writer.flush()?;
            }
            SyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Drop every byte past `accepted_len`, whether it reached the file or
    /// is still sitting in the write buffer.
    fn discard_rejected(&mut self) -> Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (file, buffered) = stale.into_parts();

        let on_disk = file.metadata()?.len();
        if on_disk > self.accepted_len {
            file.set_len(self.accepted_len)?;
        } else if on_disk < self.accepted_len {
            // accepted records that never left the buffer go back in
            if let Ok(mut pending) = buffered {
                pending.truncate((self.accepted_len - on_disk) as usize);
                self.writer.write_all(&pending)?;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// File-backed history log
///
/// Reads are served from the timeline and never wait on the writer, so a
/// slow fsync only holds up other appends.
pub struct FileHistoryLog {
    path: PathBuf,
    writer: Arc<Mutex<LogWriter>>,
    timeline: Arc<RwLock<Timeline>>,
}

impl FileHistoryLog {
    /// Open or create the log, replaying existing records.
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut timeline = Timeline::default();
        let mut next_sequence = 0;
        let valid_len = Self::replay(&path, |sequence, sample| {
            next_sequence = next_sequence.max(sequence + 1);
            timeline.insert(sample);
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                "History log {} has {} trailing bytes after the last valid record, truncating",
                path.display(),
                file_len - valid_len
            );
            file.set_len(valid_len)?;
        }

        tracing::info!(
            "Opened history log {} ({} samples)",
            path.display(),
            timeline.len()
        );

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                next_sequence,
                accepted_len: valid_len,
                sync_policy,
            })),
            timeline: Arc::new(RwLock::new(timeline)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every valid record in order. Returns the byte length of the
    /// valid prefix.
    fn replay<F>(path: &Path, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, LocationSample),
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut valid_len = 0u64;

        loop {
            match read_record(&mut reader) {
                Ok(Some((sequence, sample))) => {
                    callback(sequence, sample);
                    valid_len += RECORD_LEN as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("History replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok(valid_len)
    }

    fn timeline(&self) -> Result<std::sync::RwLockReadGuard<'_, Timeline>> {
        self.timeline
            .read()
            .map_err(|_| Error::Internal("history timeline lock poisoned".into()))
    }
}

fn lock_writer(writer: &Mutex<LogWriter>) -> Result<MutexGuard<'_, LogWriter>> {
    writer
        .lock()
        .map_err(|_| Error::Internal("history log lock poisoned".into()))
}

#[async_trait]
impl HistoryLog for FileHistoryLog {
    async fn append(&self, sample: &LocationSample) -> Result<()> {
        // the timeline holds what a replay would produce: millisecond precision
        let millis = sample.observed_at.timestamp_millis();
        let sample = LocationSample {
            observed_at: from_millis(millis)?,
            ..sample.clone()
        };

        let writer = self.writer.clone();
        let timeline = self.timeline.clone();
        let sequence = tokio::task::spawn_blocking(move || {
            let mut writer = lock_writer(&writer)?;
            let sequence = writer.append(&sample)?;
            // still under the writer lock, so the timeline sees appends in file order
            timeline
                .write()
                .map_err(|_| Error::Internal("history timeline lock poisoned".into()))?
                .insert(sample);
            Ok::<_, Error>(sequence)
        })
        .await
        .map_err(|e| Error::Internal(format!("history append task failed: {}", e)))??;

        tracing::trace!("history record {} appended", sequence);
        Ok(())
    }

    async fn query(
        &self,
        driver_id: DriverId,
        since: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>> {
        Ok(self.timeline()?.since(driver_id, since))
    }

    async fn latest(&self, driver_id: DriverId) -> Result<Option<LocationSample>> {
        Ok(self.timeline()?.latest(driver_id))
    }

    /// Flush and fsync regardless of policy
    async fn sync(&self) -> Result<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = lock_writer(&writer)?;
            writer.sync()
        })
        .await
        .map_err(|e| Error::Internal(format!("history sync task failed: {}", e)))?
    }
}

/// Periodically fsync the history log. Used with [`SyncPolicy::Interval`],
/// where appends only flush to the OS.
pub fn spawn_syncer(history: Arc<dyn HistoryLog>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = history.sync().await {
                tracing::error!("History log sync failed: {}", e);
            }
        }
    })
}

fn encode_record(sequence: u64, sample: &LocationSample) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..4].copy_from_slice(&LOG_MAGIC);
    buf[4..12].copy_from_slice(&sequence.to_le_bytes());
    buf[12..20].copy_from_slice(&sample.driver_id.to_le_bytes());
    buf[20..28].copy_from_slice(&sample.observed_at.timestamp_millis().to_le_bytes());
    buf[28..36].copy_from_slice(&sample.lat.to_bits().to_le_bytes());
    buf[36..44].copy_from_slice(&sample.lng.to_bits().to_le_bytes());
    let checksum = crc32fast::hash(&buf[4..44]);
    buf[44..48].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Read a single record. `Ok(None)` at end of file, including a torn tail.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u64, LocationSample)>> {
    let mut buf = [0u8; RECORD_LEN];
    match reader.read_exact(&mut buf) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if buf[0..4] != LOG_MAGIC {
        return Err(Error::Corrupted("Invalid history record magic".into()));
    }

    let stored_checksum = u32::from_le_bytes(field(&buf[44..48]));
    if crc32fast::hash(&buf[4..44]) != stored_checksum {
        return Err(Error::Corrupted("Checksum mismatch".into()));
    }

    let sequence = u64::from_le_bytes(field(&buf[4..12]));
    let sample = LocationSample {
        driver_id: i64::from_le_bytes(field(&buf[12..20])),
        observed_at: from_millis(i64::from_le_bytes(field(&buf[20..28])))?,
        lat: f64::from_bits(u64::from_le_bytes(field(&buf[28..36]))),
        lng: f64::from_bits(u64::from_le_bytes(field(&buf[36..44]))),
    };

    Ok(Some((sequence, sample)))
}

fn field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
