/*!
A durable, append-only overflow buffer for events that can't currently be delivered.

Records are written to a set of segment files in a single directory. Each record is length-prefixed and checksummed so an interrupted write can never block replay of the records before it.

# Segments

Segment files are named using the following scheme:

```text
{prefix}.{id}.{rand}.{ext}
```

where `id` is a zero-padded, monotonically increasing segment number. Records are only ever appended to the newest segment. That segment is sealed and a new one opened when:

1. Its size would exceed [`SpilloverBuilder::max_segment_bytes`].
2. It's older than [`SpilloverBuilder::max_segment_age`].
3. Writing to it fails.
4. The process restarts. Segments found on disk at startup are always sealed.

# Replay

Reading records is a two step process. [`DiskSpillover::drain`] returns records from the oldest segment with unacknowledged records without removing them. Once they've been delivered somewhere, [`DiskSpillover::acknowledge`] marks them as done. A record that's drained but never acknowledged will be drained again, including after a restart. Once every record in a sealed segment is acknowledged, the segment is deleted.

Each segment's acknowledged position is persisted alongside it in a `.ack` file.

# Handling corruption

A record that fails its length or checksum validation ends its segment. Everything before it is still replayed, and everything after it is discarded. This is the expected outcome of a process being killed mid-write.
*/

#![deny(missing_docs)]

mod internal_metrics;
mod record;
mod segment;

use std::{
    collections::BTreeMap,
    fmt, io,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};

use internal_metrics::InternalMetrics;
use segment::{ActiveSegment, Segment};

pub use internal_metrics::SpilloverMetrics;

/**
An error attempting to open a [`DiskSpillover`].
*/
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    fn new(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error(e.into())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/**
An error writing to a [`DiskSpillover`].

Spillover errors mean the local disk can't currently take any more records.
*/
#[derive(Debug)]
pub enum SpillError {
    /**
    The filesystem failed.
    */
    Io(io::Error),
    /**
    The record couldn't be serialized.
    */
    Encode(serde_json::Error),
    /**
    Writing the record would exceed the configured size cap.
    */
    Full {
        /**
        The current total size of the store in bytes.
        */
        size_bytes: u64,
        /**
        The configured cap in bytes.
        */
        max_total_bytes: u64,
    },
}

impl fmt::Display for SpillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillError::Io(err) => write!(f, "spillover IO failed: {err}"),
            SpillError::Encode(err) => write!(f, "failed to encode spillover record: {err}"),
            SpillError::Full {
                size_bytes,
                max_total_bytes,
            } => write!(
                f,
                "spillover is full ({size_bytes} bytes of {max_total_bytes} used)"
            ),
        }
    }
}

impl std::error::Error for SpillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpillError::Io(err) => Some(err),
            SpillError::Encode(err) => Some(err),
            SpillError::Full { .. } => None,
        }
    }
}

/**
The outcome of appending records to a [`DiskSpillover`].
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Appended {
    written: usize,
    evicted: u64,
}

impl Appended {
    /**
    The number of records that were written.
    */
    pub fn written(&self) -> usize {
        self.written
    }

    /**
    The number of unacknowledged records deleted to make room for the new ones.

    This is only ever non-zero when [`SpilloverBuilder::evict_oldest`] is enabled. Evicted records are lost.
    */
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/**
An error appending records to a [`DiskSpillover`].
*/
#[derive(Debug)]
pub struct AppendError {
    appended: Appended,
    err: SpillError,
}

impl AppendError {
    /**
    The number of records that were written before the failure.
    */
    pub fn written(&self) -> usize {
        self.appended.written
    }

    /**
    The number of unacknowledged records evicted before the failure.
    */
    pub fn evicted(&self) -> u64 {
        self.appended.evicted
    }

    /**
    The underlying failure.
    */
    pub fn error(&self) -> &SpillError {
        &self.err
    }

    /**
    The underlying failure.
    */
    pub fn into_inner(self) -> SpillError {
        self.err
    }
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} records)", self.err, self.appended.written)
    }
}

impl std::error::Error for AppendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

impl From<io::Error> for SpillError {
    fn from(err: io::Error) -> Self {
        SpillError::Io(err)
    }
}

/**
Create a builder for a [`DiskSpillover`] that stores its segments in `dir`.

It will use the following defaults:

- `spill` as the file prefix.
- 8MiB max segment size.
- 1 hour max segment age.
- 256MiB max total size.
- Fail appends instead of evicting old segments when full.
*/
pub fn dir(dir: impl AsRef<Path>) -> SpilloverBuilder {
    SpilloverBuilder::new(dir.as_ref())
}

const DEFAULT_FILE_PREFIX: &str = "spill";
const DEFAULT_FILE_EXT: &str = "spill";
const DEFAULT_MAX_SEGMENT_BYTES: u64 = 8 * 1024 * 1024; // 8MiB
const DEFAULT_MAX_SEGMENT_AGE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024; // 256MiB
const DEFAULT_EVICT_OLDEST: bool = false;
const DEFAULT_SYNC_WRITES: bool = true;

/**
A builder for a [`DiskSpillover`].

Use [`dir`] to begin a [`SpilloverBuilder`].
*/
pub struct SpilloverBuilder {
    dir: PathBuf,
    file_prefix: String,
    max_segment_bytes: u64,
    max_segment_age: Duration,
    max_total_bytes: u64,
    evict_oldest: bool,
    sync_writes: bool,
}

impl SpilloverBuilder {
    /**
    Create a new [`SpilloverBuilder`] storing segments in `dir`.
    */
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SpilloverBuilder {
            dir: dir.into(),
            file_prefix: DEFAULT_FILE_PREFIX.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_segment_age: DEFAULT_MAX_SEGMENT_AGE,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            evict_oldest: DEFAULT_EVICT_OLDEST,
            sync_writes: DEFAULT_SYNC_WRITES,
        }
    }

    /**
    The prefix for segment file names.

    Multiple stores can share a directory as long as they use different prefixes.
    */
    pub fn file_prefix(mut self, file_prefix: impl Into<String>) -> Self {
        self.file_prefix = file_prefix.into();
        self
    }

    /**
    The size a segment can grow to before it's sealed and a new one is opened.

    A single record larger than this still gets a segment of its own.
    */
    pub fn max_segment_bytes(mut self, max_segment_bytes: u64) -> Self {
        self.max_segment_bytes = max_segment_bytes;
        self
    }

    /**
    The age a segment can reach before it's sealed and a new one is opened.
    */
    pub fn max_segment_age(mut self, max_segment_age: Duration) -> Self {
        self.max_segment_age = max_segment_age;
        self
    }

    /**
    The total size of all segments before appends start failing.
    */
    pub fn max_total_bytes(mut self, max_total_bytes: u64) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    /**
    Whether to delete the oldest sealed segments to make room for new records when the store is full.

    Records in evicted segments are lost.
    */
    pub fn evict_oldest(mut self, evict_oldest: bool) -> Self {
        self.evict_oldest = evict_oldest;
        self
    }

    /**
    Whether to sync segment files to disk after each append.
    */
    pub fn sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /**
    Complete the builder, recovering any segments already in the directory.
    */
    pub fn open<T: Serialize + DeserializeOwned>(self) -> Result<DiskSpillover<T>, Error> {
        std::fs::create_dir_all(&self.dir).map_err(Error::new)?;

        let metrics = Arc::new(InternalMetrics::default());

        let mut segments = BTreeMap::new();
        let mut total_bytes = 0;
        let mut next_seq = 0;
        let mut next_segment = 0;

        for (id, path) in
            segment::read_dir(&self.dir, &self.file_prefix, DEFAULT_FILE_EXT).map_err(Error::new)?
        {
            next_segment = id + 1;

            let (segment, recovered) = match Segment::recover(path.clone()) {
                Ok(recovered) => recovered,
                Err(err) => {
                    metrics.segment_read_failed.increment();

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to recover {path}: {err}",
                        #[emit::as_debug]
                        path,
                        err,
                    );

                    continue;
                }
            };

            if let Some(corrupt) = recovered.corrupt {
                metrics.record_corrupt.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "discarding {discarded_bytes} bytes from {path}: {err}",
                    discarded_bytes: recovered.discarded_bytes,
                    #[emit::as_debug]
                    path: segment.path,
                    err: corrupt,
                );
            }

            if let Some(max_seq) = recovered.max_seq {
                next_seq = next_seq.max(max_seq + 1);
            }

            if segment.is_drained() {
                delete_segment(&metrics, &segment);
                continue;
            }

            emit::debug!(
                rt: emit::runtime::internal(),
                "recovered {pending} records from {path}",
                pending: segment.pending(),
                #[emit::as_debug]
                path: segment.path,
            );

            total_bytes += segment.size_bytes;
            segments.insert(id, segment);
        }

        Ok(DiskSpillover {
            shared: Arc::new(Shared {
                metrics,
                writer: Mutex::new(Writer {
                    active: None,
                    next_seq,
                    next_segment,
                }),
                index: Mutex::new(Index {
                    segments,
                    total_bytes,
                }),
                dir: self.dir,
                file_prefix: self.file_prefix,
                max_segment_bytes: self.max_segment_bytes,
                max_segment_age: self.max_segment_age,
                max_total_bytes: self.max_total_bytes,
                evict_oldest: self.evict_oldest,
                sync_writes: self.sync_writes,
            }),
            _marker: PhantomData,
        })
    }
}

/**
A handle to a durable spillover store for records of type `T`.

The handle is cheap to clone, and all operations are safe to call concurrently.
*/
pub struct DiskSpillover<T> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for DiskSpillover<T> {
    fn clone(&self) -> Self {
        DiskSpillover {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

/**
A record read from a [`DiskSpillover`].
*/
#[derive(Debug, Clone)]
pub struct Spilled<T> {
    receipt: Receipt,
    value: T,
}

impl<T> Spilled<T> {
    /**
    The sequence number assigned to the record when it was appended.
    */
    pub fn seq(&self) -> u64 {
        self.receipt.seq
    }

    /**
    The receipt to pass to [`DiskSpillover::acknowledge`] once the record has been delivered.
    */
    pub fn receipt(&self) -> Receipt {
        self.receipt
    }

    /**
    The value of the record.
    */
    pub fn value(&self) -> &T {
        &self.value
    }

    /**
    Split the record into its receipt and value.
    */
    pub fn into_parts(self) -> (Receipt, T) {
        (self.receipt, self.value)
    }
}

/**
A token identifying a record's position in a [`DiskSpillover`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    segment: u64,
    seq: u64,
    offset: u64,
    end: u64,
}

impl<T: Serialize + DeserializeOwned> DiskSpillover<T> {
    /**
    Append a single record.

    If older records had to be evicted to make room then the count is available through [`Appended::evicted`].
    */
    pub fn append(&self, value: &T) -> Result<Appended, AppendError> {
        self.append_all(Some(value))
    }

    /**
    Append a set of records, syncing them to disk together.

    If this method fails then some prefix of the records may still have been written. The size of that prefix is available through [`AppendError::written`].
    */
    pub fn append_all<'a>(
        &self,
        values: impl IntoIterator<Item = &'a T>,
    ) -> Result<Appended, AppendError>
    where
        T: 'a,
    {
        let payloads = values
            .into_iter()
            .map(|value| serde_json::to_vec(value).map_err(SpillError::Encode))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| AppendError {
                appended: Appended::default(),
                err,
            })?;

        self.shared.append_payloads(payloads)
    }

    /**
    Read up to `limit` unacknowledged records from the oldest segment that has any.

    Records aren't removed until they're passed to [`DiskSpillover::acknowledge`].
    */
    pub fn drain(&self, limit: usize) -> Result<Vec<Spilled<T>>, SpillError> {
        let shared = &self.shared;

        let mut drained = Vec::new();

        if limit == 0 {
            return Ok(drained);
        }

        let mut after = None;

        loop {
            // Pick the next segment and take a snapshot of its bounds
            let Some((id, cursor, size_bytes, skip, path)) = ({
                let index = shared.lock_index();

                let from = after.map(|after: u64| after + 1).unwrap_or(0);

                let found = index
                    .segments
                    .range(from..)
                    .filter(|(_, segment)| !segment.is_drained())
                    .map(|(id, segment)| {
                        (
                            *id,
                            segment.cursor,
                            segment.size_bytes,
                            segment.pending_acks.clone(),
                            segment.path.clone(),
                        )
                    })
                    .next();

                found
            }) else {
                return Ok(drained);
            };

            after = Some(id);

            // Read the segment outside of the index lock
            let buf = {
                let mut reader = Segment::new(path.clone());
                reader.size_bytes = size_bytes;

                reader.read_from(cursor).map_err(|err| {
                    shared.metrics.segment_read_failed.increment();

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to read {path}: {err}",
                        #[emit::as_debug]
                        path,
                        err,
                    );

                    err
                })?
            };

            let mut offset = 0usize;
            let mut undecodable = Vec::new();

            while offset < buf.len() && drained.len() < limit {
                let record_offset = cursor + offset as u64;

                match record::decode(&buf[offset..]) {
                    Ok(decoded) => {
                        let receipt = Receipt {
                            segment: id,
                            seq: decoded.seq,
                            offset: record_offset,
                            end: record_offset + decoded.len as u64,
                        };

                        offset += decoded.len;

                        if skip.contains_key(&record_offset) {
                            continue;
                        }

                        match serde_json::from_slice(decoded.payload) {
                            Ok(value) => drained.push(Spilled { receipt, value }),
                            Err(err) => {
                                // The record is intact but can never be delivered
                                shared.metrics.record_undecodable.increment();

                                emit::warn!(
                                    rt: emit::runtime::internal(),
                                    "skipping undecodable record {seq}: {err}",
                                    seq: decoded.seq,
                                    err,
                                );

                                undecodable.push(receipt);
                            }
                        }
                    }
                    Err(err) => {
                        shared.truncate(id, record_offset, err);
                        break;
                    }
                }
            }

            if !undecodable.is_empty() {
                shared.acknowledge(undecodable);
            }

            if !drained.is_empty() {
                return Ok(drained);
            }
        }
    }

    /**
    Mark records as delivered.

    Acknowledged records are never returned from [`DiskSpillover::drain`] again. Sealed segments are deleted once all of their records are acknowledged.

    Returns the number of receipts for records that are no longer in the store because they were evicted after being drained. Those records were already counted by [`Appended::evicted`].
    */
    pub fn acknowledge(&self, receipts: impl IntoIterator<Item = Receipt>) -> usize {
        self.shared.acknowledge(receipts)
    }

    /**
    The number of records that haven't been acknowledged.
    */
    pub fn pending(&self) -> u64 {
        self.shared
            .lock_index()
            .segments
            .values()
            .map(|segment| segment.pending())
            .sum()
    }

    /**
    The total size of all segments in bytes.
    */
    pub fn size_bytes(&self) -> u64 {
        self.shared.lock_index().total_bytes
    }

    /**
    The directory segments are written to.
    */
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /**
    Get metrics describing the health of the store.
    */
    pub fn metrics(&self) -> SpilloverMetrics {
        SpilloverMetrics {
            metrics: self.shared.metrics.clone(),
        }
    }
}

struct Shared {
    metrics: Arc<InternalMetrics>,
    // Lock order: `writer` before `index`
    writer: Mutex<Writer>,
    index: Mutex<Index>,
    dir: PathBuf,
    file_prefix: String,
    max_segment_bytes: u64,
    max_segment_age: Duration,
    max_total_bytes: u64,
    evict_oldest: bool,
    sync_writes: bool,
}

struct Writer {
    active: Option<ActiveSegment>,
    next_seq: u64,
    next_segment: u64,
}

struct Index {
    segments: BTreeMap<u64, Segment>,
    total_bytes: u64,
}

impl Shared {
    fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append_payloads(&self, payloads: Vec<Vec<u8>>) -> Result<Appended, AppendError> {
        let mut guard = self.lock_writer();
        let writer = &mut *guard;

        let mut appended = Appended::default();
        let result = self.write_records(writer, &payloads, &mut appended);

        let written = appended.written;

        if written > 0 && self.sync_writes {
            let failed = match writer.active.as_mut() {
                Some(active) => active.sync().err().map(|err| (err, active.path.clone())),
                None => None,
            };

            if let Some((err, path)) = failed {
                self.metrics.segment_write_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to sync {path}: {err}",
                    #[emit::as_debug]
                    path,
                    err,
                );

                self.seal(writer);
            }
        }

        self.metrics.record_appended.increment_by(written);

        result
            .map(|_| appended)
            .map_err(|err| AppendError { appended, err })
    }

    fn write_records(
        &self,
        writer: &mut Writer,
        payloads: &[Vec<u8>],
        appended: &mut Appended,
    ) -> Result<(), SpillError> {
        for payload in payloads {
            let record = record::encode(writer.next_seq, payload)?;
            let record_len = record.len() as u64;

            self.make_room(writer, record_len, &mut appended.evicted)?;

            if writer.active.is_none() {
                let active = self.create_segment(writer)?;
                writer.active = Some(active);
            }

            let Some(active) = writer.active.as_mut() else {
                continue;
            };

            if let Err(err) = active.write_record(&record) {
                self.metrics.segment_write_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to write record to {path}: {err}",
                    #[emit::as_debug]
                    path: active.path,
                    err,
                );

                // The segment may now end with a partial record, so it's sealed
                // at its last committed size
                self.seal(writer);

                return Err(SpillError::Io(err));
            }

            let (id, size_bytes) = (active.id, active.size_bytes);

            {
                let mut index = self.lock_index();

                if let Some(segment) = index.segments.get_mut(&id) {
                    segment.size_bytes = size_bytes;
                    segment.records += 1;
                }

                index.total_bytes += record_len;
            }

            writer.next_seq += 1;
            appended.written += 1;
        }

        Ok(())
    }

    // Rotate the active segment if needed, and make sure there's room under the size cap
    fn make_room(
        &self,
        writer: &mut Writer,
        record_len: u64,
        evicted: &mut u64,
    ) -> Result<(), SpillError> {
        let rotate = writer
            .active
            .as_ref()
            .map(|active| {
                let too_big = active.size_bytes > 0
                    && active.size_bytes + record_len > self.max_segment_bytes;
                let too_old = active.opened_at.elapsed() >= self.max_segment_age;

                too_big || too_old
            })
            .unwrap_or(false);

        if rotate {
            self.seal(writer);
        }

        let active_id = writer.active.as_ref().map(|active| active.id);

        let mut index = self.lock_index();

        while index.total_bytes + record_len > self.max_total_bytes {
            let oldest = if self.evict_oldest {
                index
                    .segments
                    .keys()
                    .copied()
                    .find(|id| Some(*id) != active_id)
            } else {
                None
            };

            let Some(segment) = oldest.and_then(|oldest| index.segments.remove(&oldest)) else {
                self.metrics.record_rejected_full.increment();

                return Err(SpillError::Full {
                    size_bytes: index.total_bytes,
                    max_total_bytes: self.max_total_bytes,
                });
            };

            index.total_bytes = index.total_bytes.saturating_sub(segment.size_bytes);

            *evicted += segment.pending();

            self.metrics.segment_evicted.increment();
            self.metrics
                .record_evicted
                .increment_by(segment.pending() as usize);

            emit::warn!(
                rt: emit::runtime::internal(),
                "evicting {pending} unacknowledged records in {path} to make room",
                pending: segment.pending(),
                #[emit::as_debug]
                path: segment.path,
            );

            delete_segment(&self.metrics, &segment);
        }

        Ok(())
    }

    fn create_segment(&self, writer: &mut Writer) -> Result<ActiveSegment, SpillError> {
        let id = writer.next_segment;

        let mut path = self.dir.clone();
        path.push(segment::file_name(&self.file_prefix, DEFAULT_FILE_EXT, id));

        let active = ActiveSegment::try_open_create(id, &path).map_err(|err| {
            self.metrics.segment_create_failed.increment();

            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to create {path}: {err}",
                #[emit::as_debug]
                path,
                err,
            );

            err
        })?;

        writer.next_segment += 1;

        self.metrics.segment_created.increment();

        emit::debug!(
            rt: emit::runtime::internal(),
            "created {path}",
            #[emit::as_debug]
            path: active.path,
        );

        self.lock_index()
            .segments
            .insert(id, Segment::new(active.path.clone()));

        Ok(active)
    }

    fn seal(&self, writer: &mut Writer) {
        let Some(active) = writer.active.take() else {
            return;
        };

        let mut index = self.lock_index();

        let drained = match index.segments.get_mut(&active.id) {
            Some(segment) => {
                segment.sealed = true;
                segment.is_drained()
            }
            None => false,
        };

        if drained {
            self.remove_segment(&mut index, active.id);
        }
    }

    fn truncate(&self, id: u64, valid_len: u64, err: record::Corrupt) {
        let mut writer = self.lock_writer();

        self.metrics.record_corrupt.increment();

        // Nothing more can be appended after a corrupt record
        if writer.active.as_ref().map(|active| active.id) == Some(id) {
            writer.active = None;
        }

        let mut index = self.lock_index();

        let discarded = match index.segments.get_mut(&id) {
            Some(segment) => {
                let discarded = segment.size_bytes.saturating_sub(valid_len);

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "discarding {discarded} bytes from {path}: {err}",
                    discarded,
                    #[emit::as_debug]
                    path: segment.path,
                    err,
                );

                segment.size_bytes = valid_len;
                segment.sealed = true;

                discarded
            }
            None => return,
        };

        index.total_bytes = index.total_bytes.saturating_sub(discarded);

        if index
            .segments
            .get(&id)
            .map(|segment| segment.is_drained())
            .unwrap_or(false)
        {
            self.remove_segment(&mut index, id);
        }
    }

    fn acknowledge(&self, receipts: impl IntoIterator<Item = Receipt>) -> usize {
        let mut active_drained = None;
        let mut evicted = 0;

        {
            let mut index = self.lock_index();

            let mut touched = Vec::new();

            for receipt in receipts {
                let Some(segment) = index.segments.get_mut(&receipt.segment) else {
                    // The segment was evicted after these records were drained
                    evicted += 1;
                    continue;
                };

                let acked = segment.acked;

                if segment.acknowledge(receipt.offset, receipt.end)
                    && !touched.contains(&receipt.segment)
                {
                    touched.push(receipt.segment);
                }

                if segment.acked > acked {
                    self.metrics.record_acknowledged.increment();
                }
            }

            for id in touched {
                let Some(segment) = index.segments.get(&id) else {
                    continue;
                };

                if segment.is_drained() && segment.sealed {
                    self.remove_segment(&mut index, id);
                } else {
                    if let Err(err) = segment.persist_cursor() {
                        self.metrics.cursor_write_failed.increment();

                        emit::warn!(
                            rt: emit::runtime::internal(),
                            "failed to persist cursor for {path}: {err}",
                            #[emit::as_debug]
                            path: segment.path,
                            err,
                        );
                    }

                    if segment.is_drained() {
                        active_drained = Some(id);
                    }
                }
            }
        }

        // A fully acknowledged active segment is sealed so it can be cleaned up
        if let Some(id) = active_drained {
            let mut writer = self.lock_writer();

            let still_drained = writer.active.as_ref().map(|active| active.id) == Some(id)
                && self
                    .lock_index()
                    .segments
                    .get(&id)
                    .map(|segment| segment.is_drained())
                    .unwrap_or(false);

            if still_drained {
                self.seal(&mut writer);
            }
        }

        evicted
    }

    fn remove_segment(&self, index: &mut Index, id: u64) {
        if let Some(segment) = index.segments.remove(&id) {
            index.total_bytes = index.total_bytes.saturating_sub(segment.size_bytes);

            delete_segment(&self.metrics, &segment);
        }
    }
}

fn delete_segment(metrics: &InternalMetrics, segment: &Segment) {
    if let Err(err) = segment.delete() {
        metrics.segment_delete_failed.increment();

        emit::warn!(
            rt: emit::runtime::internal(),
            "failed to delete {path}: {err}",
            #[emit::as_debug]
            path: segment.path,
            err,
        );
    } else {
        metrics.segment_deleted.increment();

        emit::debug!(
            rt: emit::runtime::internal(),
            "deleted {path}",
            #[emit::as_debug]
            path: segment.path,
        );
    }
}

impl<T> fmt::Debug for DiskSpillover<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSpillover")
            .field("dir", &self.shared.dir)
            .field("file_prefix", &self.shared.file_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{fs, io::Write as _};

    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    fn entries(range: std::ops::Range<u32>) -> Vec<Entry> {
        range.map(|n| Entry { n }).collect()
    }

    fn values(drained: &[Spilled<Entry>]) -> Vec<u32> {
        drained.iter().map(|spilled| spilled.value().n).collect()
    }

    fn segment_files(dir: &Path) -> Vec<PathBuf> {
        let mut files = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("spill"))
            .collect::<Vec<_>>();

        files.sort();
        files
    }

    #[test]
    fn drain_returns_records_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        store.append_all(&entries(0..5)).unwrap();

        let drained = store.drain(3).unwrap();
        assert_eq!(vec![0, 1, 2], values(&drained));

        let seqs = drained.iter().map(|spilled| spilled.seq()).collect::<Vec<_>>();
        assert_eq!(vec![0, 1, 2], seqs);

        assert_eq!(5, store.pending());
    }

    #[test]
    fn drain_without_acknowledge_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        store.append_all(&entries(0..3)).unwrap();

        let first = store.drain(10).unwrap();
        let second = store.drain(10).unwrap();

        assert_eq!(values(&first), values(&second));
    }

    #[test]
    fn acknowledged_records_are_never_drained_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        store.append_all(&entries(0..4)).unwrap();

        let drained = store.drain(2).unwrap();
        store.acknowledge(drained.iter().map(|spilled| spilled.receipt()));

        assert_eq!(vec![2, 3], values(&store.drain(10).unwrap()));
        assert_eq!(2, store.pending());
    }

    #[test]
    fn out_of_order_acknowledgement_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        store.append_all(&entries(0..3)).unwrap();

        let drained = store.drain(10).unwrap();
        store.acknowledge(Some(drained[1].receipt()));

        assert_eq!(vec![0, 2], values(&store.drain(10).unwrap()));
    }

    #[test]
    fn unacknowledged_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = super::dir(dir.path()).open::<Entry>().unwrap();
            store.append_all(&entries(0..4)).unwrap();

            let drained = store.drain(4).unwrap();

            // Only the first two made it before the "crash"
            store.acknowledge(drained[..2].iter().map(|spilled| spilled.receipt()));
        }

        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        assert_eq!(vec![2, 3], values(&store.drain(10).unwrap()));
        assert_eq!(2, store.pending());

        // Sequence numbers continue after the recovered ones
        store.append(&Entry { n: 4 }).unwrap();

        let drained = store.drain(10).unwrap();
        store.acknowledge(drained.iter().map(|spilled| spilled.receipt()));

        let drained = store.drain(10).unwrap();
        assert_eq!(vec![4], values(&drained));
        assert_eq!(4, drained[0].seq());
    }

    #[test]
    fn corrupt_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = super::dir(dir.path()).open::<Entry>().unwrap();
            store.append_all(&entries(0..3)).unwrap();
        }

        // Simulate a process killed mid-write
        let segment = segment_files(dir.path()).pop().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        assert_eq!(vec![0, 1, 2], values(&store.drain(10).unwrap()));
        assert_eq!(1, store.metrics().record_corrupt());
    }

    #[test]
    fn garbage_between_records_ends_the_segment() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = super::dir(dir.path()).open::<Entry>().unwrap();
            store.append_all(&entries(0..2)).unwrap();
        }

        let segment = segment_files(dir.path()).pop().unwrap();
        let mut bytes = fs::read(&segment).unwrap();
        bytes.extend_from_slice(b"garbage garbage garbage");
        bytes.extend(record::encode(99, b"{\"n\":99}").unwrap());
        fs::write(&segment, bytes).unwrap();

        let store = super::dir(dir.path()).open::<Entry>().unwrap();

        assert_eq!(vec![0, 1], values(&store.drain(10).unwrap()));
    }

    #[test]
    fn fully_acknowledged_sealed_segments_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path())
            .max_segment_bytes(1)
            .open::<Entry>()
            .unwrap();

        // Every record gets its own segment
        store.append_all(&entries(0..3)).unwrap();
        assert_eq!(3, segment_files(dir.path()).len());

        // Drain only reads from one segment at a time
        let drained = store.drain(10).unwrap();
        assert_eq!(vec![0], values(&drained));

        store.acknowledge(drained.iter().map(|spilled| spilled.receipt()));
        assert_eq!(2, segment_files(dir.path()).len());

        let drained = store.drain(10).unwrap();
        assert_eq!(vec![1], values(&drained));
    }

    #[test]
    fn full_store_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path())
            .max_total_bytes(64)
            .open::<Entry>()
            .unwrap();

        let mut accepted = 0;
        let mut rejected = 0;

        for entry in entries(0..10) {
            match store.append(&entry).map_err(AppendError::into_inner) {
                Ok(appended) => {
                    assert_eq!(1, appended.written());
                    assert_eq!(0, appended.evicted());

                    accepted += 1
                }
                Err(SpillError::Full { .. }) => rejected += 1,
                Err(err) => panic!("unexpected {err}"),
            }
        }

        assert!(accepted > 0);
        assert!(rejected > 0);
        assert!(store.size_bytes() <= 64);
        assert_eq!(rejected, store.metrics().record_rejected_full());
    }

    #[test]
    fn full_store_can_evict_oldest_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path())
            .max_segment_bytes(1)
            .max_total_bytes(100)
            .evict_oldest(true)
            .open::<Entry>()
            .unwrap();

        let mut evicted = 0;
        for entry in entries(0..20) {
            evicted += store.append(&entry).unwrap().evicted();
        }

        assert!(store.size_bytes() <= 100);
        assert!(store.metrics().segment_evicted() > 0);

        // Every record is either still pending or was reported as evicted
        assert!(evicted > 0);
        assert_eq!(20, evicted + store.pending());
        assert_eq!(evicted as usize, store.metrics().record_evicted());

        // The newest records are the ones that survive
        let mut last = None;
        loop {
            let drained = store.drain(10).unwrap();
            if drained.is_empty() {
                break;
            }

            last = drained.last().map(|spilled| spilled.value().n);
            store.acknowledge(drained.iter().map(|spilled| spilled.receipt()));
        }

        assert_eq!(Some(19), last);
    }

    #[test]
    fn acknowledging_evicted_records_reports_them() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path())
            .max_segment_bytes(1)
            .max_total_bytes(100)
            .evict_oldest(true)
            .open::<Entry>()
            .unwrap();

        store.append_all(&entries(0..3)).unwrap();

        let in_flight = store.drain(1).unwrap();
        assert_eq!(vec![0], values(&in_flight));

        let appended = store.append_all(&entries(3..5)).unwrap();
        assert_eq!(2, appended.written());
        assert_eq!(1, appended.evicted());

        assert_eq!(1, store.acknowledge(in_flight.iter().map(|spilled| spilled.receipt())));

        let drained = store.drain(10).unwrap();
        assert_eq!(vec![1], values(&drained));
        assert_eq!(0, store.acknowledge(drained.iter().map(|spilled| spilled.receipt())));
    }

    #[test]
    fn appends_and_drains_can_interleave_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::dir(dir.path())
            .max_segment_bytes(256)
            .sync_writes(false)
            .open::<Entry>()
            .unwrap();

        let writer = {
            let store = store.clone();

            std::thread::spawn(move || {
                for entry in entries(0..200) {
                    store.append(&entry).unwrap();
                }
            })
        };

        let mut seen = Vec::new();

        while seen.len() < 200 {
            let drained = store.drain(16).unwrap();

            seen.extend(values(&drained));
            store.acknowledge(drained.iter().map(|spilled| spilled.receipt()));

            if drained.is_empty() {
                std::thread::yield_now();
            }
        }

        writer.join().unwrap();

        assert_eq!((0..200).collect::<Vec<_>>(), seen);
        assert_eq!(0, store.pending());
    }
}
