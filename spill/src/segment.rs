use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use crate::record;

/**
A segment file that's part of the store.

Only the first `size_bytes` of the file are considered valid. Anything past that is either an in-progress write or garbage from an interrupted one.
*/
pub(crate) struct Segment {
    pub(crate) path: PathBuf,
    pub(crate) size_bytes: u64,
    pub(crate) cursor: u64,
    // Acknowledged records past the cursor, keyed by their offset
    pub(crate) pending_acks: BTreeMap<u64, u64>,
    pub(crate) records: u64,
    pub(crate) acked: u64,
    pub(crate) sealed: bool,
}

impl Segment {
    pub(crate) fn new(path: PathBuf) -> Self {
        Segment {
            path,
            size_bytes: 0,
            cursor: 0,
            pending_acks: BTreeMap::new(),
            records: 0,
            acked: 0,
            sealed: false,
        }
    }

    /**
    Scan an existing segment file, measuring its valid prefix and restoring its cursor.
    */
    pub(crate) fn recover(path: PathBuf) -> Result<(Self, Recovered), io::Error> {
        let buf = fs::read(&path)?;

        let mut cursor = read_cursor(&cursor_path(&path)).unwrap_or(0);

        let mut offset = 0usize;
        let mut records = 0u64;
        let mut acked = 0u64;
        let mut max_seq = None;
        let mut cursor_on_boundary = cursor == 0;
        let mut corrupt = None;

        while offset < buf.len() {
            match record::decode(&buf[offset..]) {
                Ok(decoded) => {
                    offset += decoded.len;
                    records += 1;
                    max_seq = Some(decoded.seq);

                    if offset as u64 <= cursor {
                        acked += 1;
                    }

                    if offset as u64 == cursor {
                        cursor_on_boundary = true;
                    }
                }
                Err(err) => {
                    corrupt = Some(err);
                    break;
                }
            }
        }

        // A cursor that doesn't land on a record boundary can't be trusted,
        // so replay the whole segment instead
        if !cursor_on_boundary || cursor > offset as u64 {
            cursor = 0;
            acked = 0;
        }

        Ok((
            Segment {
                path,
                size_bytes: offset as u64,
                cursor,
                pending_acks: BTreeMap::new(),
                records,
                acked,
                // Recovered segments are never appended to again
                sealed: true,
            },
            Recovered {
                max_seq,
                discarded_bytes: (buf.len() - offset) as u64,
                corrupt,
            },
        ))
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.cursor >= self.size_bytes
    }

    pub(crate) fn pending(&self) -> u64 {
        self.records.saturating_sub(self.acked)
    }

    /**
    Record an acknowledged record, advancing the cursor over any contiguous prefix.

    Returns `true` if the cursor moved.
    */
    pub(crate) fn acknowledge(&mut self, offset: u64, end: u64) -> bool {
        if offset < self.cursor || self.pending_acks.contains_key(&offset) {
            return false;
        }

        self.pending_acks.insert(offset, end);
        self.acked += 1;

        let start = self.cursor;

        while let Some(end) = self.pending_acks.remove(&self.cursor) {
            self.cursor = end;
        }

        self.cursor != start
    }

    /**
    Read the committed bytes from `from` up to the end of the valid prefix.
    */
    pub(crate) fn read_from(&self, from: u64) -> Result<Vec<u8>, io::Error> {
        let len = self.size_bytes.saturating_sub(from);

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(from))?;

        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;

        Ok(buf)
    }

    /**
    Durably store the cursor so acknowledged records aren't replayed after a restart.
    */
    pub(crate) fn persist_cursor(&self) -> Result<(), io::Error> {
        let path = cursor_path(&self.path);
        let tmp = path.with_extension("ack.tmp");

        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.cursor.to_le_bytes());
        let crc = crc32fast::hash(&buf[..8]);
        buf[8..].copy_from_slice(&crc.to_le_bytes());

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        fs::rename(tmp, path)
    }

    pub(crate) fn delete(&self) -> Result<(), io::Error> {
        match fs::remove_file(cursor_path(&self.path)) {
            Ok(()) => (),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }

        fs::remove_file(&self.path)
    }
}

pub(crate) struct Recovered {
    pub(crate) max_seq: Option<u64>,
    pub(crate) discarded_bytes: u64,
    pub(crate) corrupt: Option<record::Corrupt>,
}

/**
The segment currently being appended to.
*/
pub(crate) struct ActiveSegment {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    pub(crate) size_bytes: u64,
    pub(crate) opened_at: Instant,
    file: File,
}

impl ActiveSegment {
    pub(crate) fn try_open_create(id: u64, path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let path = path.as_ref();

        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(false)
            .append(true)
            .open(path)?;

        Ok(ActiveSegment {
            id,
            path: path.into(),
            size_bytes: 0,
            opened_at: Instant::now(),
            file,
        })
    }

    pub(crate) fn write_record(&mut self, record: &[u8]) -> Result<(), io::Error> {
        self.file.write_all(record)?;
        self.size_bytes += record.len() as u64;

        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), io::Error> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

fn cursor_path(path: &Path) -> PathBuf {
    let mut path = path.as_os_str().to_owned();
    path.push(".ack");
    path.into()
}

fn read_cursor(path: &Path) -> Option<u64> {
    let buf = fs::read(path).ok()?;

    if buf.len() != 12 {
        return None;
    }

    let cursor = u64::from_le_bytes(buf[..8].try_into().ok()?);
    let expected = u32::from_le_bytes(buf[8..].try_into().ok()?);

    if crc32fast::hash(&buf[..8]) != expected {
        return None;
    }

    Some(cursor)
}

pub(crate) fn file_name(file_prefix: &str, file_ext: &str, id: u64) -> String {
    format!("{}.{:020}.{:08x}.{}", file_prefix, id, rand::random::<u32>(), file_ext)
}

pub(crate) fn read_file_name_id(file_name: &str) -> Option<u64> {
    file_name.split('.').nth(1)?.parse().ok()
}

/**
Find all segment files in `dir`, ordered from oldest to newest.
*/
pub(crate) fn read_dir(
    dir: &Path,
    file_prefix: &str,
    file_ext: &str,
) -> Result<Vec<(u64, PathBuf)>, io::Error> {
    let mut file_set = Vec::new();

    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };

        if let Ok(file_type) = entry.file_type() {
            if !file_type.is_file() {
                continue;
            }
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if !file_name.starts_with(&format!("{file_prefix}."))
            || !file_name.ends_with(&format!(".{file_ext}"))
        {
            continue;
        }

        if let Some(id) = read_file_name_id(file_name) {
            file_set.push((id, entry.path()));
        }
    }

    file_set.sort_by_key(|(id, _)| *id);

    Ok(file_set)
}
