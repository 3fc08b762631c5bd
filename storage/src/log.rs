//! Append-only segment log with an in-memory key directory.
//!
//! Records are `crc32 | key_len | value_len | tombstone | key | value`.
//! Segments are numbered `000001.data`, `000002.data`, ... and only the
//! highest-numbered one receives writes. Replaying stops at the first
//! record that fails its checksum, so a torn tail from a crash is dropped
//! instead of poisoning the store.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;

pub const MAX_KEY_SIZE: usize = 128;
pub const MAX_VALUE_SIZE: usize = 4096;

const SEGMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;
const HEADER_LEN: usize = 4 + 4 + 4 + 1;
const DATA_EXT: &str = "data";
const MERGE_EXT: &str = "merge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub data_files: usize,
    pub keys: usize,
    pub total_bytes: u64,
    pub reclaimable_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    segment: u64,
    offset: u64,
    len: u64,
}

struct Segment {
    file: File,
    size: u64,
}

pub struct Engine {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    active: u64,
    keydir: HashMap<Vec<u8>, Slot>,
    reclaimable: u64,
}

impl Engine {
    /// Open (or create) the store directory, replaying every segment.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                // Leftover from an interrupted compaction, never referenced.
                Some(MERGE_EXT) => std::fs::remove_file(&path)?,
                Some(DATA_EXT) => {
                    if let Some(id) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        ids.push(id);
                    }
                }
                _ => {}
            }
        }
        ids.sort_unstable();

        let mut engine = Engine {
            dir: dir.to_path_buf(),
            segments: BTreeMap::new(),
            active: *ids.last().unwrap_or(&1),
            keydir: HashMap::new(),
            reclaimable: 0,
        };
        for id in &ids {
            engine.replay_segment(*id)?;
        }
        if engine.segments.is_empty() {
            engine.create_segment(engine.active)?;
        }
        Ok(engine)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let slot = match self.keydir.get(key) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        let record = self.read_record(slot)?;
        Ok(Some(record.value))
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.keydir.contains_key(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if key.len() > MAX_KEY_SIZE {
            return Err(StoreError::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge(value.len()));
        }
        let record = encode_record(key, value, false);
        let slot = self.append(&record)?;
        if let Some(old) = self.keydir.insert(key.to_vec(), slot) {
            self.reclaimable += old.len;
        }
        Ok(())
    }

    /// Delete is idempotent: removing an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let old = match self.keydir.remove(key) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let record = encode_record(key, &[], true);
        let tomb_len = record.len() as u64;
        self.append(&record)?;
        // The tombstone itself is dead weight the moment it is written.
        self.reclaimable += old.len + tomb_len;
        Ok(())
    }

    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.keydir
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn nb_keys_with_prefix(&self, prefix: &[u8]) -> usize {
        self.keydir.keys().filter(|k| k.starts_with(prefix)).count()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            data_files: self.segments.len(),
            keys: self.keydir.len(),
            total_bytes: self.segments.values().map(|s| s.size).sum(),
            reclaimable_bytes: self.reclaimable,
        }
    }

    pub fn sync(&mut self) -> Result<(), StoreError> {
        if let Some(active) = self.segments.get_mut(&self.active) {
            active.file.sync_all()?;
        }
        Ok(())
    }

    /// Rewrite every live record into fresh segments and drop the old ones.
    ///
    /// Fresh segments take numbers after every existing one and become
    /// data files before any old file is removed: a crash at any point
    /// replays to a consistent keydir, at worst with duplicates that the
    /// next merge reclaims.
    pub fn merge(&mut self) -> Result<(), StoreError> {
        // Read live records in log order to keep reads sequential.
        let mut slots: Vec<(Vec<u8>, Slot)> = self
            .keydir
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect();
        slots.sort_by_key(|(_, s)| (s.segment, s.offset));

        let merge_dir = self.dir.clone();
        let mut writer = MergeWriter::new(&merge_dir, self.active + 1)?;
        let mut fresh: HashMap<Vec<u8>, Slot> = HashMap::with_capacity(slots.len());
        for (key, slot) in slots {
            let record = self.read_record(slot)?;
            let encoded = encode_record(&key, &record.value, false);
            let new_slot = writer.append(&encoded)?;
            fresh.insert(key, new_slot);
        }
        let merged = writer.finish()?;

        for id in &merged {
            std::fs::rename(
                segment_path(&self.dir, *id, MERGE_EXT),
                segment_path(&self.dir, *id, DATA_EXT),
            )?;
        }
        let old_ids: Vec<u64> = self.segments.keys().copied().collect();
        self.segments.clear();
        for id in old_ids {
            std::fs::remove_file(segment_path(&self.dir, id, DATA_EXT))?;
        }
        self.active = *merged.last().expect("merge always produces a segment");
        for id in merged {
            let path = segment_path(&self.dir, id, DATA_EXT);
            let file = OpenOptions::new().read(true).append(true).open(&path)?;
            let size = file.metadata()?.len();
            self.segments.insert(id, Segment { file, size });
        }
        self.keydir = fresh;
        self.reclaimable = 0;
        Ok(())
    }

    /// Copy every segment into `dest`, replacing whatever was there.
    pub fn snapshot_to(&mut self, dest: &Path) -> Result<(), StoreError> {
        self.sync()?;
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        std::fs::create_dir_all(dest)?;
        for id in self.segments.keys() {
            let name = segment_name(*id, DATA_EXT);
            std::fs::copy(self.dir.join(&name), dest.join(&name))?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        self.sync()
    }

    fn append(&mut self, record: &[u8]) -> Result<Slot, StoreError> {
        let len = record.len() as u64;
        let needs_rotation = {
            let active = self.current_segment()?;
            active.size > 0 && active.size + len > SEGMENT_MAX_BYTES
        };
        if needs_rotation {
            self.create_segment(self.active + 1)?;
        }
        let id = self.active;
        let active = self.segments.get_mut(&id).expect("active segment exists");
        let offset = active.size;
        active.file.write_all(record)?;
        active.size += len;
        Ok(Slot {
            segment: id,
            offset,
            len,
        })
    }

    fn current_segment(&mut self) -> Result<&mut Segment, StoreError> {
        if !self.segments.contains_key(&self.active) {
            self.create_segment(self.active)?;
        }
        Ok(self.segments.get_mut(&self.active).expect("just created"))
    }

    fn create_segment(&mut self, id: u64) -> Result<(), StoreError> {
        let path = segment_path(&self.dir, id, DATA_EXT);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        self.segments.insert(id, Segment { file, size });
        self.active = id;
        Ok(())
    }

    fn read_record(&mut self, slot: Slot) -> Result<Record, StoreError> {
        let segment = self
            .segments
            .get_mut(&slot.segment)
            .ok_or_else(|| StoreError::Corrupt(format!("missing segment {}", slot.segment)))?;
        let mut buf = vec![0u8; slot.len as usize];
        segment.file.seek(SeekFrom::Start(slot.offset))?;
        segment.file.read_exact(&mut buf)?;
        decode_record(&buf)
            .ok_or_else(|| StoreError::Corrupt(format!("bad record in segment {}", slot.segment)))
    }

    fn replay_segment(&mut self, id: u64) -> Result<(), StoreError> {
        let path = segment_path(&self.dir, id, DATA_EXT);
        let mut file = OpenOptions::new().read(true).open(&path)?;
        let file_len = file.metadata()?.len();
        let mut offset = 0u64;
        let mut header = [0u8; HEADER_LEN];
        loop {
            if offset + HEADER_LEN as u64 > file_len {
                break;
            }
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut header)?;
            let key_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;
            let value_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64;
            let record_len = HEADER_LEN as u64 + key_len + value_len;
            if offset + record_len > file_len
                || key_len > MAX_KEY_SIZE as u64
                || value_len > MAX_VALUE_SIZE as u64
            {
                break;
            }
            let mut buf = vec![0u8; record_len as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            let record = match decode_record(&buf) {
                Some(record) => record,
                None => break,
            };
            if record.tombstone {
                if let Some(old) = self.keydir.remove(&record.key) {
                    self.reclaimable += old.len;
                }
                self.reclaimable += record_len;
            } else {
                let slot = Slot {
                    segment: id,
                    offset,
                    len: record_len,
                };
                if let Some(old) = self.keydir.insert(record.key, slot) {
                    self.reclaimable += old.len;
                }
            }
            offset += record_len;
        }
        if offset < file_len {
            warn!(
                segment = id,
                valid = offset,
                size = file_len,
                "segment has a corrupt tail, truncating"
            );
            drop(file);
            let truncating = OpenOptions::new().write(true).open(&path)?;
            truncating.set_len(offset)?;
        }
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        self.segments.insert(
            id,
            Segment {
                file,
                size: offset,
            },
        );
        Ok(())
    }
}

struct Record {
    key: Vec<u8>,
    value: Vec<u8>,
    tombstone: bool,
}

fn encode_record(key: &[u8], value: &[u8], tombstone: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + value.len());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.push(tombstone as u8);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_record(buf: &[u8]) -> Option<Record> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let crc = u32::from_le_bytes(buf[..4].try_into().unwrap());
    if crc32fast::hash(&buf[4..]) != crc {
        return None;
    }
    let key_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    let value_len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    if buf.len() != HEADER_LEN + key_len + value_len {
        return None;
    }
    let tombstone = buf[12] != 0;
    let key = buf[HEADER_LEN..HEADER_LEN + key_len].to_vec();
    let value = buf[HEADER_LEN + key_len..].to_vec();
    Some(Record {
        key,
        value,
        tombstone,
    })
}

fn segment_name(id: u64, ext: &str) -> String {
    format!("{id:06}.{ext}")
}

fn segment_path(dir: &Path, id: u64, ext: &str) -> PathBuf {
    dir.join(segment_name(id, ext))
}

struct MergeWriter<'a> {
    dir: &'a Path,
    current: u64,
    file: File,
    size: u64,
    written: Vec<u64>,
}

impl<'a> MergeWriter<'a> {
    fn new(dir: &'a Path, start: u64) -> Result<Self, StoreError> {
        let file = File::create(segment_path(dir, start, MERGE_EXT))?;
        Ok(MergeWriter {
            dir,
            current: start,
            file,
            size: 0,
            written: vec![start],
        })
    }

    fn append(&mut self, record: &[u8]) -> Result<Slot, StoreError> {
        let len = record.len() as u64;
        if self.size > 0 && self.size + len > SEGMENT_MAX_BYTES {
            self.file.sync_all()?;
            self.current += 1;
            self.file = File::create(segment_path(self.dir, self.current, MERGE_EXT))?;
            self.size = 0;
            self.written.push(self.current);
        }
        let offset = self.size;
        self.file.write_all(record)?;
        self.size += len;
        Ok(Slot {
            segment: self.current,
            offset,
            len,
        })
    }

    fn finish(self) -> Result<Vec<u64>, StoreError> {
        self.file.sync_all()?;
        Ok(self.written)
    }
}
