//! Append-only write-ahead log of 2PC events.
//!
//! Each entry lives in its own file `<id>.log` under the log's directory,
//! with monotonically increasing, dense ids starting at 0. A write is
//! flushed and `fsync`ed before [`TxLog::append`] returns, so a crash
//! immediately after a successful append still preserves the entry.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use kv_error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Put,
    Del,
    Commit,
    Abort,
}

impl LogType {
    fn tag(self) -> u32 {
        match self {
            LogType::Put => 0,
            LogType::Del => 1,
            LogType::Commit => 2,
            LogType::Abort => 3,
        }
    }

    fn from_tag(tag: u32, path: &Path) -> Result<Self, Error> {
        match tag {
            0 => Ok(LogType::Put),
            1 => Ok(LogType::Del),
            2 => Ok(LogType::Commit),
            3 => Ok(LogType::Abort),
            other => Err(Error::CorruptLog {
                path: path.to_path_buf(),
                reason: format!("unknown log entry tag {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub kind: LogType,
    pub key: Option<String>,
    pub value: Option<String>,
}

pub struct TxLog {
    dir: PathBuf,
    next_id: RwLock<u64>,
}

impl TxLog {
    /// Opens (creating if absent) a log directory and computes `next_id`
    /// by scanning densely from 0 until the first missing file.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let mut id = 0u64;
        while entry_path(&dir, id).exists() {
            id += 1;
        }
        Ok(TxLog {
            dir,
            next_id: RwLock::new(id),
        })
    }

    pub fn next_id(&self) -> u64 {
        *self.next_id.read().unwrap()
    }

    /// Appends one entry and durably syncs it before returning.
    pub fn append(&self, kind: LogType, key: Option<&str>, value: Option<&str>) -> Result<u64, Error> {
        let mut next_id = self.next_id.write().unwrap();
        let id = *next_id;
        let path = entry_path(&self.dir, id);

        let mut payload = Vec::new();
        if let Some(k) = key {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
        }
        if let Some(v) = value {
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }

        let mut file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        file.write_u32::<NativeEndian>(kind.tag())
            .map_err(|e| Error::io(&path, e))?;
        file.write_u32::<NativeEndian>(payload.len() as u32)
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(&payload).map_err(|e| Error::io(&path, e))?;
        file.sync_all().map_err(|e| Error::io(&path, e))?;

        *next_id += 1;
        Ok(id)
    }

    pub fn log_put(&self, key: &str, value: &str) -> Result<u64, Error> {
        self.append(LogType::Put, Some(key), Some(value))
    }

    pub fn log_del(&self, key: &str) -> Result<u64, Error> {
        self.append(LogType::Del, Some(key), None)
    }

    pub fn log_commit(&self) -> Result<u64, Error> {
        self.append(LogType::Commit, None, None)
    }

    pub fn log_abort(&self) -> Result<u64, Error> {
        self.append(LogType::Abort, None, None)
    }

    /// Reads every entry in ascending id order, oldest first.
    pub fn entries(&self) -> Result<Vec<LogEntry>, Error> {
        let next_id = self.next_id();
        let mut out = Vec::with_capacity(next_id as usize);
        for id in 0..next_id {
            out.push(self.read_entry(id)?);
        }
        Ok(out)
    }

    fn read_entry(&self, id: u64) -> Result<LogEntry, Error> {
        let path = entry_path(&self.dir, id);
        let mut file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let tag = file
            .read_u32::<NativeEndian>()
            .map_err(|e| Error::io(&path, e))?;
        let kind = LogType::from_tag(tag, &path)?;
        let len = file
            .read_u32::<NativeEndian>()
            .map_err(|e| Error::io(&path, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| Error::io(&path, e))?;

        let (key, value) = match kind {
            LogType::Put => {
                let (k, rest) = split_nul(&buf, &path)?;
                let (v, _) = split_nul(rest, &path)?;
                (Some(k), Some(v))
            }
            LogType::Del => {
                let (k, _) = split_nul(&buf, &path)?;
                (Some(k), None)
            }
            LogType::Commit | LogType::Abort => (None, None),
        };

        Ok(LogEntry { id, kind, key, value })
    }

    /// Removes every entry and resets `next_id` to 0. Called only once a
    /// server is certain it will never need to replay these entries again.
    pub fn clear(&self) -> Result<(), Error> {
        let mut next_id = self.next_id.write().unwrap();
        for id in 0..*next_id {
            let path = entry_path(&self.dir, id);
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        *next_id = 0;
        Ok(())
    }
}

fn entry_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.log"))
}

fn split_nul<'a>(buf: &'a [u8], path: &Path) -> Result<(String, &'a [u8]), Error> {
    let pos = buf.iter().position(|&b| b == 0).ok_or_else(|| Error::CorruptLog {
        path: path.to_path_buf(),
        reason: "expected a NUL-terminated field".to_string(),
    })?;
    let s = std::str::from_utf8(&buf[..pos])
        .map_err(|_| Error::CorruptLog {
            path: path.to_path_buf(),
            reason: "field is not valid UTF-8".to_string(),
        })?
        .to_string();
    Ok((s, &buf[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn appends_are_dense_and_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxLog::open(dir.path()).unwrap();

        log.log_put("k", "v").unwrap();
        log.log_commit().unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, 0);
        assert_eq!(entries[0].kind, LogType::Put);
        assert_eq!(entries[0].key.as_deref(), Some("k"));
        assert_eq!(entries[0].value.as_deref(), Some("v"));
        assert_eq!(entries[1].id, 1);
        assert_eq!(entries[1].kind, LogType::Commit);
        assert_eq!(entries[1].key, None);
    }

    #[test]
    fn del_entry_carries_only_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxLog::open(dir.path()).unwrap();
        log.log_del("k").unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries[0].kind, LogType::Del);
        assert_eq!(entries[0].key.as_deref(), Some("k"));
        assert_eq!(entries[0].value, None);
    }

    #[test]
    fn clear_resets_next_id_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = TxLog::open(dir.path()).unwrap();
        log.log_put("k", "v").unwrap();
        log.log_commit().unwrap();

        log.clear().unwrap();

        assert_eq!(log.next_id(), 0);
        assert!(log.entries().unwrap().is_empty());
        assert!(!dir.path().join("0.log").exists());
    }

    #[test]
    fn reopening_an_existing_log_resumes_next_id() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = TxLog::open(dir.path()).unwrap();
            log.log_put("k", "v").unwrap();
        }
        let log = TxLog::open(dir.path()).unwrap();
        assert_eq!(log.next_id(), 1);
        log.log_commit().unwrap();
        assert_eq!(log.entries().unwrap().len(), 2);
    }
}
