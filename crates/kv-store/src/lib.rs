//! Persistent hash-chained on-disk key-value store.
//!
//! Each live entry is a file `<hash>-<chain>.entry` under the store's
//! directory, where `hash` is the [`djb2`] hash of the key and `chain` is
//! the entry's position within its collision chain. Chains are always
//! dense: deleting a non-tail entry renames the chain's last file into the
//! vacated slot so there is never a gap.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use kv_error::{Error, Kind};

pub const DEFAULT_K_MAX: usize = 1024;
pub const DEFAULT_V_MAX: usize = 1024;

/// The djb2 string hash: seed 5381, multiplier 33, unsigned 64-bit.
pub fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

pub struct Store {
    dir: PathBuf,
    lock: RwLock<()>,
    k_max: usize,
    v_max: usize,
}

impl Store {
    /// Opens (creating if absent) a store rooted at `dir`, mode 0700.
    pub fn open(dir: impl Into<PathBuf>, k_max: usize, v_max: usize) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        set_owner_only(&dir)?;
        Ok(Store {
            dir,
            lock: RwLock::new(()),
            k_max,
            v_max,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.validate_key(key)?;
        self.check_dir()?;
        let _guard = self.lock.read().unwrap();
        self.get_locked(djb2(key), key)
    }

    pub fn haskey(&self, key: &str) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.validate(key, value)?;
        self.check_dir()?;
        let _guard = self.lock.write().unwrap();
        self.put_locked(djb2(key), key, value)
    }

    /// Returns `Ok(false)` (NOKEY) if the key was absent.
    pub fn del(&self, key: &str) -> Result<bool, Error> {
        self.validate_key(key)?;
        self.check_dir()?;
        let _guard = self.lock.write().unwrap();
        self.del_locked(djb2(key), key)
    }

    /// Removes every entry file. Used by tests and by server teardown.
    pub fn clean(&self) -> Result<(), Error> {
        let _guard = self.lock.write().unwrap();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))? {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            fs::remove_file(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
        }
        Ok(())
    }

    fn get_locked(&self, hash: u64, key: &str) -> Result<Option<String>, Error> {
        for chain in 0u64.. {
            match self.read_entry(&self.entry_path(hash, chain))? {
                None => return Ok(None),
                Some((k, v)) if k == key => return Ok(Some(v)),
                Some(_) => continue,
            }
        }
        unreachable!()
    }

    fn put_locked(&self, hash: u64, key: &str, value: &str) -> Result<(), Error> {
        for chain in 0u64.. {
            let path = self.entry_path(hash, chain);
            match self.read_entry(&path)? {
                None => return self.write_entry(&path, key, value),
                Some((k, _)) if k == key => return self.write_entry(&path, key, value),
                Some(_) => continue,
            }
        }
        unreachable!()
    }

    fn del_locked(&self, hash: u64, key: &str) -> Result<bool, Error> {
        let mut target = None;
        let mut tail = 0u64;
        loop {
            let path = self.entry_path(hash, tail);
            match self.read_entry(&path)? {
                None => break,
                Some((k, _)) => {
                    if k == key {
                        target = Some(tail);
                    }
                    tail += 1;
                }
            }
        }
        let target = match target {
            Some(t) => t,
            None => return Ok(false),
        };
        let last = tail - 1;
        if target == last {
            let path = self.entry_path(hash, target);
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        } else {
            let last_path = self.entry_path(hash, last);
            let target_path = self.entry_path(hash, target);
            fs::rename(&last_path, &target_path).map_err(|e| Error::io(&last_path, e))?;
        }
        Ok(true)
    }

    fn entry_path(&self, hash: u64, chain: u64) -> PathBuf {
        self.dir.join(format!("{hash}-{chain}.entry"))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<(String, String)>, Error> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        let len = file
            .read_u32::<NativeEndian>()
            .map_err(|e| Error::io(path, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
        parse_entry(&buf).ok_or_else(|| Error::CorruptEntry {
            path: path.to_path_buf(),
            reason: "payload is not two NUL-terminated strings".to_string(),
        })
    }

    fn write_entry(&self, path: &Path, key: &str, value: &str) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(key.len() + value.len() + 2);
        payload.extend_from_slice(key.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);

        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        file.write_u32::<NativeEndian>(payload.len() as u32)
            .map_err(|e| Error::io(path, e))?;
        file.write_all(&payload).map_err(|e| Error::io(path, e))?;
        file.flush().map_err(|e| Error::io(path, e))
    }

    /// Validates a key against the configured length bound without
    /// touching disk. Used by TPC participants to decide a vote before
    /// any store mutation is attempted.
    pub fn check_key(&self, key: &str) -> Result<(), Error> {
        self.validate_key(key)
    }

    /// Validates a key/value pair against the configured length bounds
    /// without touching disk.
    pub fn check_put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.validate(key, value)
    }

    fn validate_key(&self, key: &str) -> Result<(), Error> {
        if key.is_empty() || key.len() > self.k_max {
            return Err(Kind::KeyLen.into());
        }
        Ok(())
    }

    fn validate(&self, key: &str, value: &str) -> Result<(), Error> {
        self.validate_key(key)?;
        if value.is_empty() || value.len() > self.v_max {
            return Err(Kind::ValLen.into());
        }
        Ok(())
    }

    fn check_dir(&self) -> Result<(), Error> {
        if !self.dir.is_dir() {
            return Err(Error::io(
                &self.dir,
                io::Error::new(io::ErrorKind::NotFound, "store directory missing"),
            ));
        }
        Ok(())
    }
}

fn parse_entry(buf: &[u8]) -> Option<(String, String)> {
    let nul = buf.iter().position(|&b| b == 0)?;
    let key = std::str::from_utf8(&buf[..nul]).ok()?.to_string();
    let rest = &buf[nul + 1..];
    let value_end = rest.iter().position(|&b| b == 0)?;
    let value = std::str::from_utf8(&rest[..value_end]).ok()?.to_string();
    Some((key, value))
}

#[cfg(unix)]
fn set_owner_only(dir: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(dir).map_err(|e| Error::io(dir, e))?.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(dir, perms).map_err(|e| Error::io(dir, e))
}

#[cfg(not(unix))]
fn set_owner_only(_dir: &Path) -> Result<(), Error> {
    Ok(())
}
