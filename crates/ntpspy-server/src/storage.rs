// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Storage providers for reassembled transfers.
//!
//! A provider opens one [`Sink`] per live session. The sink accepts chunk
//! writes at arbitrary offsets (the network reorders freely), can digest
//! its current contents, and finishes with exactly one of `commit` —
//! atomically publishing the file under its final name — or `abort`. A
//! file is never visible under a non-temp name with fewer bytes than its
//! declared size.
//!
//! [`FileStore`] is the real thing; [`MemStore`] backs tests.

use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Prefix of in-progress reassembly files under the storage root.
const PART_PREFIX: &str = ".ntpspy-";

/// Suffix of in-progress reassembly files.
const PART_SUFFIX: &str = ".part";

/// An in-progress reassembly target for one transfer.
pub trait Sink: Send {
    /// Write `data` at byte `offset`. Writes for a given offset happen at
    /// most once (the session bitmap guarantees it).
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// CRC32C over the full contents written so far, in one pass.
    fn digest(&mut self) -> io::Result<u32>;

    /// Publish the contents under `name`, applying the store's collision
    /// policy. Returns the name actually used.
    fn commit(self: Box<Self>, name: &str) -> io::Result<String>;

    /// Discard the contents.
    fn abort(self: Box<Self>);
}

/// Opens sinks for new sessions and sweeps leftovers on startup.
pub trait StorageProvider {
    /// Open a sink for a new transfer of `total_size` bytes.
    fn begin(&mut self, transfer_id: u32, total_size: u64) -> io::Result<Box<dyn Sink>>;

    /// Delete in-progress artifacts left by a previous process. Returns
    /// the number removed.
    fn sweep(&mut self) -> io::Result<usize>;
}

/// Pick a collision-free variant of `name`: `h.txt`, `h-1.txt`, `h-2.txt`, …
///
/// The counter goes before the extension; names without an extension (or
/// dotfiles) get a plain `-N` suffix.
fn dedup_name(name: &str, exists: impl Fn(&str) -> bool) -> String {
    if !exists(name) {
        return name.to_owned();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1u32.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        if !exists(&candidate) {
            return candidate;
        }
    }
    unreachable!("u32 candidate space exhausted")
}

/// Filesystem-backed storage under a single root directory.
pub struct FileStore {
    root: PathBuf,
    overwrite: bool,
}

impl FileStore {
    /// Open (creating if needed) the storage root.
    pub fn new(root: PathBuf, overwrite: bool) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(FileStore { root, overwrite })
    }
}

impl StorageProvider for FileStore {
    fn begin(&mut self, transfer_id: u32, total_size: u64) -> io::Result<Box<dyn Sink>> {
        let suffix: u32 = rand::random();
        let path = self
            .root
            .join(format!("{PART_PREFIX}{transfer_id}-{suffix:08x}{PART_SUFFIX}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(total_size)?;
        debug!("opened temp file {}", path.display());
        Ok(Box::new(FileSink {
            file,
            path,
            root: self.root.clone(),
            overwrite: self.overwrite,
        }))
    }

    fn sweep(&mut self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(PART_PREFIX) && name.ends_with(PART_SUFFIX) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("could not sweep {}: {e}", entry.path().display()),
                }
            }
        }
        Ok(removed)
    }
}

// No Drop cleanup: a killed or interrupted server deliberately leaves its
// .part files behind for the startup sweep. Live sessions delete theirs
// through commit/abort.
struct FileSink {
    file: File,
    path: PathBuf,
    root: PathBuf,
    overwrite: bool,
}

impl Sink for FileSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn digest(&mut self) -> io::Result<u32> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut crc = 0u32;
        let mut buf = [0u8; 8192];
        loop {
            let n = self.file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
        }
        Ok(crc)
    }

    fn commit(self: Box<Self>, name: &str) -> io::Result<String> {
        self.file.sync_all()?;
        let final_name = if self.overwrite {
            name.to_owned()
        } else {
            dedup_name(name, |candidate| self.root.join(candidate).exists())
        };
        fs::rename(&self.path, self.root.join(&final_name))?;
        Ok(final_name)
    }

    fn abort(self: Box<Self>) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

/// In-memory storage for tests: committed files land in a shared map.
#[derive(Clone, Default)]
pub struct MemStore {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    overwrite: bool,
}

impl MemStore {
    /// An empty store with the given collision policy.
    pub fn new(overwrite: bool) -> Self {
        MemStore {
            files: Arc::new(Mutex::new(HashMap::new())),
            overwrite,
        }
    }

    /// Snapshot the committed file names and contents.
    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.files.lock().expect("mem store poisoned").clone()
    }
}

impl StorageProvider for MemStore {
    fn begin(&mut self, _transfer_id: u32, total_size: u64) -> io::Result<Box<dyn Sink>> {
        Ok(Box::new(MemSink {
            buf: vec![0u8; total_size as usize],
            files: self.files.clone(),
            overwrite: self.overwrite,
        }))
    }

    fn sweep(&mut self) -> io::Result<usize> {
        Ok(0)
    }
}

struct MemSink {
    buf: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    overwrite: bool,
}

impl Sink for MemSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write beyond declared size",
            ));
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn digest(&mut self) -> io::Result<u32> {
        Ok(crc32c::crc32c(&self.buf))
    }

    fn commit(self: Box<Self>, name: &str) -> io::Result<String> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("mem store poisoned"))?;
        let final_name = if self.overwrite {
            name.to_owned()
        } else {
            dedup_name(name, |candidate| files.contains_key(candidate))
        };
        files.insert(final_name.clone(), self.buf);
        Ok(final_name)
    }

    fn abort(self: Box<Self>) {}
}
