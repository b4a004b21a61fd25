//! A journaled, size-bounded, LRU key-value store on the filesystem.
//!
//! Each entry has two streams: `<key>.0` and `<key>.1`, written via `.tmp`
//! files and committed atomically. A text journal records every mutation;
//! replaying it on open reconstructs the in-memory index and LRU order.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub(crate) const MAGIC: &str = "libcore.io.DiskLruCache";
pub(crate) const VERSION: &str = "1";
const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP: &str = "journal.tmp";
const JOURNAL_BACKUP: &str = "journal.bkp";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Keys are constrained so they are safe as file names everywhere.
fn is_legal_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 120
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

#[derive(Debug)]
struct Entry {
    lengths: [u64; 2],
    readable: bool,
    has_editor: bool,
}

#[derive(Debug)]
struct LruState {
    directory: PathBuf,
    app_version: u32,
    max_size: u64,
    size: u64,
    entries: HashMap<String, Entry>,
    /// Keys from least to most recently used.
    lru: Vec<String>,
    journal: Option<File>,
    redundant_op_count: usize,
    closed: bool,
}

/// The store. Clones share state.
#[derive(Clone, Debug)]
pub(crate) struct DiskLruCache {
    state: Arc<Mutex<LruState>>,
}

impl DiskLruCache {
    /// Opens the cache in `directory`, replaying (or rebuilding) the
    /// journal. A corrupt journal discards the directory's contents.
    pub(crate) fn open(directory: &Path, app_version: u32, max_size: u64) -> io::Result<DiskLruCache> {
        assert!(max_size > 0, "max_size <= 0");
        fs::create_dir_all(directory)?;

        // Prefer a backup journal left by a crashed rebuild.
        let backup = directory.join(JOURNAL_BACKUP);
        let journal_path = directory.join(JOURNAL_FILE);
        if backup.exists() {
            if journal_path.exists() {
                let _ = fs::remove_file(&backup);
            } else {
                fs::rename(&backup, &journal_path)?;
            }
        }

        let mut state = LruState {
            directory: directory.to_path_buf(),
            app_version,
            max_size,
            size: 0,
            entries: HashMap::new(),
            lru: Vec::new(),
            journal: None,
            redundant_op_count: 0,
            closed: false,
        };

        if journal_path.exists() {
            match read_journal(&mut state) {
                Ok(()) => {
                    state.journal = Some(
                        OpenOptions::new().append(true).create(true).open(&journal_path)?,
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "DiskLruCache {:?} is corrupt: {}; removing",
                        directory,
                        e
                    );
                    delete_contents(directory)?;
                    state.entries.clear();
                    state.lru.clear();
                    state.size = 0;
                }
            }
        }

        let cache = DiskLruCache {
            state: Arc::new(Mutex::new(state)),
        };
        {
            let mut state = cache.state.lock().expect("lru poisoned");
            if state.journal.is_none() {
                cache.rebuild_journal_locked(&mut state)?;
            }
        }
        Ok(cache)
    }

    /// A snapshot of a readable entry, or `None`.
    pub(crate) fn get(&self, key: &str) -> Option<Snapshot> {
        let mut state = self.state.lock().expect("lru poisoned");
        if state.closed || !is_legal_key(key) {
            return None;
        }
        let lengths = {
            let entry = state.entries.get(key)?;
            if !entry.readable {
                return None;
            }
            entry.lengths
        };

        let mut sources = Vec::with_capacity(2);
        for i in 0..2 {
            match File::open(entry_file(&state.directory, key, i)) {
                Ok(file) => sources.push(Some(file)),
                Err(_) => {
                    // Files vanished externally; drop the entry.
                    drop(sources);
                    let _ = self.remove_locked(&mut state, key);
                    return None;
                }
            }
        }

        state.redundant_op_count += 1;
        let _ = write_journal_line(&mut state, &format!("{} {}", READ, key));
        touch_lru(&mut state, key);
        let _ = self.rebuild_if_required(&mut state);

        Some(Snapshot { lengths, sources })
    }

    /// Begins an edit, or returns `None` when another editor is active.
    pub(crate) fn edit(&self, key: &str) -> Option<Editor> {
        let mut state = self.state.lock().expect("lru poisoned");
        if state.closed || !is_legal_key(key) {
            return None;
        }
        {
            let entry = state.entries.entry(key.to_string()).or_insert(Entry {
                lengths: [0, 0],
                readable: false,
                has_editor: false,
            });
            if entry.has_editor {
                return None;
            }
            entry.has_editor = true;
        }
        if !state.lru.iter().any(|k| k == key) {
            state.lru.push(key.to_string());
        }
        let _ = write_journal_line(&mut state, &format!("{} {}", DIRTY, key));
        Some(Editor {
            cache: self.clone(),
            key: key.to_string(),
            written: [false, false],
            done: false,
        })
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("lru poisoned");
        self.remove_locked(&mut state, key)
    }

    pub(crate) fn size(&self) -> u64 {
        self.state.lock().expect("lru poisoned").size
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.state.lock().expect("lru poisoned").max_size
    }

    pub(crate) fn directory(&self) -> PathBuf {
        self.state.lock().expect("lru poisoned").directory.clone()
    }

    /// All readable keys, least recently used first.
    pub(crate) fn keys(&self) -> Vec<String> {
        let state = self.state.lock().expect("lru poisoned");
        state
            .lru
            .iter()
            .filter(|k| state.entries.get(*k).map(|e| e.readable).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub(crate) fn evict_all(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("lru poisoned");
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            self.remove_locked(&mut state, &key);
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock().expect("lru poisoned");
        state.closed = true;
        state.journal = None;
    }

    // ===== editor callbacks =====

    fn commit_edit(&self, key: &str, written: &[bool; 2]) -> io::Result<()> {
        let mut state = self.state.lock().expect("lru poisoned");
        let directory = state.directory.clone();

        let mut new_lengths = [0u64; 2];
        let old = match state.entries.get(key) {
            Some(entry) => entry.lengths,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "entry vanished")),
        };
        let was_readable = state.entries.get(key).map(|e| e.readable).unwrap_or(false);

        for i in 0..2 {
            let tmp = tmp_file(&directory, key, i);
            let target = entry_file(&directory, key, i);
            if written[i] {
                fs::rename(&tmp, &target)?;
                new_lengths[i] = fs::metadata(&target)?.len();
            } else if was_readable {
                new_lengths[i] = old[i];
            } else {
                // An unwritten stream of a brand-new entry is empty.
                File::create(&target)?;
                new_lengths[i] = 0;
            }
        }

        let old_total: u64 = old.iter().sum();
        let new_total: u64 = new_lengths.iter().sum();
        state.size = state.size - if was_readable { old_total } else { 0 } + new_total;

        {
            let entry = state.entries.get_mut(key).expect("checked above");
            entry.lengths = new_lengths;
            entry.readable = true;
            entry.has_editor = false;
        }
        write_journal_line(
            &mut state,
            &format!("{} {} {} {}", CLEAN, key, new_lengths[0], new_lengths[1]),
        )?;
        touch_lru(&mut state, key);

        self.trim_to_size(&mut state);
        self.rebuild_if_required(&mut state)?;
        Ok(())
    }

    fn abort_edit(&self, key: &str, _written: &[bool; 2]) {
        let mut state = self.state.lock().expect("lru poisoned");
        let directory = state.directory.clone();
        for i in 0..2 {
            let _ = fs::remove_file(tmp_file(&directory, key, i));
        }
        let remove_entirely = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.has_editor = false;
                !entry.readable
            }
            None => false,
        };
        if remove_entirely {
            state.entries.remove(key);
            state.lru.retain(|k| k != key);
        }
        state.redundant_op_count += 1;
        let _ = write_journal_line(&mut state, &format!("{} {}", REMOVE, key));
    }

    fn remove_locked(&self, state: &mut LruState, key: &str) -> bool {
        let Some(entry) = state.entries.remove(key) else {
            return false;
        };
        let directory = state.directory.clone();
        for i in 0..2 {
            let _ = fs::remove_file(entry_file(&directory, key, i));
        }
        if entry.readable {
            state.size = state.size.saturating_sub(entry.lengths.iter().sum());
        }
        state.lru.retain(|k| k != key);
        state.redundant_op_count += 1;
        let _ = write_journal_line(state, &format!("{} {}", REMOVE, key));
        true
    }

    fn trim_to_size(&self, state: &mut LruState) {
        while state.size > state.max_size {
            let victim = state
                .lru
                .iter()
                .find(|k| {
                    state
                        .entries
                        .get(*k)
                        .map(|e| e.readable && !e.has_editor)
                        .unwrap_or(false)
                })
                .cloned();
            match victim {
                Some(key) => {
                    tracing::debug!("evicting {} to honor the size cap", key);
                    self.remove_locked(state, &key);
                }
                None => break,
            }
        }
    }

    fn rebuild_if_required(&self, state: &mut LruState) -> io::Result<()> {
        if state.redundant_op_count >= 2000 && state.redundant_op_count >= state.entries.len() {
            self.rebuild_journal_locked(state)?;
        }
        Ok(())
    }

    /// Writes a compact journal atomically: tmp, backup, rename.
    fn rebuild_journal_locked(&self, state: &mut LruState) -> io::Result<()> {
        state.journal = None;

        let tmp_path = state.directory.join(JOURNAL_TMP);
        {
            let mut tmp = File::create(&tmp_path)?;
            writeln!(tmp, "{}", MAGIC)?;
            writeln!(tmp, "{}", VERSION)?;
            writeln!(tmp, "{}", state.app_version)?;
            writeln!(tmp, "2")?;
            writeln!(tmp)?;
            for key in &state.lru {
                let Some(entry) = state.entries.get(key) else { continue };
                if entry.has_editor {
                    writeln!(tmp, "{} {}", DIRTY, key)?;
                }
                if entry.readable {
                    writeln!(tmp, "{} {} {} {}", CLEAN, key, entry.lengths[0], entry.lengths[1])?;
                }
            }
            tmp.sync_all()?;
        }

        let journal_path = state.directory.join(JOURNAL_FILE);
        let backup_path = state.directory.join(JOURNAL_BACKUP);
        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&tmp_path, &journal_path)?;
        let _ = fs::remove_file(&backup_path);

        state.journal = Some(OpenOptions::new().append(true).open(&journal_path)?);
        state.redundant_op_count = 0;
        Ok(())
    }
}

/// A committed view of one entry. Holds open file handles; readable even if
/// the entry is later replaced or evicted.
#[derive(Debug)]
pub(crate) struct Snapshot {
    lengths: [u64; 2],
    sources: Vec<Option<File>>,
}

impl Snapshot {
    pub(crate) fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// Takes the stream at `index`. Each stream may be taken once.
    pub(crate) fn take_source(&mut self, index: usize) -> Option<File> {
        self.sources.get_mut(index)?.take()
    }
}

/// An exclusive in-progress edit. Commit or the edit aborts on drop.
#[derive(Debug)]
pub(crate) struct Editor {
    cache: DiskLruCache,
    key: String,
    written: [bool; 2],
    done: bool,
}

impl Editor {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Opens the tmp sink for stream `index`.
    pub(crate) fn new_sink(&mut self, index: usize) -> io::Result<File> {
        let directory = self.cache.state.lock().expect("lru poisoned").directory.clone();
        self.written[index] = true;
        File::create(tmp_file(&directory, &self.key, index))
    }

    pub(crate) fn commit(mut self) -> io::Result<()> {
        self.done = true;
        self.cache.clone().commit_edit(&self.key, &self.written)
    }

    pub(crate) fn abort(mut self) {
        self.done = true;
        self.cache.clone().abort_edit(&self.key, &self.written);
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.done {
            self.cache.clone().abort_edit(&self.key, &self.written);
        }
    }
}

// ===== journal I/O =====

fn entry_file(directory: &Path, key: &str, index: usize) -> PathBuf {
    directory.join(format!("{}.{}", key, index))
}

fn tmp_file(directory: &Path, key: &str, index: usize) -> PathBuf {
    directory.join(format!("{}.{}.tmp", key, index))
}

fn touch_lru(state: &mut LruState, key: &str) {
    state.lru.retain(|k| k != key);
    state.lru.push(key.to_string());
}

fn write_journal_line(state: &mut LruState, line: &str) -> io::Result<()> {
    if let Some(ref mut journal) = state.journal {
        journal.write_all(line.as_bytes())?;
        journal.write_all(b"\n")?;
        journal.flush()?;
    }
    Ok(())
}

fn read_journal(state: &mut LruState) -> io::Result<()> {
    let path = state.directory.join(JOURNAL_FILE);
    let mut reader = BufReader::new(File::open(&path)?);
    let mut line = String::new();

    let mut read_line = |reader: &mut BufReader<File>| -> io::Result<Option<String>> {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches('\n').to_string()))
    };

    let corrupt = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected journal header: {}", what));

    let magic = read_line(&mut reader)?.ok_or_else(|| corrupt("empty"))?;
    let version = read_line(&mut reader)?.ok_or_else(|| corrupt("truncated"))?;
    let app_version = read_line(&mut reader)?.ok_or_else(|| corrupt("truncated"))?;
    let value_count = read_line(&mut reader)?.ok_or_else(|| corrupt("truncated"))?;
    let blank = read_line(&mut reader)?.ok_or_else(|| corrupt("truncated"))?;
    if magic != MAGIC
        || version != VERSION
        || app_version != state.app_version.to_string()
        || value_count != "2"
        || !blank.is_empty()
    {
        return Err(corrupt(&format!(
            "[{}, {}, {}, {}, {}]",
            magic, version, app_version, value_count, blank
        )));
    }

    let mut op_count = 0usize;
    while let Some(line) = read_line(&mut reader)? {
        apply_journal_line(state, &line)
            .map_err(|()| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected journal line: {}", line)))?;
        op_count += 1;
    }
    state.redundant_op_count = op_count.saturating_sub(state.entries.len());

    // Resolve dangling edits left by a crash.
    let dangling: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, e)| e.has_editor)
        .map(|(k, _)| k.clone())
        .collect();
    let directory = state.directory.clone();
    for key in dangling {
        for i in 0..2 {
            let _ = fs::remove_file(tmp_file(&directory, &key, i));
        }
        let entry = state.entries.get_mut(&key).expect("listed above");
        entry.has_editor = false;
        if !entry.readable {
            state.entries.remove(&key);
            state.lru.retain(|k| k != &key);
        }
    }

    state.size = state
        .entries
        .values()
        .filter(|e| e.readable)
        .map(|e| e.lengths.iter().sum::<u64>())
        .sum();
    Ok(())
}

fn apply_journal_line(state: &mut LruState, line: &str) -> Result<(), ()> {
    let mut parts = line.split(' ');
    let op = parts.next().ok_or(())?;
    let key = parts.next().ok_or(())?;
    if !is_legal_key(key) {
        return Err(());
    }
    match op {
        CLEAN => {
            let len0: u64 = parts.next().ok_or(())?.parse().map_err(|_| ())?;
            let len1: u64 = parts.next().ok_or(())?.parse().map_err(|_| ())?;
            if parts.next().is_some() {
                return Err(());
            }
            state.entries.insert(
                key.to_string(),
                Entry {
                    lengths: [len0, len1],
                    readable: true,
                    has_editor: false,
                },
            );
            touch_lru(state, key);
        }
        DIRTY => {
            if parts.next().is_some() {
                return Err(());
            }
            let entry = state.entries.entry(key.to_string()).or_insert(Entry {
                lengths: [0, 0],
                readable: false,
                has_editor: false,
            });
            entry.has_editor = true;
        }
        REMOVE => {
            if parts.next().is_some() {
                return Err(());
            }
            state.entries.remove(key);
            state.lru.retain(|k| k != key);
        }
        READ => {
            if parts.next().is_some() {
                return Err(());
            }
            touch_lru(state, key);
        }
        _ => return Err(()),
    }
    Ok(())
}

fn delete_contents(directory: &Path) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
