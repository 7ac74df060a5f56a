#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use data_agent_audit_core::{AuditLog, ScannedLine};
use data_agent_domain::{LogEntry, GENESIS_HASH};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Chain head persisted next to the log so appends do not rescan the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainHead {
    pub last_hash: String,
    pub entries: usize,
    /// Log length in bytes when this head was written. The index is stale
    /// when this or `last_hash` disagrees with the log's current tail.
    pub log_len: u64,
}

impl ChainHead {
    fn genesis() -> Self {
        Self {
            last_hash: GENESIS_HASH.to_string(),
            entries: 0,
            log_len: 0,
        }
    }
}

/// JSON-lines audit log, one entry per line.
///
/// Appends hold an exclusive `flock` on the log for the whole
/// read-head, write, update-index sequence; readers hold a shared lock.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    head_path: PathBuf,
    head: Mutex<Option<ChainHead>>,
}

impl JsonlAuditLog {
    /// Prepare a log at `path`, creating parent directories. The log file
    /// itself is created on first append.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create audit log directory {}", parent.display())
            })?;
        }
        let mut head_name = path.as_os_str().to_os_string();
        head_name.push(".head");
        Ok(Self {
            path: path.to_path_buf(),
            head_path: PathBuf::from(head_name),
            head: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    /// Current chain head, rebuilt from the log if the index is stale.
    ///
    /// # Errors
    /// Returns an error if the log or its index cannot be read.
    pub fn head(&self) -> Result<ChainHead> {
        let Some(file) = self.open_existing()? else {
            return Ok(ChainHead::genesis());
        };
        FileExt::lock_shared(&file)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        let head = self.resolve_head(&file);
        FileExt::unlock(&file).ok();
        head
    }

    fn open_existing(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to open {}", self.path.display()))
            }
        }
    }

    // Caller holds a lock on `file`.
    fn resolve_head(&self, file: &File) -> Result<ChainHead> {
        let log_len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", self.path.display()))?
            .len();
        if log_len == 0 {
            return Ok(ChainHead::genesis());
        }

        let cached = self
            .head
            .lock()
            .map_err(|_| anyhow!("audit head lock poisoned"))?
            .clone();
        let mut tail_hash = None;
        for candidate in [cached, self.read_index()].into_iter().flatten() {
            if candidate.log_len != log_len {
                continue;
            }
            if tail_hash.is_none() {
                tail_hash = Some(tail_entry_hash(file, log_len)?);
            }
            if tail_hash.as_ref().and_then(Option::as_deref) == Some(candidate.last_hash.as_str()) {
                return Ok(candidate);
            }
        }

        debug!(path = %self.path.display(), "rebuilding audit chain head");
        rebuild_head(file, log_len)
    }

    fn read_index(&self) -> Option<ChainHead> {
        let raw = fs::read_to_string(&self.head_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(head) => Some(head),
            Err(err) => {
                warn!(path = %self.head_path.display(), error = %err, "ignoring unreadable audit head index");
                None
            }
        }
    }

    fn write_index(&self, head: &ChainHead) -> Result<()> {
        let mut tmp_name = self.head_path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let body = serde_json::to_vec(head).context("failed to encode audit head index")?;
        fs::write(&tmp_path, body)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.head_path)
            .with_context(|| format!("failed to replace {}", self.head_path.display()))
    }

    fn append_locked(
        &self,
        file: &mut File,
        entry_id: &str,
        event_type: &str,
        data: Value,
    ) -> Result<LogEntry> {
        let head = self.resolve_head(file)?;
        let entry = LogEntry::seal(entry_id, event_type, data, &head.last_hash);

        let mut line = serde_json::to_vec(&entry).context("failed to encode audit entry")?;
        line.push(b'\n');
        if head.log_len > 0 && !ends_with_newline(file)? {
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;

        let next = ChainHead {
            last_hash: entry.entry_hash.clone(),
            entries: head.entries + 1,
            log_len: head.log_len + u64::try_from(line.len()).unwrap_or(u64::MAX),
        };
        if let Err(err) = self.write_index(&next) {
            warn!(error = %err, "audit head index not updated; it will be rebuilt");
        }
        *self
            .head
            .lock()
            .map_err(|_| anyhow!("audit head lock poisoned"))? = Some(next);
        Ok(entry)
    }
}

impl AuditLog for JsonlAuditLog {
    fn append(&self, entry_id: &str, event_type: &str, data: Value) -> Result<LogEntry> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        let appended = self.append_locked(&mut file, entry_id, event_type, data);
        FileExt::unlock(&file)
            .with_context(|| format!("failed to unlock {}", self.path.display()))?;
        appended
    }

    fn scan(&self, visit: &mut dyn FnMut(ScannedLine) -> ControlFlow<()>) -> Result<()> {
        let Some(file) = self.open_existing()? else {
            return Ok(());
        };
        FileExt::lock_shared(&file)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        let scanned = scan_lines(&file, visit);
        FileExt::unlock(&file).ok();
        scanned.with_context(|| format!("failed to read {}", self.path.display()))
    }
}

fn scan_lines(
    file: &File,
    visit: &mut dyn FnMut(ScannedLine) -> ControlFlow<()>,
) -> std::io::Result<()> {
    let reader = BufReader::new(file);
    for (idx, raw) in reader.split(b'\n').enumerate() {
        let raw = raw?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let scanned = ScannedLine {
            line: idx + 1,
            entry: serde_json::from_slice::<LogEntry>(&raw).map_err(|err| err.to_string()),
        };
        if visit(scanned).is_break() {
            break;
        }
    }
    Ok(())
}

// The head is the last decodable entry; the line count includes corrupted
// lines so that verification still reports them.
fn rebuild_head(file: &File, log_len: u64) -> Result<ChainHead> {
    let mut reader = file;
    reader
        .seek(SeekFrom::Start(0))
        .context("failed to rewind audit log")?;
    let mut head = ChainHead {
        log_len,
        ..ChainHead::genesis()
    };
    scan_lines(reader, &mut |scanned| {
        head.entries += 1;
        match scanned.entry {
            Ok(entry) => head.last_hash = entry.entry_hash,
            Err(reason) => warn!(line = scanned.line, %reason, "undecodable audit line"),
        }
        ControlFlow::Continue(())
    })
    .context("failed to scan audit log")?;
    Ok(head)
}

// Entry hash on the last non-blank line, read backwards from the end in
// growing windows. `None` when that line does not decode.
fn tail_entry_hash(file: &File, log_len: u64) -> Result<Option<String>> {
    let mut window = 4096_u64;
    loop {
        let start = log_len.saturating_sub(window);
        let mut reader = file;
        reader
            .seek(SeekFrom::Start(start))
            .context("failed to seek audit log")?;
        let mut tail = Vec::new();
        reader
            .take(log_len - start)
            .read_to_end(&mut tail)
            .context("failed to read audit log tail")?;
        let end = tail
            .iter()
            .rposition(|byte| !byte.is_ascii_whitespace())
            .map_or(0, |idx| idx + 1);
        let body = &tail[..end];
        let line = match body.iter().rposition(|byte| *byte == b'\n') {
            Some(pos) => &body[pos + 1..],
            None if start == 0 => body,
            None => {
                window = window.saturating_mul(2);
                continue;
            }
        };
        return Ok(serde_json::from_slice::<LogEntry>(line)
            .ok()
            .map(|entry| entry.entry_hash));
    }
}

fn ends_with_newline(file: &File) -> Result<bool> {
    let mut reader = file;
    reader
        .seek(SeekFrom::End(-1))
        .context("failed to seek audit log")?;
    let mut last = [0_u8; 1];
    reader
        .read_exact(&mut last)
        .context("failed to read audit log tail")?;
    Ok(last[0] == b'\n')
}
