use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::mem;
use std::path::{Path, PathBuf};
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::types::*;
use crate::error::StoreError;

/** Position in the durable log. Records are numbered from 0 in append order. */
pub type Marker = u64;

/**
 * Accepted edits which haven't been applied yet. Sessions push onto the end; the updater swaps the
 * whole queue out once per cycle.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitLog {
    pending: Vec<EditRequest>,
    /// Requests applied since the server was first started.
    pub(crate) applied: u64,
    /// Requests written to the durable log. Recovery replays from here.
    pub(crate) persisted: Marker,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, req: EditRequest) {
        self.pending.push(req);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything queued so far, leaving an empty queue behind.
    pub fn drain(&mut self) -> Vec<EditRequest> {
        mem::take(&mut self.pending)
    }

    pub(crate) fn pending(&self) -> &[EditRequest] {
        &self.pending
    }

    /// The oldest view any queued edit for `doc_id` was computed against.
    pub(crate) fn oldest_view(&self, doc_id: DocId) -> Option<View> {
        self.pending.iter()
            .filter(|req| req.doc_id == doc_id)
            .flat_map(|req| req.ops.iter().map(|b| b.view).chain(Some(req.view)))
            .min()
    }
}

/**
 * The durable, append-only record of every applied request. Insertion order is the order requests
 * were applied in, and recovery replays it in the same order.
 */
pub trait LogStore: Send {
    /// Append the requests and return the marker one past the last of them.
    fn append(&mut self, reqs: &[EditRequest]) -> Result<Marker, StoreError>;

    /// Every request at or after `marker`, in the order they were appended.
    fn find_since(&self, marker: Marker) -> Result<Vec<EditRequest>, StoreError>;

    /// The marker the next append will start at.
    fn end(&self) -> Marker;
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    num: Marker,
    request: EditRequest,
}

#[derive(Debug, Default)]
pub struct MemLogStore {
    records: Vec<EditRequest>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, reqs: &[EditRequest]) -> Result<Marker, StoreError> {
        self.records.extend_from_slice(reqs);
        Ok(self.end())
    }

    fn find_since(&self, marker: Marker) -> Result<Vec<EditRequest>, StoreError> {
        let start = (marker as usize).min(self.records.len());
        Ok(self.records[start..].to_vec())
    }

    fn end(&self) -> Marker {
        self.records.len() as Marker
    }
}

/**
 * JSON lines on disk, one record per line. Each append is synced before it returns.
 *
 * A crash part way through an append leaves a torn last line. Nothing in it was ever reported as
 * persisted, so it's cut off when the file is next opened.
 */
#[derive(Debug)]
pub struct FileLogStore {
    path: PathBuf,
    file: File,
    next: Marker,
    /// Bytes of complete records. Everything past this is junk from a failed append.
    len: u64,
}

struct Scan {
    records: Vec<LogRecord>,
    valid_len: u64,
    torn: bool,
}

fn scan(path: &Path) -> Result<Scan, StoreError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut line = Vec::new();
    let mut valid_len = 0;
    let mut line_no = 0;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 { break; }
        line_no += 1;

        let complete = line.ends_with(b"\n");
        let last = !complete || reader.fill_buf()?.is_empty();

        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len += n as u64;
            continue;
        }

        match serde_json::from_slice::<LogRecord>(&line) {
            Ok(record) if complete => {
                records.push(record);
                valid_len += n as u64;
            },
            Ok(_) => return Ok(Scan { records, valid_len, torn: true }),
            Err(_) if last => return Ok(Scan { records, valid_len, torn: true }),
            Err(source) => return Err(StoreError::Decode { line: line_no, source }),
        }
    }

    Ok(Scan { records, valid_len, torn: false })
}

impl FileLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let scan = scan(&path)?;
        if scan.torn {
            warn!("{}: cutting off a torn record after {} bytes", path.display(), scan.valid_len);
            file.set_len(scan.valid_len)?;
            file.sync_data()?;
        }

        Ok(FileLogStore {
            path,
            file,
            next: scan.records.len() as Marker,
            len: scan.valid_len,
        })
    }

    fn read_records(&self) -> Result<Vec<LogRecord>, StoreError> {
        Ok(scan(&self.path)?.records)
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    /// Drop whatever a failed append managed to write, so the retry starts from a clean end.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            error!("{}: could not cut back to {} bytes: {}", self.path.display(), self.len, e);
        }
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, reqs: &[EditRequest]) -> Result<Marker, StoreError> {
        if reqs.is_empty() { return Ok(self.next); }

        let mut buf = Vec::new();
        for (i, request) in reqs.iter().enumerate() {
            let record = LogRecord { num: self.next + i as Marker, request: request.clone() };
            serde_json::to_writer(&mut buf, &record).map_err(StoreError::Encode)?;
            buf.push(b'\n');
        }

        if let Err(e) = self.write_synced(&buf) {
            self.rollback();
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        self.next += reqs.len() as Marker;
        Ok(self.next)
    }

    fn find_since(&self, marker: Marker) -> Result<Vec<EditRequest>, StoreError> {
        Ok(self.read_records()?
            .into_iter()
            .filter(|r| r.num >= marker)
            .map(|r| r.request)
            .collect())
    }

    fn end(&self) -> Marker {
        self.next
    }
}
