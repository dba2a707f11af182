use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_std::task;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::types::DocId;
use crate::config::ServerConfig;
use crate::doc_state::DocState;
use crate::commit_log::{CommitLog, LogStore};
use crate::error::PersistError;
use crate::server::Server;

/**
 * Everything needed to bring a server back: the documents, anything accepted but not yet applied,
 * and how far into the durable log the documents already reflect.
 */
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerImage {
    pub taken_at: DateTime<Utc>,
    pub docs: BTreeMap<DocId, DocState>,
    #[serde(flatten)]
    pub commit_log: CommitLog,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    // Not set_extension; the base name is full of dots.
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/**
 * Write the image next to its final location and rename it into place, so a crash part way
 * through never leaves a half written snapshot where recovery will look for it.
 */
pub fn write_snapshot(image: &ServerImage, base: &Path) -> Result<(), PersistError> {
    let tmp = with_suffix(base, ".tmp");
    let dest = with_suffix(base, ".json");

    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, image)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    fs::rename(&tmp, &dest)?;
    Ok(())
}

pub async fn save_snapshot(server: &Server) -> Result<(), PersistError> {
    let image = server.image().await;
    let base = server.config.snapshot_path.clone();
    task::spawn_blocking(move || write_snapshot(&image, &base)).await
}

/** None if there's no snapshot at all, which just means we're starting fresh. */
pub fn load_snapshot(base: &Path) -> Result<Option<ServerImage>, PersistError> {
    let file = match File::open(with_suffix(base, ".json")) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

/**
 * Rebuild the server from the latest snapshot and everything appended to the durable log after it.
 * Replay goes through the same code path as live updates, so it lands in the same state.
 *
 * Edits which were accepted but not yet written when the snapshot was taken go back on the commit
 * log. If they did make it into the durable log they've been replayed already, and the per-user
 * sequence numbers make the second application a no-op.
 */
pub fn recover(config: ServerConfig, store: &dyn LogStore) -> Result<Server, PersistError> {
    let (mut docs, mut commit_log) = match load_snapshot(&config.snapshot_path)? {
        Some(image) => {
            info!("loaded snapshot from {} with {} documents", image.taken_at, image.docs.len());
            (image.docs, image.commit_log)
        },
        None => {
            info!("no snapshot at {}, starting empty", config.snapshot_path.display());
            (BTreeMap::new(), CommitLog::new())
        }
    };

    let end = store.end();
    if commit_log.persisted > end {
        return Err(PersistError::Gap { snapshot: commit_log.persisted, store: end });
    }

    let entries = store.find_since(commit_log.persisted)?;
    for req in &entries {
        docs.entry(req.doc_id)
            .or_insert_with(|| DocState::new(req.doc_id))
            .apply_request(req);
    }

    info!("replayed {} commit log entries, {} edits waiting", entries.len(), commit_log.len());
    commit_log.applied += entries.len() as u64;
    commit_log.persisted = end;

    Ok(Server::from_parts(config, docs, commit_log))
}
