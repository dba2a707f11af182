use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use async_std::channel::Receiver;
use async_std::future;
use async_std::sync::{Mutex, RwLock, RwLockReadGuard};
use async_std::task;
use chrono::Utc;
use log::{debug, error, info};

use crate::types::*;
use crate::config::ServerConfig;
use crate::doc_state::DocState;
use crate::commit_log::{CommitLog, LogStore};
use crate::persist::{self, ServerImage};

pub type DocMap = BTreeMap<DocId, Mutex<DocState>>;

/**
 * All server state. Sessions and the updater share one of these through an `Arc`.
 *
 * Lock order is always documents, then a single document, then the commit log. Holding the
 * document map for reading is enough to work on one document; adding a document or taking a
 * snapshot needs it for writing.
 */
#[derive(Debug)]
pub struct Server {
    docs: RwLock<DocMap>,
    commit_log: Mutex<CommitLog>,
    pub(crate) config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::from_parts(config, BTreeMap::new(), CommitLog::new())
    }

    pub(crate) fn from_parts(config: ServerConfig, docs: BTreeMap<DocId, DocState>, commit_log: CommitLog) -> Self {
        Server {
            docs: RwLock::new(docs.into_iter().map(|(id, d)| (id, Mutex::new(d))).collect()),
            commit_log: Mutex::new(commit_log),
            config,
        }
    }

    /** Create the document if it doesn't exist yet. Returns true if it was created. */
    pub async fn ensure_document(&self, id: DocId) -> bool {
        if self.docs.read().await.contains_key(&id) { return false; }

        match self.docs.write().await.entry(id) {
            Entry::Vacant(e) => {
                e.insert(Mutex::new(DocState::new(id)));
                true
            },
            Entry::Occupied(_) => false,
        }
    }

    pub(crate) async fn docs(&self) -> RwLockReadGuard<'_, DocMap> {
        self.docs.read().await
    }

    pub async fn document(&self, id: DocId) -> Option<Document> {
        let docs = self.docs.read().await;
        match docs.get(&id) {
            Some(doc) => Some(doc.lock().await.document().clone()),
            None => None,
        }
    }

    /**
     * Queue an accepted edit. Returns false if the commit log is already holding as many edits as
     * we're willing to buffer.
     */
    pub(crate) async fn enqueue(&self, req: EditRequest) -> bool {
        let mut log = self.commit_log.lock().await;
        if log.len() >= self.config.max_pending { return false; }
        log.push(req);
        true
    }

    pub(crate) async fn pending(&self) -> usize {
        self.commit_log.lock().await.len()
    }

    /// Apply requests in order, creating documents as needed. Returns the number of batches which
    /// landed.
    async fn apply_all(&self, reqs: &[EditRequest]) -> usize {
        let mut applied = 0;
        for req in reqs {
            self.ensure_document(req.doc_id).await;
            let docs = self.docs.read().await;
            if let Some(doc) = docs.get(&req.doc_id) {
                applied += doc.lock().await.apply_request(req);
            }
        }
        applied
    }

    /**
     * Prune every document's log, keeping whatever queued edits were computed against. Sessions
     * enqueue while holding the document's lock, so nothing older can be queued behind our back.
     */
    async fn prune(&self) -> usize {
        let docs = self.docs.read().await;
        let mut pruned = 0;
        for (id, doc) in docs.iter() {
            let mut doc = doc.lock().await;
            pruned += match self.commit_log.lock().await.oldest_view(*id) {
                Some(keep_from) => doc.prune_keeping(keep_from),
                None => doc.prune(),
            };
        }
        pruned
    }

    /**
     * A consistent copy of the whole server. Holds the document map and the commit log together
     * so nothing can be applied or queued while it's taken.
     */
    pub(crate) async fn image(&self) -> ServerImage {
        let mut docs = self.docs.write().await;
        let log = self.commit_log.lock().await;

        ServerImage {
            taken_at: Utc::now(),
            docs: docs.iter_mut().map(|(id, doc)| (*id, doc.get_mut().clone())).collect(),
            commit_log: log.clone(),
        }
    }
}

/**
 * Drains the commit log on a fixed interval, applies what it finds, writes it to the durable log
 * and now and then snapshots the server.
 */
pub struct Updater {
    server: Arc<Server>,
    /// Only empty while an append is running on the blocking pool.
    store: Option<Box<dyn LogStore>>,
    /// Applied, but the durable log append failed. Retried next cycle.
    unsaved: Vec<EditRequest>,
    cycles: u64,
    snapshot_every: u64,
    last_prune: Instant,
}

impl Updater {
    pub fn new(server: Arc<Server>, store: Box<dyn LogStore>) -> Self {
        Updater {
            snapshot_every: server.config.snapshot_every.max(1),
            store: Some(store),
            unsaved: Vec::new(),
            cycles: 0,
            last_prune: Instant::now(),
            server,
        }
    }

    /**
     * Cycle until `stop` receives a message or every sender is dropped, then shut down cleanly.
     */
    pub async fn run(mut self, stop: Receiver<()>) {
        let interval = self.server.config.update_interval;
        while future::timeout(interval, stop.recv()).await.is_err() {
            self.cycle().await;
        }
        self.shutdown().await;
    }

    /** Drain whatever is still queued and leave a snapshot behind. */
    pub async fn shutdown(mut self) {
        self.cycle().await;
        if self.unsaved.is_empty() {
            self.snapshot().await;
        } else {
            error!("shutting down with {} requests missing from the commit log", self.unsaved.len());
        }
    }

    /** One update cycle. Returns the number of batches applied. */
    pub async fn cycle(&mut self) -> usize {
        let (drained, total) = {
            let mut log = self.server.commit_log.lock().await;
            let drained = log.drain();
            log.applied += drained.len() as u64;
            (drained, log.applied)
        };

        let applied = self.server.apply_all(&drained).await;
        if !drained.is_empty() {
            debug!("applied {} batches from {} requests ({} requests so far)", applied, drained.len(), total);
        }

        self.unsaved.extend(drained);
        self.persist().await;

        self.cycles += 1;
        if self.cycles % self.snapshot_every == 0 {
            self.snapshot().await;
        }

        if self.last_prune.elapsed() >= self.server.config.prune_interval {
            let pruned = self.server.prune().await;
            debug!("pruned {} log entries", pruned);
            self.last_prune = Instant::now();
        }

        applied
    }

    async fn persist(&mut self) {
        if self.unsaved.is_empty() { return; }
        let mut store = match self.store.take() {
            Some(store) => store,
            None => return,
        };

        let reqs = mem::take(&mut self.unsaved);
        let (store, reqs, result) = task::spawn_blocking(move || {
            let result = store.append(&reqs);
            (store, reqs, result)
        }).await;
        self.store = Some(store);

        match result {
            Ok(marker) => self.server.commit_log.lock().await.persisted = marker,
            Err(e) => {
                error!("could not write {} requests to the commit log: {}", reqs.len(), e);
                self.unsaved = reqs;
            },
        }
    }

    async fn snapshot(&mut self) {
        // The snapshot's marker would run ahead of what's actually durable.
        if !self.unsaved.is_empty() { return; }

        match persist::save_snapshot(&self.server).await {
            Ok(()) => info!("saved snapshot to {}", self.server.config.snapshot_path.display()),
            Err(e) => error!("snapshot failed ({:?}): {}", e.severity(), e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use async_std::channel;
    use crate::commit_log::MemLogStore;
    use crate::ot::diff;

    fn edit(doc_id: DocId, user: &str, session: SessionId, seq: Seq, view: View, from: &[u8], to: &[u8]) -> EditRequest {
        EditRequest {
            doc_id,
            user_id: user.to_string(),
            view,
            seq,
            ops: vec![Batch {
                user: user.to_string(),
                session,
                seq,
                view,
                ops: diff(from, to),
            }],
        }
    }

    fn updater(server: &Arc<Server>) -> Updater {
        Updater::new(server.clone(), Box::new(MemLogStore::new()))
    }

    #[async_std::test]
    async fn cycle_applies_and_persists() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let mut updater = updater(&server);

        assert!(server.enqueue(edit(7, "seph", 1, 0, 0, b"", b"hello")).await);
        assert_eq!(server.pending().await, 1);
        // Queued is not applied.
        assert_eq!(server.document(7).await, None);

        assert_eq!(updater.cycle().await, 1);
        assert_eq!(server.pending().await, 0);
        let doc = server.document(7).await.unwrap();
        assert_eq!(doc.body, b"hello".to_vec());
        assert_eq!(doc.view, 1);

        assert_eq!(updater.store.as_ref().unwrap().end(), 1);
        let log = server.commit_log.lock().await;
        assert_eq!(log.persisted, 1);
        assert_eq!(log.applied, 1);
    }

    #[async_std::test]
    async fn commit_log_is_bounded() {
        let config = ServerConfig { max_pending: 1, ..ServerConfig::default() };
        let server = Server::new(config);
        assert!(server.enqueue(edit(1, "a", 1, 0, 0, b"", b"x")).await);
        assert!(!server.enqueue(edit(1, "a", 1, 1, 0, b"", b"y")).await);
        assert_eq!(server.pending().await, 1);
    }

    #[async_std::test]
    async fn ensure_document_only_creates_once() {
        let server = Server::new(ServerConfig::default());
        assert!(server.ensure_document(3).await);
        assert!(!server.ensure_document(3).await);
        assert_eq!(server.document(3).await.unwrap().view, 0);
    }

    #[async_std::test]
    async fn image_captures_pending_edits() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let mut updater = updater(&server);
        server.enqueue(edit(1, "a", 1, 0, 0, b"", b"ab")).await;
        updater.cycle().await;
        server.enqueue(edit(1, "a", 1, 1, 1, b"ab", b"abc")).await;

        let image = server.image().await;
        assert_eq!(image.docs[&1].body(), b"ab");
        assert_eq!(image.commit_log.pending().len(), 1);
        assert_eq!(image.commit_log.persisted, 1);
    }

    #[async_std::test]
    async fn pruning_keeps_views_queued_edits_need() {
        let config = ServerConfig { prune_interval: Duration::ZERO, ..ServerConfig::default() };
        let server = Arc::new(Server::new(config));
        let mut updater = updater(&server);

        // Applied, then marked for discarding by the same cycle's prune.
        server.enqueue(edit(1, "setup", 1, 0, 0, b"", b"abc")).await;
        updater.cycle().await;

        // Accepted against view 0 while that entry is still in the window.
        assert!(server.enqueue(edit(1, "seph", 2, 0, 0, b"", b"x")).await);
        assert_eq!(server.prune().await, 0);

        updater.cycle().await;
        let doc = server.document(1).await.unwrap();
        assert_eq!(doc.body, b"abcx".to_vec());
        assert_eq!(doc.view, 2);

        // Nothing waiting any more, so the old entries go.
        assert_eq!(server.prune().await, 1);
    }

    #[async_std::test]
    async fn zero_snapshot_every_still_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_every: 0,
            snapshot_path: dir.path().join("snapshot"),
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config));
        let mut updater = updater(&server);

        server.enqueue(edit(4, "a", 1, 0, 0, b"", b"z")).await;
        assert_eq!(updater.cycle().await, 1);
        assert!(persist::load_snapshot(&server.config.snapshot_path).unwrap().is_some());
    }

    #[async_std::test]
    async fn run_stops_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            update_interval: Duration::from_secs(3600),
            snapshot_path: dir.path().join("snapshot"),
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config));
        server.enqueue(edit(2, "a", 1, 0, 0, b"", b"bye")).await;

        let (stop, stopped) = channel::bounded(1);
        let handle = task::spawn(updater(&server).run(stopped));
        drop(stop);
        handle.await;

        assert_eq!(server.document(2).await.unwrap().body, b"bye".to_vec());
        let image = persist::load_snapshot(&server.config.snapshot_path).unwrap().unwrap();
        assert_eq!(image.docs[&2].body(), b"bye");
        assert_eq!(image.commit_log.persisted, 1);
    }
}
