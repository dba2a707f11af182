use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_std::channel::Sender;
use async_std::future;
use async_std::prelude::*;
use async_std::stream::Stream;
use async_std::task;
use log::{debug, warn};

use crate::types::*;
use crate::protocol::{Request, Response};
use crate::error::FrameError;
use crate::server::Server;

/**
 * One client connected to one document. Each inbound message is handled on its own task, so
 * several can be in flight at once; they only meet at the document's lock.
 */
#[derive(Debug)]
pub struct Session {
    server: Arc<Server>,
    doc_id: DocId,
    user: UserId,
    alive: AtomicBool,
}

/// Checks which only need the request itself.
fn check_shape(req: &EditRequest) -> Result<(), String> {
    if let Some(b) = req.ops.iter().find(|b| !b.is_well_formed()) {
        return Err(format!("batch {} is empty or out of order", b.seq));
    }
    if req.ops[0].seq != req.seq {
        return Err(format!("request seq {} doesn't match its first batch {}", req.seq, req.ops[0].seq));
    }
    if req.ops.windows(2).any(|w| w[1].seq != w[0].seq + 1) {
        return Err("batch sequence numbers must be consecutive".into());
    }
    Ok(())
}

impl Session {
    pub fn new(server: Arc<Server>, doc_id: DocId, user: UserId) -> Self {
        Session { server, doc_id, user, alive: AtomicBool::new(true) }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// After this, anything still waiting to be written to the client is thrown away.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub async fn dispatch(&self, req: Request) -> Option<Response> {
        match req {
            Request::Query { view } => Some(self.handle_query(view).await),
            Request::Edit(edit) => self.handle_edit(edit).await,
        }
    }

    /**
     * Bring the client up to date from `view`: the batches since then if we still have them, or
     * the whole document if not.
     */
    pub async fn handle_query(&self, view: View) -> Response {
        let docs = self.server.docs().await;
        let doc = match docs.get(&self.doc_id) {
            Some(doc) => doc.lock().await,
            None => return Response::error(0, 0, format!("no document {}", self.doc_id)),
        };

        let seq = doc.next_seq(&self.user);
        if view > doc.view() {
            return Response::error(doc.view(), seq, format!("view {} is ahead of the document", view));
        }

        match doc.ops_since(view) {
            Some(ops) => Response::OpsSince { view: doc.view(), seq, ops },
            None => Response::snapshot(doc.document(), seq),
        }
    }

    /**
     * Validate an edit and put it on the commit log. The ack only means the edit is queued; it's
     * applied on the updater's next cycle.
     */
    pub async fn handle_edit(&self, mut req: EditRequest) -> Option<Response> {
        if req.ops.is_empty() { return None; }

        // Identity comes from the connection, not from whatever the client claims.
        req.doc_id = self.doc_id;
        req.user_id = self.user.clone();
        for batch in req.ops.iter_mut() {
            batch.user = self.user.clone();
        }

        let docs = self.server.docs().await;
        let mut doc = match docs.get(&self.doc_id) {
            Some(doc) => doc.lock().await,
            None => return Some(Response::error(0, 0, format!("no document {}", self.doc_id))),
        };

        let next = doc.next_seq(&self.user);
        let view = doc.view();

        if let Err(reason) = check_shape(&req) {
            return Some(Response::error(view, next, reason));
        }
        if req.seq > next {
            return Some(Response::error(view, next, format!("seq {} skips ahead of {}", req.seq, next)));
        }

        let oldest = req.ops.iter().map(|b| b.view).fold(req.view, View::min);
        let newest = req.ops.iter().map(|b| b.view).fold(req.view, View::max);
        if newest > view {
            return Some(Response::error(view, next, format!("view {} is ahead of the document", newest)));
        }
        if oldest < doc.window_start() {
            // Too old to transform. The client has to rebase on the current document and resend.
            return Some(Response::snapshot(doc.document(), next));
        }

        let last = req.ops[req.ops.len() - 1].seq;
        if last >= next {
            if !self.server.enqueue(req).await {
                return Some(Response::error(view, next, "too many edits waiting, try again"));
            }
            doc.set_next_seq(&self.user, last + 1);
        }

        Some(Response::Ack { seq: last })
    }

    /**
     * Read requests until the connection fails, times out or sends something we can't parse. Each
     * request is handled on its own task and its response goes to `outbound`, which the writer
     * side drains.
     */
    pub async fn serve<S>(self: Arc<Self>, mut incoming: S, outbound: Sender<Response>)
        where S: Stream<Item = Result<Request, FrameError>> + Unpin
    {
        let read_timeout = self.server.config.read_timeout;

        while self.is_alive() {
            let req = match future::timeout(read_timeout, incoming.next()).await {
                Err(_) => {
                    debug!("doc {}: {} timed out", self.doc_id, self.user);
                    break;
                },
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("doc {}: dropping {}: {}", self.doc_id, self.user, e);
                    break;
                },
                Ok(Some(Ok(req))) => req,
            };

            let session = self.clone();
            let outbound = outbound.clone();
            task::spawn(async move {
                if let Some(res) = session.dispatch(req).await {
                    if session.is_alive() {
                        // The writer may have gone away already. Nothing to do about that.
                        let _ = outbound.send(res).await;
                    }
                }
            });
        }

        self.mark_dead();
    }
}
