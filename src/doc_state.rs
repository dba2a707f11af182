use std::collections::{BTreeMap, VecDeque};
use serde::{Deserialize, Serialize};
use log::warn;

use crate::types::*;
use crate::error::ApplyError;
use crate::ot::{apply, transform};

/**
 * Everything the server knows about one document. This is the persisted shape; the server wraps
 * it in a mutex, which is what keeps two batches for the same document from applying at once.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocState {
    pub(crate) doc: Document,

    /// Applied batches, oldest first. The batch which took the document from view `v` to `v + 1`
    /// lives at `log[log.len() - (view - v)]`.
    log: VecDeque<Batch>,

    /// The next sequence number we expect each user to submit.
    next_seq: BTreeMap<UserId, Seq>,
    /// Everything below this has been applied.
    applied_seq: BTreeMap<UserId, Seq>,

    /// How many log entries the next prune will throw away.
    next_discard: usize,
}

impl DocState {
    pub fn new(id: DocId) -> Self {
        DocState {
            doc: Document::new(id),
            log: VecDeque::new(),
            next_seq: BTreeMap::new(),
            applied_seq: BTreeMap::new(),
            next_discard: 0,
        }
    }

    pub fn view(&self) -> View { self.doc.view }

    pub fn body(&self) -> &[u8] { &self.doc.body }

    pub fn document(&self) -> &Document { &self.doc }

    /// The oldest view we can still produce deltas from.
    pub fn window_start(&self) -> View {
        self.doc.view - self.log.len() as View
    }

    pub fn next_seq(&self, user: &str) -> Seq {
        self.next_seq.get(user).copied().unwrap_or(0)
    }

    pub fn applied_seq(&self, user: &str) -> Seq {
        self.applied_seq.get(user).copied().unwrap_or(0)
    }

    pub(crate) fn set_next_seq(&mut self, user: &str, seq: Seq) {
        self.next_seq.insert(user.to_string(), seq);
    }

    /**
     * The batches which take a client from `view` to the current view. None if `view` fell out of
     * the log window (or is in the future).
     */
    pub fn ops_since(&self, view: View) -> Option<Vec<Batch>> {
        if view > self.doc.view || view < self.window_start() { return None; }
        let start = (view - self.window_start()) as usize;
        Some(self.log.range(start..).cloned().collect())
    }

    /**
     * Apply one batch, transforming it past everything concurrent which has landed since the view
     * it was computed against.
     */
    pub fn apply_batch(&mut self, batch: &Batch) -> Result<(), ApplyError> {
        let current = self.doc.view;
        if batch.view > current {
            return Err(ApplyError::FutureView { view: batch.view, current });
        }
        let oldest = self.window_start();
        if batch.view < oldest {
            return Err(ApplyError::StaleView { view: batch.view, oldest });
        }

        let start = (batch.view - oldest) as usize;
        let mut ops = batch.ops.clone();
        for prior in self.log.range(start..) {
            if !prior.same_author(batch) {
                ops = transform(&prior.ops, &ops);
            }
        }

        let body = apply(&self.doc.body, &ops)?;

        self.doc.body = body;
        self.log.push_back(Batch {
            view: current,
            ops,
            ..batch.clone()
        });
        self.doc.view += 1;
        Ok(())
    }

    /**
     * Apply every batch in the request which hasn't been applied yet. Batches below the user's
     * applied sequence number were already handled by an earlier submission and are skipped.
     *
     * A batch which can't be applied is logged and dropped, but it still counts as consumed. That
     * keeps replay from the durable log deterministic.
     */
    pub fn apply_request(&mut self, req: &EditRequest) -> usize {
        let mut applied = 0;

        for batch in &req.ops {
            let user = batch.user.as_str();
            if batch.seq < self.applied_seq(user) { continue; }

            match self.apply_batch(batch) {
                Ok(()) => applied += 1,
                Err(e) => warn!("doc {}: dropping batch {} from {}: {}", self.doc.id, batch.seq, user, e),
            }

            let next = batch.seq + 1;
            self.applied_seq.insert(user.to_string(), next);
            if self.next_seq(user) < next {
                self.set_next_seq(user, next);
            }
        }

        applied
    }

    /**
     * Throw away whatever was marked for discarding last time, then mark everything currently in
     * the log. Entries therefore survive for at least one prune interval.
     */
    pub fn prune(&mut self) -> usize {
        self.prune_keeping(View::MAX)
    }

    /**
     * Like `prune`, but never drops the entries from `keep_from` onwards. Edits already queued
     * against those views still need them to transform.
     */
    pub fn prune_keeping(&mut self, keep_from: View) -> usize {
        let keep_from = keep_from.max(self.window_start());
        let bound = (keep_from - self.window_start()) as usize;
        let n = self.next_discard.min(self.log.len()).min(bound);
        self.log.drain(..n);
        self.next_discard = self.log.len();
        n
    }

    #[cfg(test)]
    pub(crate) fn log_len(&self) -> usize { self.log.len() }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ot::diff;

    fn batch(user: &str, session: SessionId, seq: Seq, view: View, from: &[u8], to: &[u8]) -> Batch {
        Batch {
            user: user.to_string(),
            session,
            seq,
            view,
            ops: diff(from, to),
        }
    }

    fn request(batches: Vec<Batch>) -> EditRequest {
        let first = &batches[0];
        EditRequest {
            doc_id: 1,
            user_id: first.user.clone(),
            view: first.view,
            seq: first.seq,
            ops: batches,
        }
    }

    fn doc_with(body: &[u8]) -> DocState {
        let mut doc = DocState::new(1);
        doc.apply_batch(&batch("setup", 0, 0, 0, b"", body)).unwrap();
        doc
    }

    #[test]
    fn applying_bumps_view_and_logs() {
        let mut doc = DocState::new(1);
        doc.apply_batch(&batch("seph", 1, 0, 0, b"", b"hi")).unwrap();
        assert_eq!(doc.body(), b"hi");
        assert_eq!(doc.view(), 1);
        assert_eq!(doc.window_start(), 0);

        let since = doc.ops_since(0).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].view, 0);
        assert_eq!(doc.ops_since(1).unwrap(), vec![]);
        assert_eq!(doc.ops_since(2), None);
    }

    #[test]
    fn concurrent_batches_are_transformed() {
        for a_first in [true, false] {
            let mut doc = doc_with(b"abcdef");
            let a = batch("alice", 1, 0, 1, b"abcdef", b"adf");
            let b = batch("bob", 2, 0, 1, b"abcdef", b"acf");

            let order = if a_first { [&a, &b] } else { [&b, &a] };
            for x in order.iter() {
                doc.apply_batch(x).unwrap();
            }
            assert_eq!(doc.body(), b"af");
            assert_eq!(doc.view(), 3);
        }
    }

    #[test]
    fn same_session_batches_are_not_transformed() {
        let mut doc = doc_with(b"sad");
        // Both computed locally, the second on top of the first, before either was acked.
        doc.apply_batch(&batch("seph", 5, 0, 1, b"sad", b"esad")).unwrap();
        doc.apply_batch(&batch("seph", 5, 1, 1, b"esad", b"esade")).unwrap();
        assert_eq!(doc.body(), b"esade");
    }

    #[test]
    fn rejects_views_outside_the_window() {
        let mut doc = doc_with(b"abc");
        assert_eq!(doc.apply_batch(&batch("a", 1, 0, 5, b"abc", b"ab")),
                   Err(ApplyError::FutureView { view: 5, current: 1 }));

        doc.prune();
        doc.prune();
        assert_eq!(doc.window_start(), 1);
        assert_eq!(doc.apply_batch(&batch("a", 1, 0, 0, b"", b"x")),
                   Err(ApplyError::StaleView { view: 0, oldest: 1 }));
        assert_eq!(doc.ops_since(0), None);
    }

    #[test]
    fn prune_keeps_entries_for_one_round() {
        let mut doc = doc_with(b"a");
        doc.apply_batch(&batch("x", 1, 0, 1, b"a", b"ab")).unwrap();

        assert_eq!(doc.prune(), 0);
        assert_eq!(doc.log_len(), 2);

        doc.apply_batch(&batch("x", 1, 1, 2, b"ab", b"abc")).unwrap();
        assert_eq!(doc.prune(), 2);
        assert_eq!(doc.log_len(), 1);
        assert_eq!(doc.window_start(), 2);
        assert_eq!(doc.view(), 3);
        assert_eq!(doc.ops_since(2).unwrap().len(), 1);
    }

    #[test]
    fn prune_spares_views_still_in_use() {
        let mut doc = doc_with(b"a");
        doc.apply_batch(&batch("x", 1, 0, 1, b"a", b"ab")).unwrap();
        doc.prune();

        // Something queued at view 1 still needs the second entry.
        assert_eq!(doc.prune_keeping(1), 1);
        assert_eq!(doc.window_start(), 1);
        assert!(doc.ops_since(1).is_some());

        // Spared for as long as that edit is waiting.
        assert_eq!(doc.prune_keeping(1), 0);
        assert_eq!(doc.prune(), 1);
        assert_eq!(doc.window_start(), 2);
    }

    #[test]
    fn resubmitted_batches_apply_once() {
        let mut doc = DocState::new(1);
        let b0 = batch("seph", 1, 0, 0, b"", b"a");
        let b1 = batch("seph", 1, 1, 0, b"a", b"ab");

        assert_eq!(doc.apply_request(&request(vec![b0.clone()])), 1);
        assert_eq!(doc.applied_seq("seph"), 1);

        // The client never saw the first ack and sends both again.
        assert_eq!(doc.apply_request(&request(vec![b0, b1])), 1);
        assert_eq!(doc.body(), b"ab");
        assert_eq!(doc.view(), 2);
        assert_eq!(doc.applied_seq("seph"), 2);
        assert_eq!(doc.next_seq("seph"), 2);
    }

    #[test]
    fn applied_seq_never_goes_backwards() {
        let mut doc = DocState::new(1);
        let mut last = 0;
        for (seq, body) in [(0, "a"), (1, "ab"), (0, "zzz"), (2, "abc"), (1, "q")] {
            let prev = String::from_utf8(doc.body().to_vec()).unwrap();
            let b = batch("u", 1, seq, doc.view(), prev.as_bytes(), body.as_bytes());
            doc.apply_request(&request(vec![b]));
            assert!(doc.applied_seq("u") >= last);
            last = doc.applied_seq("u");
        }
        assert_eq!(doc.body(), b"abc");
        assert_eq!(last, 3);
    }

    #[test]
    fn unappliable_batches_are_consumed() {
        let mut doc = doc_with(b"ab");
        let bad = Batch {
            user: "u".into(),
            session: 1,
            seq: 0,
            view: 1,
            ops: vec![Op::delete(9, b'x')],
        };
        assert_eq!(doc.apply_request(&request(vec![bad])), 0);
        assert_eq!(doc.body(), b"ab");
        assert_eq!(doc.view(), 1);
        assert_eq!(doc.applied_seq("u"), 1);
    }
}
