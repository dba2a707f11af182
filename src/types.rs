use serde::{Deserialize, Serialize};

pub type View = u64;
pub type Seq = u64;
pub type DocId = u64;
pub type SessionId = u64;
/** Opaque user identity handed to us by whatever authenticated the connection. */
pub type UserId = String;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Delete,
    /// A delete which collided with a concurrent delete of the same character.
    NoOp,
}

/**
 * A single character edit. `loc` is an offset into the body the containing batch was computed
 * against, not into the body as it looks after earlier ops in the batch.
 */
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub loc: usize,
    /// Inserted byte. For deletes this is the byte being removed, which is only useful for
    /// debugging.
    pub ch: u8,
}

impl Op {
    pub fn insert(loc: usize, ch: u8) -> Self {
        Op { kind: OpKind::Insert, loc, ch }
    }

    pub fn delete(loc: usize, ch: u8) -> Self {
        Op { kind: OpKind::Delete, loc, ch }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == OpKind::NoOp
    }
}

/**
 * One edit script, produced by a single client side diff. Batches are applied atomically and each
 * one bumps the document view by exactly one.
 */
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Filled in by the server from the connection identity.
    #[serde(default)]
    pub user: UserId,
    pub session: SessionId,
    pub seq: Seq,
    /// The view this batch was computed against.
    pub view: View,
    pub ops: Vec<Op>,
}

impl Batch {
    /// Batches from the same editing session already account for each other, so they're never
    /// transformed against one another.
    pub fn same_author(&self, other: &Batch) -> bool {
        self.user == other.user && self.session == other.session
    }

    /** Ops must be non-empty and sorted by location, which is what diff produces. */
    pub fn is_well_formed(&self) -> bool {
        !self.ops.is_empty()
            && self.ops.windows(2).all(|w| w[0].loc <= w[1].loc)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    #[serde(with = "crate::protocol::base64_bytes")]
    pub body: Vec<u8>,
    pub view: View,
}

impl Document {
    pub fn new(id: DocId) -> Self {
        Document { id, body: Vec::new(), view: 0 }
    }
}

/**
 * An edit submission from one user. `view` is the oldest view any of the batches were computed
 * against and `seq` is the leading sequence number.
 */
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    #[serde(default)]
    pub doc_id: DocId,
    #[serde(default)]
    pub user_id: UserId,
    pub view: View,
    pub seq: Seq,
    pub ops: Vec<Batch>,
}

impl EditRequest {
    pub fn last_seq(&self) -> Option<Seq> {
        self.ops.last().map(|b| b.seq)
    }
}
