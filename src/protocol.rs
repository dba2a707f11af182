use serde::{Deserialize, Serialize};
use crate::types::*;

/**
 * Messages sent by clients over a session. The query is how clients poll for changes; edits carry
 * one or more batches, each with its own sequence number.
 */
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Query { view: View },
    Edit(EditRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// The submission was queued. Carries the last sequence number accepted.
    Ack { seq: Seq },
    /// Sent when the client is too far behind for the log to bring it up to date.
    DocSnapshot {
        view: View,
        seq: Seq,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    /// Every batch applied since the client's view, oldest first.
    OpsSince { view: View, seq: Seq, ops: Vec<Batch> },
    Error { view: View, seq: Seq, reason: String },
}

impl Response {
    pub(crate) fn error(view: View, seq: Seq, reason: impl Into<String>) -> Self {
        Response::Error { view, seq, reason: reason.into() }
    }

    pub(crate) fn snapshot(doc: &Document, seq: Seq) -> Self {
        Response::DocSnapshot { view: doc.view, seq, body: doc.body.clone() }
    }
}

/// Document bodies are arbitrary bytes, so they go over JSON as base64.
pub(crate) mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde::de::Error;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

pub(crate) fn decode_request(text: &str) -> serde_json::Result<Request> {
    serde_json::from_str(text)
}

pub(crate) fn encode_response(res: &Response) -> serde_json::Result<String> {
    serde_json::to_string(res)
}
