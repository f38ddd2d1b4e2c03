use std::fmt;

use bytes::Bytes;

/// Token the load generator uses to correlate a response with its query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuerySample {
    pub index: usize,
    pub id: QueryId,
}

impl QuerySample {
    pub fn new(index: usize, id: u64) -> Self {
        Self {
            index,
            id: QueryId(id),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryResponse {
    pub id: QueryId,
    /// Little-endian f32 values; empty when the query failed.
    pub payload: Bytes,
}

impl QueryResponse {
    pub fn empty(id: QueryId) -> Self {
        Self {
            id,
            payload: Bytes::new(),
        }
    }
}

/// Completion primitive of the load generator.
///
/// Called synchronously by the thread that executed the item, once per item,
/// with one response per query of that item.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, responses: Vec<QueryResponse>);
}
