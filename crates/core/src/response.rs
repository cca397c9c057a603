//! Per-node responses and the multi-node aggregate.
//!
//! A `Response` wraps one node's parsed payload; `MultiNodeResponse` composes
//! several of them and yields a globally score-ordered file stream.

use crate::{CountSource, FileMatch, NodeId, SearchPayload, SearchResult};

/// A single node's search outcome, immutable after construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub payload: SearchPayload,
    pub counts: CountSource,
}

impl Response {
    pub fn new(payload: SearchPayload, counts: CountSource) -> Self {
        Self { payload, counts }
    }

    /// A zero-result success. Each call allocates its own value; callers may
    /// mutate the payload they got without affecting anyone else's.
    pub fn empty() -> Self {
        Self::new(
            SearchPayload { result: Some(SearchResult::default()), error: None },
            CountSource::Reported,
        )
    }

    /// A constituent failure as reported by the fan-out layer for a node
    /// that could not be queried. Counts report zero.
    pub fn from_error(message: impl Into<String>) -> Self {
        Self::new(
            SearchPayload { result: None, error: Some(message.into()) },
            CountSource::Reported,
        )
    }

    pub fn is_success(&self) -> bool {
        self.payload.error.is_none()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.payload.error.as_deref()
    }

    pub fn file_count(&self) -> u64 {
        match self.counts {
            CountSource::Reported => self.payload.result.as_ref().map_or(0, |r| r.file_count),
            CountSource::Derived => self.files().len() as u64,
        }
    }

    pub fn match_count(&self) -> u64 {
        match self.counts {
            CountSource::Reported => self.payload.result.as_ref().map_or(0, |r| r.match_count),
            CountSource::Derived => {
                self.files().iter().map(|f| f.line_matches.len() as u64).sum()
            }
        }
    }

    /// Matched files in the backend's (score-descending) order. Slice-backed,
    /// so iteration is restartable.
    pub fn files(&self) -> &[FileMatch] {
        self.payload
            .result
            .as_ref()
            .and_then(|r| r.files.as_deref())
            .unwrap_or(&[])
    }
}

/// Aggregate over one `Response` per queried node. Entry order is the order
/// nodes were targeted and drives every tie-break below.
#[derive(Debug, Clone, Default)]
pub struct MultiNodeResponse {
    responses: Vec<(NodeId, Response)>,
}

impl MultiNodeResponse {
    pub fn new(responses: Vec<(NodeId, Response)>) -> Self {
        Self { responses }
    }

    /// No constituents, successful. Used when a fan-out is skipped entirely.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> &[(NodeId, Response)] {
        &self.responses
    }

    /// True only when every constituent succeeded.
    pub fn is_success(&self) -> bool {
        self.responses.iter().all(|(_, r)| r.is_success())
    }

    /// Message of the first (by entry order) failing constituent.
    pub fn error_message(&self) -> Option<&str> {
        self.responses.iter().find_map(|(_, r)| r.error_message())
    }

    /// Summed across all constituents; failing nodes report zero.
    pub fn file_count(&self) -> u64 {
        self.responses.iter().map(|(_, r)| r.file_count()).sum()
    }

    pub fn match_count(&self) -> u64 {
        self.responses.iter().map(|(_, r)| r.match_count()).sum()
    }

    /// K-way merge of the per-node file lists into one non-increasing-score
    /// sequence. Each node's list is already locally sorted by the backend;
    /// equal scores keep the earlier node entry first, then the original
    /// per-node position. A pure function of the stored responses.
    pub fn files(&self) -> MergedFiles<'_> {
        let lists: Vec<&[FileMatch]> = self.responses.iter().map(|(_, r)| r.files()).collect();
        let heads = vec![0usize; lists.len()];
        MergedFiles { lists, heads }
    }
}

/// Lazy merge iterator over several locally-sorted file lists.
pub struct MergedFiles<'a> {
    lists: Vec<&'a [FileMatch]>,
    heads: Vec<usize>,
}

impl<'a> Iterator for MergedFiles<'a> {
    type Item = &'a FileMatch;

    fn next(&mut self) -> Option<&'a FileMatch> {
        let mut best: Option<(usize, f64)> = None;
        for (li, list) in self.lists.iter().enumerate() {
            let head = self.heads[li];
            if head >= list.len() {
                continue;
            }
            let score = list[head].score;
            // Strictly-greater keeps the earliest list on ties.
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((li, score)),
            }
        }
        let (li, _) = best?;
        let item = &self.lists[li][self.heads[li]];
        self.heads[li] += 1;
        Some(item)
    }
}
