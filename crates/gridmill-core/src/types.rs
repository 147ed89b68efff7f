use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerName(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

/// Opaque job reference, unique per client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef(pub String);

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key for the processed-jobs set: a job is identified by the pair of its
/// originating client and its client-unique reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub client: ClientId,
    pub job: JobRef,
}

/// Identity of one supervised calculation, assigned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk request size advertised to clients until `set_num_chunks` changes it.
pub const DEFAULT_NUM_CHUNKS: usize = 4;

/// Retries granted to a crashing worker beyond its initial attempt.
pub const MAX_ATTEMPTS: u32 = 2;

/// Tag marking a permanently failed output element.
pub const CALC_FAIL_MESSAGE: &str = "calc_failed";

/// Reason carried by a failed calculation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CalcError(pub String);

impl CalcError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Side-effect hook; `None` in the surrounding `Option` is the empty sentinel.
pub type HookFn = Arc<dyn Fn() + Send + Sync>;

/// Per-datum user calculation.
pub type CalcFn<T> = Arc<dyn Fn(&T) -> Result<T, CalcError> + Send + Sync>;

/// The `(pre, calc, post)` function triple carried by every chunk.
pub struct ChunkFuncs<T> {
    pub pre: Option<HookFn>,
    pub calc: CalcFn<T>,
    pub post: Option<HookFn>,
}

impl<T> ChunkFuncs<T> {
    pub fn new(calc: CalcFn<T>) -> Self {
        Self {
            pre: None,
            calc,
            post: None,
        }
    }

    pub fn with_pre(mut self, pre: HookFn) -> Self {
        self.pre = Some(pre);
        self
    }

    pub fn with_post(mut self, post: HookFn) -> Self {
        self.post = Some(post);
        self
    }
}

impl<T> Clone for ChunkFuncs<T> {
    fn clone(&self) -> Self {
        Self {
            pre: self.pre.clone(),
            calc: self.calc.clone(),
            post: self.post.clone(),
        }
    }
}

impl<T> fmt::Debug for ChunkFuncs<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkFuncs")
            .field("pre", &self.pre.as_ref().map(|_| "fn"))
            .field("post", &self.post.as_ref().map(|_| "fn"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("client id must be non-empty")]
    EmptyClient,
    #[error("job ref must be non-empty")]
    EmptyJobRef,
    #[error("chunk data must be non-empty")]
    EmptyData,
}

/// The unit of work. Immutable once received; cloning shares the data.
#[derive(Debug)]
pub struct Chunk<T> {
    pub client: ClientId,
    pub job: JobRef,
    pub seq: u64,
    pub funcs: ChunkFuncs<T>,
    pub data: Arc<[T]>,
}

impl<T> Chunk<T> {
    pub fn new(client: ClientId, job: JobRef, seq: u64, funcs: ChunkFuncs<T>, data: Vec<T>) -> Self {
        Self {
            client,
            job,
            seq,
            funcs,
            data: Arc::from(data),
        }
    }

    pub fn job_key(&self) -> JobKey {
        JobKey {
            client: self.client.clone(),
            job: self.job.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.client.0.trim().is_empty() {
            return Err(ChunkError::EmptyClient);
        }
        if self.job.0.trim().is_empty() {
            return Err(ChunkError::EmptyJobRef);
        }
        if self.data.is_empty() {
            return Err(ChunkError::EmptyData);
        }
        Ok(())
    }
}

impl<T> Clone for Chunk<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            job: self.job.clone(),
            seq: self.seq,
            funcs: self.funcs.clone(),
            data: self.data.clone(),
        }
    }
}

/// One element of an output chunk: either the calculator's result or the
/// permanent-failure marker for the corresponding input position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputItem<T> {
    Value(T),
    Failed { reason: String },
}

impl<T> OutputItem<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, OutputItem::Failed { .. })
    }
}

impl<T: fmt::Display> fmt::Display for OutputItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputItem::Value(v) => v.fmt(f),
            OutputItem::Failed { reason } => write!(f, "({CALC_FAIL_MESSAGE}, {reason})"),
        }
    }
}

/// Result of computing one chunk; `data` has the input chunk's length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk<T> {
    pub job: JobRef,
    pub seq: u64,
    pub data: Vec<OutputItem<T>>,
}

impl<T> OutputChunk<T> {
    /// Synthesises the all-failed output for a chunk whose retries are
    /// exhausted, preserving the per-element shape.
    pub fn failure(chunk: &Chunk<T>, reason: &str) -> Self {
        Self {
            job: chunk.job.clone(),
            seq: chunk.seq,
            data: chunk
                .data
                .iter()
                .map(|_| OutputItem::Failed {
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
