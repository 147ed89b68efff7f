use std::collections::VecDeque;

use gridmill_cluster::ClientHandle;
use gridmill_core::types::Chunk;

/// A chunk selected for execution together with the client it came from.
pub struct Assignment<T> {
    pub client: ClientHandle<T>,
    pub chunk: Chunk<T>,
}

/// Outcome of one dispatcher walk: the selected chunks plus the clients whose
/// batch just drained and should be asked for more.
pub struct Dispatch<T> {
    pub assignments: Vec<Assignment<T>>,
    pub refills: Vec<ClientHandle<T>>,
}

struct BatchEntry<T> {
    client: ClientHandle<T>,
    chunks: VecDeque<Chunk<T>>,
}

/// Ordered sequence of pending chunk batches, one entry per arrival.
///
/// New batches are prepended, but `take` rotates surviving batches to the
/// tail after each pop, so concurrent jobs interleave at chunk granularity
/// regardless of batch size.
pub struct Backlog<T> {
    batches: VecDeque<BatchEntry<T>>,
}

impl<T> Backlog<T> {
    pub fn new() -> Self {
        Self {
            batches: VecDeque::new(),
        }
    }

    pub fn push_load(&mut self, client: ClientHandle<T>, chunks: Vec<Chunk<T>>) {
        if chunks.is_empty() {
            return;
        }
        self.batches.push_front(BatchEntry {
            client,
            chunks: chunks.into(),
        });
    }

    pub fn chunk_count(&self) -> usize {
        self.batches.iter().map(|b| b.chunks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.chunks.is_empty())
    }

    /// Pulls up to `n` chunks round-robin across batches.
    ///
    /// Head batch gives up its head chunk; a batch that still has chunks is
    /// rotated to the tail, a batch drained by the pop is dropped and its
    /// client recorded for a refill request.
    pub fn take(&mut self, n: usize) -> Dispatch<T> {
        let mut out = Dispatch {
            assignments: Vec::new(),
            refills: Vec::new(),
        };
        while out.assignments.len() < n {
            let Some(mut entry) = self.batches.pop_front() else {
                break;
            };
            let Some(chunk) = entry.chunks.pop_front() else {
                continue;
            };
            let client = entry.client.clone();
            if entry.chunks.is_empty() {
                out.refills.push(entry.client);
            } else {
                self.batches.push_back(entry);
            }
            out.assignments.push(Assignment { client, chunk });
        }
        out
    }
}

impl<T> Default for Backlog<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridmill_core::types::{CalcFn, ChunkFuncs, ClientId, JobRef};

    use super::*;

    fn chunk(client: &ClientHandle<i64>, job: &str, seq: u64) -> Chunk<i64> {
        let calc: CalcFn<i64> = Arc::new(|v| Ok(*v));
        Chunk::new(
            client.id().clone(),
            JobRef(job.to_string()),
            seq,
            ChunkFuncs::new(calc),
            vec![seq as i64],
        )
    }

    fn client(id: &str) -> ClientHandle<i64> {
        ClientHandle::new(ClientId(id.to_string())).0
    }

    fn tags(dispatch: &Dispatch<i64>) -> Vec<(String, u64)> {
        dispatch
            .assignments
            .iter()
            .map(|a| (a.chunk.job.0.clone(), a.chunk.seq))
            .collect()
    }

    #[test]
    fn take_on_empty_backlog_is_empty() {
        let mut backlog: Backlog<i64> = Backlog::new();
        let d = backlog.take(4);
        assert!(d.assignments.is_empty());
        assert!(d.refills.is_empty());
    }

    #[test]
    fn interleaves_two_jobs_chunk_by_chunk() {
        let c = client("c1");
        let mut backlog = Backlog::new();
        backlog.push_load(
            c.clone(),
            (0..3).map(|i| chunk(&c, "job-a", i)).collect(),
        );
        backlog.push_load(
            c.clone(),
            (0..3).map(|i| chunk(&c, "job-b", i)).collect(),
        );

        let d = backlog.take(6);
        assert_eq!(
            tags(&d),
            vec![
                ("job-b".to_string(), 0),
                ("job-a".to_string(), 0),
                ("job-b".to_string(), 1),
                ("job-a".to_string(), 1),
                ("job-b".to_string(), 2),
                ("job-a".to_string(), 2),
            ]
        );
        assert_eq!(d.refills.len(), 2);
        assert!(backlog.is_empty());
    }

    #[test]
    fn draining_a_batch_records_a_refill() {
        let c = client("c1");
        let mut backlog = Backlog::new();
        backlog.push_load(
            c.clone(),
            (0..4).map(|i| chunk(&c, "job-a", i)).collect(),
        );

        let d = backlog.take(4);
        assert_eq!(d.assignments.len(), 4);
        assert_eq!(d.refills.len(), 1);
        assert_eq!(d.refills[0].id(), c.id());
    }

    #[test]
    fn partial_take_rotates_but_does_not_refill() {
        let c = client("c1");
        let mut backlog = Backlog::new();
        backlog.push_load(
            c.clone(),
            (0..4).map(|i| chunk(&c, "job-a", i)).collect(),
        );

        let d = backlog.take(2);
        assert_eq!(d.assignments.len(), 2);
        assert!(d.refills.is_empty());
        assert_eq!(backlog.chunk_count(), 2);
    }

    #[test]
    fn empty_load_is_ignored() {
        let c = client("c1");
        let mut backlog: Backlog<i64> = Backlog::new();
        backlog.push_load(c, vec![]);
        assert!(backlog.is_empty());
        assert_eq!(backlog.chunk_count(), 0);
    }
}
