use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use gridmill_core::types::{Chunk, ClientId, HookFn, JobRef, OutputChunk, ServerName};

/// Inbound surface of a server coordinator as seen by clients and the
/// registry. All sends are fire-and-forget.
pub trait ServerPort<T>: Send + Sync {
    fn server_name(&self) -> &ServerName;

    /// The client announces it has work available.
    fn client_data(&self, client: ClientHandle<T>);

    /// Batch delivery in response to a `send_chunks` pull request.
    fn process_chunks(&self, load: ChunkLoad<T>);

    /// The client has completed job `job`; `post` is its cleanup hook.
    fn job_cleanup(&self, client: ClientId, job: JobRef, post: Option<HookFn>);
}

/// An ordered batch of chunks delivered in one `process_chunks` message.
pub struct ChunkLoad<T> {
    pub client: ClientHandle<T>,
    pub chunks: Vec<Chunk<T>>,
}

impl<T> ChunkLoad<T> {
    pub fn new(client: ClientHandle<T>, chunks: Vec<Chunk<T>>) -> Self {
        Self { client, chunks }
    }
}

impl<T: fmt::Debug> fmt::Debug for ChunkLoad<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkLoad")
            .field("client", self.client.id())
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// What a client coordinator receives from servers.
pub enum ClientEvent<T> {
    /// A server joined the cluster and is ready to pull work.
    ServerUp { server: Arc<dyn ServerPort<T>> },
    /// Pull request: deliver up to `count` chunks via `process_chunks`.
    SendChunks {
        server: Arc<dyn ServerPort<T>>,
        count: usize,
    },
    /// A computed (or permanently failed) output chunk.
    CalcDone {
        server: ServerName,
        chunk: OutputChunk<T>,
    },
}

impl<T: fmt::Debug> fmt::Debug for ClientEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::ServerUp { server } => f
                .debug_struct("ServerUp")
                .field("server", server.server_name())
                .finish(),
            ClientEvent::SendChunks { server, count } => f
                .debug_struct("SendChunks")
                .field("server", server.server_name())
                .field("count", count)
                .finish(),
            ClientEvent::CalcDone { server, chunk } => f
                .debug_struct("CalcDone")
                .field("server", server)
                .field("chunk", chunk)
                .finish(),
        }
    }
}

/// Address of a client coordinator: its identity plus the mailbox servers
/// deliver `ClientEvent`s to. Cheap to clone.
pub struct ClientHandle<T> {
    id: ClientId,
    tx: mpsc::UnboundedSender<ClientEvent<T>>,
}

impl<T> ClientHandle<T> {
    pub fn new(id: ClientId) -> (Self, mpsc::UnboundedReceiver<ClientEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn server_up(&self, server: Arc<dyn ServerPort<T>>) {
        self.deliver(ClientEvent::ServerUp { server });
    }

    pub fn send_chunks(&self, server: Arc<dyn ServerPort<T>>, count: usize) {
        self.deliver(ClientEvent::SendChunks { server, count });
    }

    pub fn calc_done(&self, server: ServerName, chunk: OutputChunk<T>) {
        self.deliver(ClientEvent::CalcDone { server, chunk });
    }

    fn deliver(&self, event: ClientEvent<T>) {
        if self.tx.send(event).is_err() {
            warn!(client = %self.id, "client mailbox closed; dropping event");
        }
    }
}

impl<T> Clone for ClientHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for ClientHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
