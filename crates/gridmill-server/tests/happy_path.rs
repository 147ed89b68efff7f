use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use gridmill_cluster::{ChunkLoad, ClientEvent, ClientHandle, MemoryRegistry, ServerPort};
use gridmill_core::types::{
    CalcFn, Chunk, ChunkFuncs, ClientId, ClusterName, JobRef, OutputItem, ServerName,
};
use gridmill_server::server::{serve, ServerConfig};

async fn recv_event(rx: &mut UnboundedReceiver<ClientEvent<i64>>) -> Result<ClientEvent<i64>> {
    timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("client mailbox closed"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_of_ten_chunks_is_doubled() -> Result<()> {
    let registry = MemoryRegistry::<i64>::new();
    let mut config = ServerConfig::new(
        ClusterName("test".to_string()),
        ServerName("server-1".to_string()),
    );
    config.max_workers = Some(2);
    let (server, _join) = serve(config, &registry)?;

    let (client, mut rx) = ClientHandle::new(ClientId("client-1".to_string()));
    let calc: CalcFn<i64> = Arc::new(|v| Ok(v * 2));

    let mut inputs: HashMap<u64, Vec<i64>> = HashMap::new();
    let mut chunks = Vec::new();
    for seq in 0..10u64 {
        let data: Vec<i64> = vec![seq as i64, seq as i64 + 10, seq as i64 + 100];
        inputs.insert(seq, data.clone());
        chunks.push(Chunk::new(
            client.id().clone(),
            JobRef("job-a".to_string()),
            seq,
            ChunkFuncs::new(calc.clone()),
            data,
        ));
    }
    server.process_chunks(ChunkLoad::new(client.clone(), chunks));

    let mut seen = Vec::new();
    while seen.len() < 10 {
        match recv_event(&mut rx).await? {
            ClientEvent::CalcDone { server: from, chunk } => {
                assert_eq!(from, ServerName("server-1".to_string()));
                assert_eq!(chunk.job, JobRef("job-a".to_string()));
                let input = inputs
                    .get(&chunk.seq)
                    .ok_or_else(|| anyhow::anyhow!("unexpected seq {}", chunk.seq))?;
                assert_eq!(chunk.data.len(), input.len());
                let expected: Vec<OutputItem<i64>> =
                    input.iter().map(|v| OutputItem::Value(v * 2)).collect();
                assert_eq!(chunk.data, expected);
                seen.push(chunk.seq);
            }
            // Pull-side refill requests are expected when the batch drains.
            ClientEvent::SendChunks { .. } => {}
            other => anyhow::bail!("unexpected event: {other:?}"),
        }
    }

    seen.sort_unstable();
    let want: Vec<u64> = (0..10).collect();
    assert_eq!(seen, want, "every chunk must complete exactly once");

    let (workers, max_workers) = server.worker_number().await?;
    assert_eq!(workers, 0);
    assert_eq!(max_workers, 2);
    Ok(())
}
