use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use gridmill_cluster::{ChunkLoad, ClientEvent, ClientHandle, MemoryRegistry, ServerPort};
use gridmill_core::types::{
    CalcFn, Chunk, ChunkFuncs, ClientId, ClusterName, JobRef, ServerName,
};
use gridmill_server::server::{serve, ConfigError, ServerConfig, ServerHandle};

fn slow_chunks(client: &ClientHandle<i64>, job: &str, n: u64, sleep: Duration) -> Vec<Chunk<i64>> {
    let calc: CalcFn<i64> = Arc::new(move |v| {
        std::thread::sleep(sleep);
        Ok(v + 1)
    });
    (0..n)
        .map(|seq| {
            Chunk::new(
                client.id().clone(),
                JobRef(job.to_string()),
                seq,
                ChunkFuncs::new(calc.clone()),
                vec![seq as i64],
            )
        })
        .collect()
}

async fn wait_for_workers(server: &ServerHandle<i64>, want: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (workers, _) = server.worker_number().await?;
        if workers == want {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("workers never reached {want} (at {workers})");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shrinking_the_cap_drains_without_preemption() -> Result<()> {
    let registry = MemoryRegistry::<i64>::new();
    let mut config = ServerConfig::new(
        ClusterName("test".to_string()),
        ServerName("server-1".to_string()),
    );
    config.max_workers = Some(4);
    let (server, _join) = serve(config, &registry)?;

    let (client, mut rx) = ClientHandle::new(ClientId("client-1".to_string()));
    let chunks = slow_chunks(&client, "job-slow", 10, Duration::from_millis(100));
    server.process_chunks(ChunkLoad::new(client.clone(), chunks));

    wait_for_workers(&server, 4).await?;
    server.change_worker_number(1).await?;
    let (_, max_workers) = server.worker_number().await?;
    assert_eq!(max_workers, 1);

    // Collect all completions while sampling the pool: it never exceeds the
    // old cap, and once it has drained to the new cap it stays there.
    let mut done = 0;
    let mut drained_below = false;
    while done < 10 {
        match timeout(Duration::from_millis(50), rx.recv()).await {
            Ok(Some(ClientEvent::CalcDone { .. })) => done += 1,
            Ok(Some(_)) => {}
            Ok(None) => anyhow::bail!("client mailbox closed"),
            Err(_) => {
                let (workers, _) = server.worker_number().await?;
                assert!(workers <= 4);
                if drained_below {
                    assert!(workers <= 1, "pool grew above the shrunken cap");
                }
                if workers <= 1 {
                    drained_below = true;
                }
            }
        }
    }

    wait_for_workers(&server, 0).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raising_the_cap_redispatches_queued_work() -> Result<()> {
    let registry = MemoryRegistry::<i64>::new();
    let mut config = ServerConfig::new(
        ClusterName("test".to_string()),
        ServerName("server-1".to_string()),
    );
    config.max_workers = Some(1);
    let (server, _join) = serve(config, &registry)?;

    let (client, mut rx) = ClientHandle::new(ClientId("client-1".to_string()));
    let chunks = slow_chunks(&client, "job-slow", 6, Duration::from_millis(100));
    server.process_chunks(ChunkLoad::new(client.clone(), chunks));

    wait_for_workers(&server, 1).await?;
    server.change_worker_number(3).await?;
    wait_for_workers(&server, 3).await?;

    let mut done = 0;
    while done < 6 {
        match timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("client mailbox closed"))?
        {
            ClientEvent::CalcDone { .. } => done += 1,
            _ => {}
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negative_worker_count_is_rejected() -> Result<()> {
    let registry = MemoryRegistry::<i64>::new();
    let mut config = ServerConfig::new(
        ClusterName("test".to_string()),
        ServerName("server-1".to_string()),
    );
    config.max_workers = Some(2);
    let (server, _join) = serve(config, &registry)?;

    let err = server.change_worker_number(-1).await.unwrap_err();
    assert_eq!(err, ConfigError::BadNumber);

    // An in-range value is accepted without touching running state.
    server.change_worker_number(2).await?;
    let (workers, max_workers) = server.worker_number().await?;
    assert_eq!((workers, max_workers), (0, 2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_cap_holds_under_churn() -> Result<()> {
    let registry = MemoryRegistry::<i64>::new();
    let mut config = ServerConfig::new(
        ClusterName("test".to_string()),
        ServerName("server-1".to_string()),
    );
    config.max_workers = Some(3);
    let (server, _join) = serve(config, &registry)?;

    let (client, mut rx) = ClientHandle::new(ClientId("client-1".to_string()));
    for (i, job) in ["job-a", "job-b", "job-c"].iter().enumerate() {
        let chunks = slow_chunks(&client, job, 5, Duration::from_millis(20));
        server.process_chunks(ChunkLoad::new(client.clone(), chunks));
        if i == 1 {
            server.change_worker_number(2).await?;
        }
    }
    server.change_worker_number(5).await?;

    let mut done = 0;
    while done < 15 {
        match timeout(Duration::from_millis(20), rx.recv()).await {
            Ok(Some(ClientEvent::CalcDone { .. })) => done += 1,
            Ok(Some(_)) => {}
            Ok(None) => anyhow::bail!("client mailbox closed"),
            Err(_) => {
                let (workers, max_workers) = server.worker_number().await?;
                assert!(workers <= 5, "workers {workers} above any cap granted");
                assert!(max_workers == 5);
            }
        }
    }

    wait_for_workers(&server, 0).await?;
    Ok(())
}
