// packages/engine/src/runtime/worker_main.rs
//! Worker process main loop
//!
//! Reads [`HostMessage`]s from stdin and writes [`WorkerMessage`]s to
//! stdout. Jobs run concurrently; each has its own cancellation token so the
//! host can preempt one without touching the others. Logging goes to stderr,
//! stdout belongs to the protocol.

use crate::runtime::dependencies::DependencyResolver;
use crate::runtime::protocol::{self, line_codec, HostMessage, WorkerMessage};
use crate::runtime::sandbox::SandboxExecutor;
use crate::tracking::{ExecutionTracker, MemoryStore};
use crate::utils::config::ExecutionConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve the worker protocol on stdin/stdout until shutdown or EOF
pub async fn run_worker(worker_id: &str, config: &ExecutionConfig) -> Result<()> {
    serve(worker_id, config, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve the worker protocol over any byte streams
pub async fn serve<R, W>(worker_id: &str, config: &ExecutionConfig, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let tracker = Arc::new(ExecutionTracker::new(Arc::new(MemoryStore::new())));
    let executor = Arc::new(SandboxExecutor::new(
        tracker,
        Arc::new(DependencyResolver::from_config(config)),
    ));

    // Single writer task; job tasks send through the channel
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, line_codec());
        while let Some(message) = out_rx.recv().await {
            let line = protocol::encode_line(&message)?;
            sink.send(line)
                .await
                .map_err(|e| EngineError::Infrastructure(format!("stdout closed: {}", e)))?;
        }
        Ok::<(), EngineError>(())
    });

    let _ = out_tx.send(WorkerMessage::Ready {
        worker_id: worker_id.to_string(),
        pid: std::process::id(),
    });
    info!(worker_id, "worker ready");

    let running: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());
    let mut jobs = JoinSet::new();
    let mut lines = FramedRead::new(input, line_codec());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id, error = %e, "unreadable host message");
                break;
            }
        };
        let message = match protocol::decode_line::<HostMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker_id, error = %e, "dropping malformed host message");
                continue;
            }
        };

        match message {
            HostMessage::Ping { nonce } => {
                let _ = out_tx.send(WorkerMessage::Pong { nonce });
            }
            HostMessage::Execute { job } => {
                let execution_id = job.execution_id.clone();
                let token = CancellationToken::new();
                running.insert(execution_id.clone(), token.clone());
                debug!(worker_id, execution_id = %execution_id, "job received");

                let executor = executor.clone();
                let running = running.clone();
                let out_tx = out_tx.clone();
                jobs.spawn(async move {
                    let result = protocol::run_job(&executor, *job, token).await;
                    running.remove(&execution_id);
                    let _ = out_tx.send(WorkerMessage::Result {
                        result: Box::new(result),
                    });
                });
            }
            HostMessage::Cancel { execution_id } => {
                if let Some(token) = running.get(&execution_id) {
                    info!(worker_id, execution_id = %execution_id, "job preempted by host");
                    token.cancel();
                }
            }
            HostMessage::Shutdown => {
                info!(worker_id, "shutdown requested");
                break;
            }
        }
    }

    // Whatever is still running is preempted and reported
    for entry in running.iter() {
        entry.value().cancel();
    }
    while jobs.join_next().await.is_some() {}

    drop(out_tx);
    match writer.await {
        Ok(result) => result?,
        Err(e) => warn!(worker_id, error = %e, "writer task failed"),
    }
    info!(worker_id, "worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::functions::Function;
    use crate::runtime::protocol::ExecuteJob;
    use crate::runtime::resource_limiter::ResourceLimits;
    use crate::runtime::sandbox::{ExecutionOutcome, PREEMPTED_REASON};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn execute(id: &str, code: &str) -> String {
        protocol::encode_line(&HostMessage::Execute {
            job: Box::new(ExecuteJob {
                execution_id: id.to_string(),
                function: Function::new("app", "main", code),
                library: vec![],
                input: Value::Int(20),
                context: Value::Null,
                limits: ResourceLimits::default(),
            }),
        })
        .unwrap()
    }

    async fn next_message<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> WorkerMessage {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        protocol::decode_line(line.trim_end()).unwrap()
    }

    #[tokio::test]
    async fn test_worker_session() {
        let (host_out, worker_in) = tokio::io::duplex(1 << 16);
        let (worker_out, host_in) = tokio::io::duplex(1 << 16);
        let config = ExecutionConfig::default();
        let worker = tokio::spawn(async move { serve("worker-1", &config, worker_in, worker_out).await });

        let mut host_out = host_out;
        let mut replies = BufReader::new(host_in);

        assert!(matches!(
            next_message(&mut replies).await,
            WorkerMessage::Ready { worker_id, .. } if worker_id == "worker-1"
        ));

        let ping = protocol::encode_line(&HostMessage::Ping { nonce: 3 }).unwrap();
        host_out.write_all(format!("{}\n", ping).as_bytes()).await.unwrap();
        assert_eq!(next_message(&mut replies).await, WorkerMessage::Pong { nonce: 3 });

        let job = execute("e1", "fn main(input) { return input + 22; }");
        host_out.write_all(format!("{}\n", job).as_bytes()).await.unwrap();
        match next_message(&mut replies).await {
            WorkerMessage::Result { result } => {
                assert_eq!(result.execution_id, "e1");
                assert_eq!(result.result.outcome, ExecutionOutcome::Completed { output: Value::Int(42) });
                assert_eq!(result.steps.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let shutdown = protocol::encode_line(&HostMessage::Shutdown).unwrap();
        host_out.write_all(format!("{}\n", shutdown).as_bytes()).await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_preempts_one_job() {
        let (host_out, worker_in) = tokio::io::duplex(1 << 16);
        let (worker_out, host_in) = tokio::io::duplex(1 << 16);
        let config = ExecutionConfig::default();
        let worker = tokio::spawn(async move { serve("worker-1", &config, worker_in, worker_out).await });

        let mut host_out = host_out;
        let mut replies = BufReader::new(host_in);
        next_message(&mut replies).await;

        let job = execute("slow", "fn main(input) { sleep(10000); return input; }");
        host_out.write_all(format!("{}\n", job).as_bytes()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let cancel = protocol::encode_line(&HostMessage::Cancel {
            execution_id: "slow".to_string(),
        })
        .unwrap();
        host_out.write_all(format!("{}\n", cancel).as_bytes()).await.unwrap();

        match next_message(&mut replies).await {
            WorkerMessage::Result { result } => {
                assert_eq!(result.execution_id, "slow");
                assert_eq!(result.result.outcome.error().unwrap().message, PREEMPTED_REASON);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // EOF ends the session
        drop(host_out);
        worker.await.unwrap().unwrap();
    }
}
