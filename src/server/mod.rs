//! Line-oriented JSON front end: accept → read → handle → respond, each stage
//! a task joined to the next by a bounded channel.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinHandle,
};

pub mod accepting;
pub mod handling;
pub mod models;
pub mod protocol;
pub mod reading;
pub mod responding;

use accepting::accept_connections;
use handling::{AppState, handle_messages};
use reading::read_sockets;
use responding::respond;

const CHANNEL_CAPACITY: usize = 128;

/// Starts every stage. The returned handle resolves once the listener has
/// stopped and every request taken before shutdown has been handled.
pub fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let sockets = Arc::new(DashMap::new());
    let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (msg_handle_tx, msg_handle_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (res_tx, res_rx) = mpsc::channel(CHANNEL_CAPACITY);

    read_sockets(sockets.clone(), read_rx, msg_handle_tx);
    let handler = handle_messages(state, res_tx, msg_handle_rx, shutdown.clone());
    respond(sockets, res_rx);
    let listener = accept_connections(listener, read_tx, shutdown);

    tokio::spawn(async move {
        for (stage, handle) in [("listener", listener), ("handler", handler)] {
            if let Err(err) = handle.await {
                tracing::error!("Server {} stage failed: {}", stage, err);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use super::*;
    use crate::core::{
        domain::{ExecutionOutcome, ExecutionResult},
        pipeline::{
            running::{ExecutionLimits, TestcaseRunner},
            scoring::ScoringPolicy,
            submission::Pipeline,
        },
        session::service::ProctoringService,
    };
    use crate::store::memory::InMemoryStore;
    use crate::stubs::sandbox::SandboxStub;

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let sandbox = SandboxStub::new(
            Ok(ExecutionResult {
                stdout: "7\n".to_string(),
                stderr: String::new(),
                exit_status: Some(0),
                wall_time_ms: 3,
                peak_memory_mb: 2.0,
                outcome: ExecutionOutcome::Completed,
            }),
            Duration::from_millis(1),
        );
        let store = Arc::new(InMemoryStore::new());
        let runner = TestcaseRunner::new(
            Arc::new(sandbox),
            ExecutionLimits {
                timeout_seconds: 1,
                memory_limit_mb: 64,
            },
        );
        let pipeline = Pipeline::new(runner, ScoringPolicy::default(), store.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let proctoring =
            ProctoringService::new(Arc::new(pipeline.clone()), store, 60, shutdown_rx.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve(listener, AppState::new(pipeline, proctoring), shutdown_rx);

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let request = json!({
            "id": 42,
            "op": "run_sample",
            "code": "print(7)",
            "language": "python",
            "testcases": [{"input": "", "expected_output": "7"}]
        });
        write_half
            .write_all(format!("{request}\n\nnot json\n").as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut responses = Vec::new();
        for _ in 0..2 {
            let line = lines.next_line().await.unwrap().unwrap();
            responses.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        let ok = responses.iter().find(|r| r["id"] == json!(42)).unwrap();
        assert_eq!(ok["ok"]["passed_count"], json!(1));
        assert!(responses.iter().any(|r| r["error"]["kind"] == json!("invalid_request")));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap();
    }
}
