//! The long-running node: lifecycle server, CPU monitor and a JSON-lines
//! command channel on stdin.

use crate::NodeState;
use crate::commands::{CommandRequest, respond};
use fleet_lifecycle::command_channel;
use fleet_monitor::{AdmissionMonitor, CpuSampler};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Answer one request line; blank lines produce no reply.
pub async fn handle_line(state: &NodeState, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let reply = match CommandRequest::parse(line) {
        Ok(request) => respond(state, request).await,
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    Some(reply)
}

/// Replies waiting for the writer task.
const REPLY_BUFFER: usize = 32;

/// Serve request lines from `input` until it closes, one reply line each.
///
/// Every request runs on its own task, so a slow launch does not hold up
/// other callers. Replies are written in completion order by a single
/// writer task; callers match them up through the echoed `id`. Returns once
/// every accepted request has been answered.
pub async fn serve_lines<R, W>(state: &NodeState, input: R, mut output: W) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(REPLY_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let mut text = reply.to_string();
            text.push('\n');
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = input.lines();
    let mut served = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        served += 1;
        let state = state.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle_line(&state, &line).await {
                if reply_tx.send(reply).await.is_err() {
                    warn!("reply writer gone, dropping reply");
                }
            }
        });
    }

    drop(reply_tx);
    writer.await.map_err(std::io::Error::other)??;
    Ok(served)
}

/// Run the node until ctrl-c.
///
/// Closing stdin stops command intake only; the monitor keeps running.
pub async fn run_daemon(state: NodeState, sampler: Arc<dyn CpuSampler>) -> anyhow::Result<()> {
    let (fleet, rx) = command_channel();
    let server = tokio::spawn(Arc::clone(&state.manager).serve(rx));
    let monitor = tokio::spawn(AdmissionMonitor::new(state.monitor.clone(), sampler, fleet).run());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        result = serve_lines(&state, BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            match result {
                Ok(served) => info!(served, "command input closed, waiting for shutdown signal"),
                Err(e) => warn!(error = %e, "command input failed, waiting for shutdown signal"),
            }
            (&mut shutdown).await?;
        }
        signal = &mut shutdown => signal?,
    }

    info!("shutting down");
    monitor.abort();
    server.abort();
    state.store.read().await.flush()?;
    Ok(())
}
