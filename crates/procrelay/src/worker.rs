//! Worker subprocess - runs inside the child process.
//!
//! This module provides the child-side of the bridge protocol. The parent
//! side (spawning, restart policy, request routing) is in supervisor.rs.
//!
//! The loop reads one request frame from its input stream, invokes the
//! handler, and writes exactly one response frame - never more, never fewer.
//! Diagnostics belong on stderr, which the parent passes through untouched;
//! stdout carries nothing but frames.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::LineCodec;

/// Trait for the request handler - the worker's actual logic.
///
/// The handler owns its error reporting: whatever it returns is the response
/// frame, so failures should be encoded into the value (for example an
/// `{"error": ...}` object) rather than panicking.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Value) -> Value;
}

/// Run the worker loop over arbitrary streams.
///
/// Returns when the input stream closes (the parent went away) or errors out.
/// A malformed request frame is fatal: the stream position is unknown, and
/// exiting lets the parent's restart policy take over.
pub async fn run_worker<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: RequestHandler,
{
    let mut requests = FramedRead::new(reader, LineCodec::<Value>::new());
    let mut responses = FramedWrite::new(writer, LineCodec::<Value>::new());

    while let Some(request) = requests.next().await {
        let request = request?;
        let response = handler.handle(request).await;
        responses.send(response).await?;
    }

    tracing::info!("request stream closed, worker exiting");
    Ok(())
}

/// Run the worker loop over this process's stdin/stdout.
pub async fn run_worker_stdio<H: RequestHandler>(handler: Arc<H>) -> io::Result<()> {
    run_worker(stdin(), stdout(), handler).await
}
