// src/server/connection_loop.rs

//! The TCP accept loop and per-connection session handling. Each session
//! owns a framed stream; acknowledgements and asynchronous pushes share the
//! write half through the session's outbound channel.

use super::dispatch;
use crate::core::metrics;
use crate::core::protocol::{Frame, FrameCodec};
use crate::core::state::ServerState;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Accepts connections until shutdown fires.
pub async fn run_accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        debug!("accepted connection from {}", addr);
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_connection(state, socket).await;
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                }
            }
        }
    }
}

/// One client session: register an outbound channel for pushes, then pump
/// frames until the peer exits or the transport drops.
pub async fn handle_connection(state: Arc<ServerState>, socket: TcpStream) {
    let session_id = state.allocate_session_id();
    let framed = Framed::new(socket, FrameCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAPACITY);
    state.clients.insert(session_id, outbound_tx.clone());
    metrics::CONNECTED_CLIENTS.inc();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!("session write failed: {}", e);
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {} stream error: {}", session_id, e);
                break;
            }
        };
        let is_exit = matches!(frame, Frame::Exit);
        if let Some(response) = dispatch::handle_frame(&state, session_id, frame).await {
            if outbound_tx.send(response).await.is_err() {
                break;
            }
        }
        if is_exit {
            debug!("session {} requested exit", session_id);
            break;
        }
    }

    state.clients.remove(&session_id);
    metrics::CONNECTED_CLIENTS.dec();
    drop(outbound_tx);
    let _ = writer.await;
    debug!("session {} closed", session_id);
}
