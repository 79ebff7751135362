// src/client/notify.rs

//! The notification bus: a single receive loop on the client's connection
//! that demuxes acknowledgements, completion notifications, and server
//! pushes (signal / checkpoint / recover / shutdown) to their handlers.

use super::adaptor::InvokeAdaptor;
use crate::core::protocol::{
    CheckpointRequest, Frame, FrameCodec, RecoverRequest, ShutdownRequest, SignalRequest,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

pub type SignalHandler = Box<dyn Fn(SignalRequest) + Send + Sync>;
pub type CheckpointHandler = Box<dyn Fn(CheckpointRequest) + Send + Sync>;
pub type RecoverHandler = Box<dyn Fn(RecoverRequest) + Send + Sync>;
pub type ShutdownHandler = Box<dyn Fn(ShutdownRequest) + Send + Sync>;

/// Handlers the user process registers at bootstrap, before any RPC starts.
#[derive(Default)]
pub struct HandlerRegistry {
    signal: Mutex<Option<SignalHandler>>,
    checkpoint: Mutex<Option<CheckpointHandler>>,
    recover: Mutex<Option<RecoverHandler>>,
    shutdown: Mutex<Option<ShutdownHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_signal_handler(&self, handler: SignalHandler) {
        *self.signal.lock() = Some(handler);
    }

    pub fn set_checkpoint_handler(&self, handler: CheckpointHandler) {
        *self.checkpoint.lock() = Some(handler);
    }

    pub fn set_recover_handler(&self, handler: RecoverHandler) {
        *self.recover.lock() = Some(handler);
    }

    pub fn set_shutdown_handler(&self, handler: ShutdownHandler) {
        *self.shutdown.lock() = Some(handler);
    }

    pub fn on_signal(&self, req: SignalRequest) {
        if let Some(handler) = self.signal.lock().as_ref() {
            handler(req);
        } else {
            debug!("signal {} dropped: no handler registered", req.signal);
        }
    }

    pub fn on_checkpoint(&self, req: CheckpointRequest) {
        if let Some(handler) = self.checkpoint.lock().as_ref() {
            handler(req);
        }
    }

    pub fn on_recover(&self, req: RecoverRequest) {
        if let Some(handler) = self.recover.lock().as_ref() {
            handler(req);
        }
    }

    pub fn on_shutdown(&self, req: ShutdownRequest) {
        if let Some(handler) = self.shutdown.lock().as_ref() {
            handler(req);
        }
    }
}

/// Spawns the receive loop over a connection's read half. The loop exits on
/// transport close or an explicit adaptor exit.
pub fn spawn_receive_loop(
    adaptor: Arc<InvokeAdaptor>,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(frame) => {
                    if !adaptor.dispatch_inbound(frame).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("notification bus stream error: {}", e);
                    break;
                }
            }
        }
        adaptor.on_transport_closed();
        debug!("notification bus receive loop exited");
    })
}
