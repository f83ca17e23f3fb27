//! Channel Registrar
//!
//! russh hands channel objects to the `channel_open_*` callbacks, but the
//! follow-up `shell`/`exec` requests only carry a channel id, and nothing
//! orders the two when a shell and a forward open at the same time. Every
//! opened channel is pushed onto an accept queue; tasks claim their channel
//! by id through [`ChannelRegistrar::get_channel`], which parks channels
//! belonging to someone else until their owner asks.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use super::channel::Identified;
use super::error::BridgeError;

/// Default time to wait for the next accepted channel
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of accepts tried before giving up on an id
pub const DEFAULT_ACCEPT_ATTEMPTS: usize = 3;

/// Sending side of the accept queue, held by the SSH handler
pub struct ChannelAcceptor<C> {
    tx: mpsc::UnboundedSender<C>,
}

impl<C> Clone for ChannelAcceptor<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Identified> ChannelAcceptor<C> {
    /// Queue a freshly opened channel for whoever claims its id
    pub fn offer(&self, channel: C) -> Result<(), BridgeError> {
        let id = channel.channel_id();
        self.tx
            .send(channel)
            .map_err(|_| BridgeError::ChannelResolution(format!("{:?}", id)))
    }
}

struct RegistrarState<C: Identified> {
    incoming: mpsc::UnboundedReceiver<C>,
    pending: HashMap<C::Id, C>,
}

/// Resolves channel ids to channel handles, each delivered exactly once
pub struct ChannelRegistrar<C: Identified> {
    state: Mutex<RegistrarState<C>>,
    accept_timeout: Duration,
    attempts: usize,
}

impl<C: Identified> ChannelRegistrar<C> {
    /// Create a registrar and the acceptor that feeds it
    pub fn new(accept_timeout: Duration, attempts: usize) -> (Self, ChannelAcceptor<C>) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let registrar = Self {
            state: Mutex::new(RegistrarState {
                incoming,
                pending: HashMap::new(),
            }),
            accept_timeout,
            attempts,
        };
        (registrar, ChannelAcceptor { tx })
    }

    /// Claim the channel with `id`.
    ///
    /// The buffer lookup, every accept and every buffering step happen under
    /// one lock, so a channel is either returned or parked, never both.
    pub async fn get_channel(&self, id: C::Id) -> Result<C, BridgeError> {
        debug!("Getting channel {:?}", id);
        let mut state = self.state.lock().await;

        if let Some(channel) = state.pending.remove(&id) {
            debug!("Got channel {:?} from buffer", id);
            return Ok(channel);
        }

        for attempt in 0..self.attempts {
            let channel = match tokio::time::timeout(self.accept_timeout, state.incoming.recv()).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    error!("Accept queue closed while waiting for channel {:?}", id);
                    break;
                }
                Err(_) => {
                    error!("No channel available for {:?}", id);
                    break;
                }
            };

            let got = channel.channel_id();
            if got == id {
                debug!("Got channel {:?} from accept queue", id);
                return Ok(channel);
            }

            debug!(
                "Channel id mismatch (wanted {:?}, got {:?}), attempt {}",
                id, got, attempt
            );
            state.pending.insert(got, channel);
        }

        Err(BridgeError::ChannelResolution(format!("{:?}", id)))
    }

    /// Number of accepted channels waiting for their owner
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
