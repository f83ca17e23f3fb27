//! Channel seams between the SSH engine and the relay tasks
//!
//! Relay tasks only need three things from a channel: its id, a byte stream,
//! and a way to close it. Keeping those behind traits lets the tasks run
//! against in-memory pipes in tests.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Anything that carries a connection-unique channel id
pub trait Identified {
    type Id: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn channel_id(&self) -> Self::Id;
}

/// A channel the relay tasks can pump bytes through
pub trait RelayChannel: Identified + Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn into_stream(self) -> Self::Stream;
}

/// Closes channels by id once a relay is finished with them
#[async_trait]
pub trait ChannelCloser<Id>: Send + Sync {
    async fn close_channel(&self, id: Id);
}

impl Identified for Channel<Msg> {
    type Id = ChannelId;

    fn channel_id(&self) -> ChannelId {
        self.id()
    }
}

impl RelayChannel for Channel<Msg> {
    type Stream = ChannelStream<Msg>;

    fn into_stream(self) -> Self::Stream {
        Channel::into_stream(self)
    }
}

#[async_trait]
impl ChannelCloser<ChannelId> for Handle {
    async fn close_channel(&self, id: ChannelId) {
        if self.close(id).await.is_err() {
            debug!("Channel {:?} already gone", id);
        }
    }
}
