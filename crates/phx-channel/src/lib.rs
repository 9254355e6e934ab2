//! # phx-channel - Phoenix Channels client
//!
//! An async client for the Phoenix Channels V2 JSON protocol. Topics are
//! joined over a single WebSocket; each outbound request carries a unique
//! message ref so its reply reaches the handler waiting for it, while frames
//! that answer nothing go to the channel's broadcast handler.
//!
//! # Architecture
//!
//! - **Envelope**: the `[join_ref, ref, topic, event, payload]` wire frame
//! - **RefAllocator**: per-channel message refs and the fixed join ref
//! - **CallbackRegistry**: pending reply handlers, resolved at most once
//! - **Socket**: owns the WebSocket; one dispatch task reads, writes and routes
//! - **Channel**: one topic on a socket; join, send, leave
//!
//! # Quick Start
//!
//! ```ignore
//! use phx_channel::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ChannelError> {
//!     let channel = phx_channel::connect_and_join(
//!         "ws://localhost:4000/socket/websocket",
//!         "rtc:room1",
//!         &json!({}),
//!     )
//!     .await?;
//!
//!     channel.set_broadcast_handler(|msg| println!("broadcast: {:?}", msg));
//!
//!     let reply = channel.call("new_message", &json!({"content": "hi"})).await?;
//!     println!("reply: {}", reply.payload);
//!
//!     channel.leave().await
//! }
//! ```
//!
//! # Sharing a socket
//!
//! ```ignore
//! let socket = Socket::connect(url, SocketConfig::new().param("token", token)).await?;
//!
//! let lobby = socket.channel("room:lobby")?;
//! lobby.join(&json!({})).await?;
//!
//! let user = socket.channel("user:42")?;
//! user.join(&json!({})).await?;
//!
//! lobby
//!     .send("ping", &json!({}), ReplyHandler::new(|reply| println!("{:?}", reply)))
//!     .await?;
//!
//! socket.disconnect().await;
//! ```

#![deny(missing_docs)]

/// Channel lifecycle, join/send/leave.
pub mod channel;

/// Socket configuration.
pub mod config;

/// Wire envelope codec.
pub mod envelope;

/// Error types.
pub mod error;

/// Message and join ref allocation.
pub mod refs;

/// Pending reply handlers.
pub mod registry;

/// The shared WebSocket connection.
pub mod socket;

pub use channel::{BroadcastHandler, Channel, ChannelState};
pub use config::SocketConfig;
pub use envelope::{Envelope, ReplyStatus};
pub use error::{ChannelClosed, ChannelError, CloseReason};
pub use registry::{CallbackRegistry, ReplyHandler, ReplyResult};
pub use socket::Socket;

use serde::Serialize;

/// Open a socket to `address` and join `topic`, sending `params` as the join
/// payload.
///
/// Uses [`SocketConfig::default`]. The socket belongs to the returned channel
/// and is closed by [`Channel::leave`].
pub async fn connect_and_join<T>(
    address: &str,
    topic: &str,
    params: &T,
) -> Result<Channel, ChannelError>
where
    T: Serialize + ?Sized,
{
    Channel::connect_and_join(address, topic, params, SocketConfig::default()).await
}

/// Like [`connect_and_join`], with an explicit socket configuration.
pub async fn connect_and_join_with<T>(
    address: &str,
    topic: &str,
    params: &T,
    config: SocketConfig,
) -> Result<Channel, ChannelError>
where
    T: Serialize + ?Sized,
{
    Channel::connect_and_join(address, topic, params, config).await
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelState};
    pub use crate::config::SocketConfig;
    pub use crate::envelope::{Envelope, ReplyStatus};
    pub use crate::error::{ChannelClosed, ChannelError, CloseReason};
    pub use crate::registry::{ReplyHandler, ReplyResult};
    pub use crate::socket::Socket;
}
