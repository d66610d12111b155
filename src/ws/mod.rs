//! WebSocket layer: realtime wallet updates.
//!
//! Clients connect to `/ws`, send `subscribe` commands naming users and/or
//! channels, and receive every matching [`crate::domain::WalletUpdateEvent`]
//! emitted on this instance's event bus (including ones relayed by peers).

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;
