//! Data Transfer Objects for REST request/response serialization.
//!
//! Identifiers cross the wire as plain UUID strings and coin amounts as
//! JSON integers.

pub mod outbox_dto;
pub mod reward_dto;
pub mod wallet_dto;

pub use outbox_dto::*;
pub use reward_dto::*;
pub use wallet_dto::*;
