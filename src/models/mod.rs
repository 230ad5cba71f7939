//! Data models for the bulletin backend.
//!
//! Every persisted record serializes with camelCase field names.

mod message;
mod schema;
mod topic;
mod user;

pub use message::*;
pub use schema::*;
pub use topic::*;
pub use user::*;
