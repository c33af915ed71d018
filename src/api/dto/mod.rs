//! Data Transfer Objects for REST request/response serialization.

pub mod event_dto;
pub mod stats_dto;

pub use event_dto::*;
pub use stats_dto::*;
