//! twinboot-api: Shared API types and schemas
//!
//! Contains the event and status view types published by the orchestration
//! core and consumed by whatever transport fans them out.

pub mod events;
pub mod responses;
