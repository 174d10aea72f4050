//! Shared types for the tandem workspace: the chat data model, gateway wire
//! events, and HTTP request/response bodies.

pub mod api;
pub mod events;
pub mod models;
