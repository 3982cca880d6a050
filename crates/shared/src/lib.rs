//! Shared types and utilities for the storetalk server and client.

pub mod error;
pub mod models;
pub mod stomp;

pub use error::*;
pub use models::*;
pub use stomp::*;
