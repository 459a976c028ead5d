//! Types shared between the chat sync engine and the marketplace server.

pub mod domain;
pub mod error;
pub mod protocol;
