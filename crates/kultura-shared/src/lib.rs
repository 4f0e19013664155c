//! # kultura-shared
//!
//! Types shared between the KulturaX relay and its clients: identifiers,
//! wire frames, protocol limits and the signed credential format.

pub mod constants;
pub mod credential;
pub mod error;
pub mod protocol;
pub mod types;
