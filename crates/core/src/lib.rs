//! Domain layer for the presence gateway.
//!
//! Holds the webhook payload schema, validation and normalization pipeline,
//! the presence sink seam, and the NAS entry lifecycle. Nothing here talks
//! to the network or the database directly.
pub mod entry;
pub mod normalizer;
pub mod sink;
pub mod types;
pub mod validator;
