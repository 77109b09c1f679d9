pub mod dsm;

pub use dsm::{describe_auth_error, DsmClient, DsmError};
