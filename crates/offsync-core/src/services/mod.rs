//! Shared service layer used across clients.

mod replica;

pub use replica::{ManualResolution, Replica};
