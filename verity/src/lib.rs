mod errors;

pub mod config;
pub mod digests;
pub mod fixtures;
pub mod learning;
pub mod manifest;
pub mod verify;

#[cfg(feature = "fs")]
pub mod fs;

pub use config::VerityConfig;
pub use errors::{Error, ReadError};
pub use verify::{Mode, Verity, BLOCK_SIZE};

#[cfg(test)]
mod tests;
