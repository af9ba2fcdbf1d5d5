mod error;

pub mod client;

pub use client::{connect, ClientReader, ClientWriter, Notice};
pub use error::ClientError;
