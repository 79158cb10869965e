// Run engine, durable stores and tool federation for Helm

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod federation;
pub mod protocol;
pub mod retry;
pub mod runtime;
pub mod search;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod tools;
pub mod types;

pub use error::{Error, Result};
pub use helm_tools::ErrorKind;
