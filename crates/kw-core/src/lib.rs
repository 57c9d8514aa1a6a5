pub mod config;
pub mod error;
pub mod time;

pub use error::{KwError, KwResult, TreeError};
