pub mod app;
pub mod audio;
pub mod config;
pub mod display;
pub mod error;
pub mod registry;
pub mod state;
pub mod things;
pub mod transport;
pub mod wake;

pub use error::{Result, VoxError};
