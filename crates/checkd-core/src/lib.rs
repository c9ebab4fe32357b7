pub mod config;
pub mod error;
pub mod handshake;
pub mod io;
pub mod lock;
pub mod monitor;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod signals;
pub mod supervisor;
pub mod terminate;
pub mod worker;

pub use error::{CheckdError, Result};
