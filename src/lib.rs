pub mod cmd;
pub mod config;
pub mod epg;
mod error;
pub mod invocation;
pub mod logs;
pub mod paths;
pub mod playlist;
pub mod progress;
pub mod scheduler;
pub mod series;
pub mod session;
pub mod window;
pub mod worker;

pub use error::{DvrError, Result};
