pub mod batch;
pub mod cancel;
pub mod cmd;
pub mod config;
pub mod deps;
pub mod engine;
mod error;
pub mod events;
pub mod ffmpeg;
pub mod format;
pub mod history;
pub mod monitor;
pub mod paths;
pub mod probe;
pub mod progress;
pub mod request;
pub mod worker;
pub mod ytdlp;

pub use error::{classify_tool_stderr, EngineError, ErrorKind, Result};
