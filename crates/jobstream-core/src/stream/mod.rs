//! Execution output streaming.

pub mod manager;

pub use manager::{
    EnvelopeStream, StreamError, StreamManager, StreamSettings, WORKER_LOST_ERROR, overrun_error,
};
