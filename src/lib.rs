//! PCM Bridge Library
//!
//! Real-time streaming engine that moves PCM frames between client ring
//! buffers and a hardware device, with per-stream and per-session volume,
//! channel remapping and monotonic position reporting.

pub mod audio;
pub mod engine;
pub mod error;

pub use audio::backend::{VirtualBackend, VirtualConfig, VirtualProbe};
pub use audio::format::{Direction, SampleEncoding, StreamFormat};
pub use audio::timing::{Clock, ManualClock, SystemClock};
pub use engine::{
    AudioContext, ContextConfig, PumpMode, SessionControl, SessionId, SessionState, Stream,
    StreamParams, StreamPosition, StreamState,
};
pub use error::{BackendError, Result, StreamError};
