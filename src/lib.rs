//! Transport and dispatch engine for `seq`/`type` debug-adapter style
//! protocols carried over one ordered byte stream.
//!
//! Bytes are cut into `Content-Length` frames, decoded, classified into
//! protocol events and routed: responses to the [`Correlator`], requests and
//! notifications through the [`HandlerRegistry`] to the [`Scheduler`], which
//! runs them under per-method concurrency policies and writes results to an
//! [`OutputSink`].

pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod sink;

pub use config::{EngineSettings, load_settings};
pub use correlator::{Correlator, ErrorCustomizer, PendingResponse};
pub use engine::{Engine, EngineExit, EngineHandle};
pub use error::{ErrorBody, ErrorCodes, ErrorKind, RpcError, WireError};
pub use registry::{HandlerDescriptor, HandlerRegistry, HandlerTable, parse_params};
pub use scheduler::{Policy, Scheduler, SchedulerOptions};
pub use sink::{ChannelSink, FramedSink, OutputSink};
