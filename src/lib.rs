//! Qserv core: the worker-side scheduler/memory-manager/result-transport
//! stack (C1-C7, C12-C13) and the czar-side chunk map, uber-job assembler,
//! executive, and merger (C8-C11, C14).
//!
//! Binaries (`qserv-worker`, `qserv-czar`) assemble these modules into a
//! running process; this crate only provides the library surface.

pub mod common;
pub mod config;
pub mod error;
pub mod ids;
pub mod memman;
pub mod naming;
pub mod status;
pub mod task;
pub mod transport;

pub mod czar;
pub mod worker;

pub use error::{QservError, Result};
