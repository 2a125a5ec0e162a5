//! Daemon runtime: local event ingestion, remote polling, the periodic merge
//! and the control socket.

mod error;
pub mod events;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, open_backend, run, start_blocking, Engine};
