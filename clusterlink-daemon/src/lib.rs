//! clusterlink agent daemon: bootstrap gate, action dispatch, change
//! notifications, manifest feed and the Unix-socket transport.

pub mod agent;
pub mod dispatch;
mod error;
pub mod hub;
pub mod manifest;
pub mod paths;
pub mod protocol;
pub mod resources;
mod runtime;
pub mod session;
pub mod workload;

pub use agent::Agent;
pub use dispatch::{DispatchTable, DispatchTableBuilder, Handler, HandlerResult, RequestContext};
pub use error::{DaemonError, HandlerError};
pub use hub::NotificationHub;
pub use protocol::{
    request, request_status, request_stop, send_request, stream, RequestFrame, ResponseFrame,
};
pub use runtime::{run, start_blocking, LogFormat};
pub use session::{serve_connection, Session};
pub use workload::{ExecHandle, OutputStream, PodUpdate, WorkloadOps};
