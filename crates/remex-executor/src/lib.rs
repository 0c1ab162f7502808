//! Backend capabilities used by the remex engine: the cluster control-plane
//! contract, durable scratch storage and code packaging, together with the
//! local implementations used in debug mode.

mod backend;
mod command;
mod docker;
mod error;
mod package;
mod scratch;

pub use backend::{
    ClusterClient, RemoteState, ResourceRequest, StatusRecord, SubmitHandle, SubmitRequest,
};
pub use command::{shell_quote, ShellCommand};
pub use docker::DockerBackend;
pub use error::{BackendError, Result};
pub use package::{collect_files, CodePackager, CodeRef, TarPackager};
pub use scratch::{FsScratch, Scratch, ScratchKey};
