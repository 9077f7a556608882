//! blobseal-storage: remote blob and upload-request APIs
//!
//! The session layer depends only on the traits in [`api`]. Two backends
//! ship with the crate: [`MemoryRemote`] for tests and [`DirRemote`], which
//! keeps each container in a local directory.

pub mod api;
pub mod dir;
pub mod memory;
pub mod pending;

pub use api::{
    FileMeta, FilePatch, Patch, RemoteBlobApi, RemoteFile, RemoteRead, UploadApi, UploadCommit,
    UploadFileSpec, WriteRequest,
};
pub use dir::DirRemote;
pub use memory::{InjectedFailure, MemoryRemote, RemoteStats};
