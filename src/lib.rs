//! # Vector RPC
//!
//! A transport-agnostic RPC runtime paired with an IVF/IVF-PQ approximate
//! nearest neighbor index. The RPC core provides TCP/UDP/HTTP/local
//! transports behind one client/server abstraction, negotiable filter
//! chains (compression, TLS, mutual auth), publish/subscribe fan-out,
//! streamed file transfer with bandwidth shaping, and rendezvous proxying
//! for servers behind NAT. The index core partitions a vector corpus into
//! coarse clusters and serves top-K queries over a probe subset, with
//! SIMD-accelerated distance kernels.

pub mod cli;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod filetransfer;
pub mod filter;
pub mod ivf;
pub mod pool;
pub mod proxy;
pub mod pubsub;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;

pub use client::{ClientOptions, ClientStub};
pub use endpoint::Endpoint;
pub use error::{CallError, ErrorCode, RemoteException, RpcError, RpcResult};
pub use server::{RpcServer, ServerConfig, ServerMethod, ServiceFn};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Runtime protocol version this build speaks.
    pub const RUNTIME_VERSION: u32 = 13;

    /// Archive (serialization) version this build speaks.
    pub const ARCHIVE_VERSION: u32 = 1;

    /// Default cap on a single message in either direction.
    pub const MAX_MESSAGE_LENGTH: u32 = 1024 * 1024;

    /// Default client connect deadline.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default client call deadline.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Sliding window for file-transfer throttling, seconds.
    pub const TRANSFER_WINDOW_S: u32 = 5;

    /// Kernel socket buffer size for stream transports.
    pub const SOCKET_BUFFER_SIZE: usize = 8192;

    /// Cached objects retained per type in an object pool.
    pub const POOL_MAX_PER_TYPE: usize = 32;

    /// Service name of OOB carrier calls.
    pub const CONTROL_SERVICE: &str = "";

    /// Binding name of the rendezvous service.
    pub const PROXY_SERVICE: &str = "ProxyEndpointService";

    /// Binding name of the file transfer service.
    pub const FILE_TRANSFER_SERVICE: &str = "FileTransferService";
}
