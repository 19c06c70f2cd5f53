pub mod endpoint;
pub mod pool;
pub mod ssh2_backend;
pub mod transport;

pub use endpoint::EndpointKey;
pub use pool::{ConnectionPool, PooledSession};
pub use ssh2_backend::Ssh2Connector;
pub use transport::{Connector, FileChannel, FileKind, ForwardChannel, RemoteStat, Transport};
