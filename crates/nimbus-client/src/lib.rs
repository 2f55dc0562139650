//! # nimbus-client: Connections between nimbus services
//!
//! - [`Endpoint`], [`Stream`], [`Listener`] and the [`Transport`] trait:
//!   TCP and Unix domain sockets behind one interface.
//! - [`Deliverator`]: matches replies to waiting requests by request id.
//! - [`ResilientClient`]: a reconnecting request/reply connection with
//!   heartbeats, failing fast while the remote service is unreachable.
//! - [`SpaceAccountingClient`]: usage events and queries.
//!
//! # Example
//!
//! ```ignore
//! use nimbus_client::{ClientConfig, ResilientClient};
//!
//! let client = ResilientClient::connect(
//!     "node-b".into(),
//!     "tcp://10.0.0.2:8100".parse()?,
//!     ClientConfig::default(),
//! )?;
//! let reply = client.request(request)?;
//! ```

mod backoff;
mod deliverator;
mod error;
mod resilient;
mod space_accounting;
mod transport;

pub use backoff::Backoff;
pub use deliverator::{Completion, Deliverator};
pub use error::{ClientError, ClientResult, CorrelationError};
pub use resilient::{ClientConfig, ConnectionState, ResilientClient};
pub use space_accounting::{SpaceAccountingClient, SpaceUsage};
pub use transport::{DEFAULT_BUFFER_SIZE, Endpoint, FramedStream, Listener, Stream, Transport};
