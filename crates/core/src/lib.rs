//! Concurrent client sessions for a versioning server.
//!
//! A [`Session`] owns one logical connection and runs identified commands on
//! it from any number of threads. Output streams back per command through
//! channel subscriptions and stays readable in the [`CommandRegistry`] until
//! released. The session reconnects when its configuration changes, drops the
//! connection after an idle period, and fans `--parallel` transfers out to
//! worker connections.
//!
//! The wire protocol is not implemented here. A [`Connector`] opens
//! [`Transport`]s; [`FakeServer`] is an in-memory implementation used by the
//! tests and usable by downstream tests.

pub mod broadcast;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod parallel;
pub mod pool;
pub mod registry;
pub mod results;
pub mod session;
pub mod transport;

pub use broadcast::{ResultBroadcaster, SubscriptionHandle};
pub use command::{Command, CommandResult};
pub use config::{ConfigField, ConfigSnapshot, ConfigValues, ConnectionConfig, TrustPolicy};
pub use credentials::{Credential, CredentialStore, LoginOptions, LogoutOptions, MemoryCredentialStore, TicketFileStore};
pub use error::{AuthFailure, CallbackError, ConnectFailure, Error, Result};
pub use p4_protocol::{ClientError, ErrorSeverity, InfoMessage, ReplyChannel, ServerProtocol, ServerReply, TaggedRecord, TransferPlan, codes};
pub use parallel::{ParallelOptions, ParallelTransferCallback, TransferBatch, TransferDecision};
pub use pool::SessionPool;
pub use registry::{CancelToken, CommandHandle, CommandId, CommandRegistry, CommandState};
pub use results::{ErrorKind, ErrorRecord, ResultBundle, ResultEvent};
pub use session::{PromptHandler, PromptRequest, Session, SessionBuilder, SessionState};
pub use transport::{CommandIo, CommandRequest, Connection, Connector, FakeServer, Flow, Transport};
