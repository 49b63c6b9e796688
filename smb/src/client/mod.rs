//! The client side of SMB2 leasing: shared lease objects, the session-wide lease
//! table, the break dispatcher and the session that ties them to a transport.

pub use config::{SMBBreakPolicy, SMBClientConfig, SMBClientConfigBuilder, SMBClientConfigBuilderError};
pub use lease::{SMBBreakCallback, SMBBreakWaiter, SMBLease, SMBLeaseBreakState, SMBLeaseFailure, SMBLeaseStatus};
pub use lease_table::{SMBDispatchOutcome, SMBLeaseTable};
pub use open::{SMBHandle, SMBHandleId};
pub use session::SMBClientSession;

mod break_dispatcher;
mod config;
mod lease;
mod lease_table;
mod open;
mod session;
