//! # SMB Lease
//!
//! The client-side lease engine of an SMB2 client, following the leasing rules of
//! [\[MS-SMB2\]](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-smb2/5606ad47-5ee0-437a-817e-70c366052962).
//!
//! Leases let a client cache reads, writes and open handles for a remote file. The
//! server can break a lease at any time and waits for the client to acknowledge
//! the lower state before letting a conflicting open proceed. This crate provides:
//! - **Protocol layer** ([`protocol`]): lease keys, validated lease states and the
//!   lease payloads (create context, break notification, break acknowledgment).
//! - **Client layer** ([`client`]): lease objects shared by every handle opened with
//!   the same key, the session-wide lease table, and a dispatcher that serializes
//!   breaks per lease.
//! - **Transport layer** ([`transport`]): the trait a connection implements to carry
//!   lease traffic, and an in-process loopback server for tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use smb_lease::client::{SMBClientConfig, SMBClientSession};
//! use smb_lease::protocol::lease::SMBLeaseState;
//! use smb_lease::transport::SMBLoopbackTransport;
//!
//! #[tokio::main]
//! async fn main() -> smb_core::SMBResult<()> {
//!     let transport = Arc::new(SMBLoopbackTransport::new());
//!     let session = SMBClientSession::start(transport, SMBClientConfig::default())?;
//!     let handle = session.open("report.txt", SMBLeaseState::RWH).await?;
//!     if let Some(lease) = handle.lease() {
//!         lease.on_break(|offered| offered.intersection(SMBLeaseState::R))?;
//!     }
//!     session.close(&handle).await
//! }
//! ```

/// Wire-format types: lease keys and states, create and lease break payloads.
pub mod protocol;
/// Lease objects, the lease table, the break dispatcher and the session.
pub mod client;
/// The transport seam and the loopback implementation.
pub mod transport;
mod util;
