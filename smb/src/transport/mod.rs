use std::future::Future;

use tokio::sync::mpsc::Sender;

use smb_core::SMBResult;

use crate::protocol::body::create::{SMBCreateRequest, SMBCreateResponse};
use crate::protocol::body::create::file_id::SMBFileId;
use crate::protocol::body::lease_break::{SMBLeaseBreakAcknowledgement, SMBLeaseBreakNotification, SMBLeaseBreakResponse};

pub use loopback::SMBLoopbackTransport;

mod loopback;

/// The request/response side of an SMB2 connection, as far as leasing is concerned.
///
/// Implementations own framing, signing, credits and message-id correlation. Calls
/// may be issued concurrently from several tasks; each future resolves with the
/// server's answer to that one request. A non-success NT status comes back as
/// [`smb_core::error::SMBError::ResponseError`].
pub trait SMBLeaseTransport: Send + Sync + 'static {
    fn send_create(&self, request: SMBCreateRequest) -> impl Future<Output=SMBResult<SMBCreateResponse>> + Send;

    fn send_close(&self, file_id: SMBFileId) -> impl Future<Output=SMBResult<()>> + Send;

    fn send_lease_ack(&self, ack: SMBLeaseBreakAcknowledgement) -> impl Future<Output=SMBResult<SMBLeaseBreakResponse>> + Send;

    /// Registers the channel unsolicited lease break notifications are pushed into,
    /// in the order the server sent them. Replaces any earlier subscription.
    fn subscribe_breaks(&self, sink: Sender<SMBLeaseBreakNotification>) -> SMBResult<()>;
}
