use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use smb_core::logging::{debug, info, warn};

use crate::client::lease_table::{SMBDispatchOutcome, SMBLeaseTable};
use crate::protocol::body::lease_break::{SMBLeaseBreakAcknowledgement, SMBLeaseBreakNotification};
use crate::transport::SMBLeaseTransport;

/// Drains the transport's break notifications, in arrival order, onto the lease
/// table until cancelled or until the transport drops its end of the channel.
pub(crate) fn spawn<T: SMBLeaseTransport>(
    table: Arc<SMBLeaseTable<T>>,
    transport: Arc<T>,
    notifications: Receiver<SMBLeaseBreakNotification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = ReceiverStream::new(notifications);
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                next = notifications.next() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            debug!(key = %notification.lease_key(), "lease break received");
            if let SMBDispatchOutcome::Unknown(notification) = table.dispatch(notification).await {
                acknowledge_orphan(transport.clone(), notification);
            }
        }
        info!("lease break dispatcher stopped");
    })
}

/// A break for a key this session no longer tracks still owes the server an
/// answer. Acknowledge exactly what was offered.
fn acknowledge_orphan<T: SMBLeaseTransport>(transport: Arc<T>, notification: SMBLeaseBreakNotification) {
    let key = notification.lease_key();
    if !notification.ack_required() {
        debug!(key = %key, "dropping break for unknown lease");
        return;
    }
    let offered = match notification.new_lease_state() {
        Ok(state) => state,
        Err(e) => {
            warn!(key = %key, "not acknowledging break for unknown lease: {}", e);
            return;
        }
    };
    warn!(key = %key, "acknowledging break for unknown lease with {}", offered);
    tokio::spawn(async move {
        let ack = SMBLeaseBreakAcknowledgement::new(key, offered);
        if let Err(e) = transport.send_lease_ack(ack).await {
            warn!(key = %key, "acknowledgment for unknown lease failed: {}", e);
        }
    });
}
