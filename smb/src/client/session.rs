use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use smb_core::error::SMBError;
use smb_core::logging::{debug, info, warn};
use smb_core::SMBResult;

use crate::client::break_dispatcher;
use crate::client::config::SMBClientConfig;
use crate::client::lease::SMBLease;
use crate::client::lease_table::SMBLeaseTable;
use crate::client::open::{SMBHandle, SMBHandleId};
use crate::protocol::body::create::{SMBCreateRequest, SMBCreateResponse};
use crate::protocol::lease::{SMBLeaseKey, SMBLeaseState};
use crate::transport::SMBLeaseTransport;

/// Application entry point: opens and closes files with leases over one
/// transport and keeps every lease coherent with the server's breaks.
#[derive(Debug)]
pub struct SMBClientSession<T: SMBLeaseTransport> {
    transport: Arc<T>,
    config: SMBClientConfig,
    table: Arc<SMBLeaseTable<T>>,
    next_handle_id: AtomicU64,
    file_keys: Mutex<HashMap<String, SMBLeaseKey>>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SMBLeaseTransport> SMBClientSession<T> {
    /// Subscribes to the transport's break notifications and starts the break
    /// dispatcher. Must be called from within a Tokio runtime.
    pub fn start(transport: Arc<T>, config: SMBClientConfig) -> SMBResult<Self> {
        let (sink, notifications) = mpsc::channel(config.notification_capacity());
        transport.subscribe_breaks(sink)?;
        let table = SMBLeaseTable::new(transport.clone(), config.break_policy(), config.retire_idle_leases());
        let cancel = CancellationToken::new();
        let dispatcher = break_dispatcher::spawn(table.clone(), transport.clone(), notifications, cancel.clone());
        info!(client_guid = %config.client_guid(), "lease session started");
        Ok(Self {
            transport,
            config,
            table,
            next_handle_id: AtomicU64::new(1),
            file_keys: Mutex::new(HashMap::new()),
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn config(&self) -> &SMBClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn lease_table(&self) -> &Arc<SMBLeaseTable<T>> {
        &self.table
    }

    /// Opens `file_name` asking for `desired`. Every open of the same file name
    /// through this session shares one lease key.
    pub async fn open(&self, file_name: &str, desired: SMBLeaseState) -> SMBResult<SMBHandle<T>> {
        let key = *self.file_keys.lock().await
            .entry(file_name.to_string())
            .or_insert_with(SMBLeaseKey::random);
        self.open_with_key(file_name, key, desired).await
    }

    /// Opens `file_name` under an explicit lease key. Asking for
    /// [`SMBLeaseState::NONE`] opens without a lease.
    pub async fn open_with_key(&self, file_name: &str, key: SMBLeaseKey, desired: SMBLeaseState) -> SMBResult<SMBHandle<T>> {
        let id = SMBHandleId::new(self.next_handle_id.fetch_add(1, Ordering::SeqCst));
        if desired.is_none() {
            let response = self.transport.send_create(SMBCreateRequest::without_lease(file_name)).await?;
            return Ok(SMBHandle::new(id, response.file_id(), file_name.into(), response.oplock_level(), None));
        }

        let lease = self.table.attach(id, key).await;
        let request = SMBCreateRequest::with_lease(file_name, self.config.lease_version(), key, desired);
        let response = match self.transport.send_create(request).await {
            Ok(response) => response,
            Err(e) => {
                self.table.detach(id).await;
                return Err(e);
            }
        };
        match self.accept_grant(&lease, key, &response).await {
            Ok(true) => {
                debug!(key = %key, "opened {} as {} with lease {}", file_name, id, lease.state());
                Ok(SMBHandle::new(id, response.file_id(), file_name.into(), response.oplock_level(), Some(lease)))
            }
            Ok(false) => {
                debug!(key = %key, "opened {} as {} without a lease", file_name, id);
                self.table.detach(id).await;
                Ok(SMBHandle::new(id, response.file_id(), file_name.into(), response.oplock_level(), None))
            }
            Err(e) => {
                warn!(key = %key, "rejecting lease granted on {}: {}", file_name, e);
                if let Err(close_error) = self.transport.send_close(response.file_id()).await {
                    debug!("closing rejected open failed: {}", close_error);
                }
                self.table.detach(id).await;
                Err(e)
            }
        }
    }

    /// Validates the lease in `response` and applies it. `Ok(false)` when the
    /// server granted no lease.
    async fn accept_grant(&self, lease: &Arc<SMBLease<T>>, key: SMBLeaseKey, response: &SMBCreateResponse) -> SMBResult<bool> {
        let Some(context) = response.granted_lease()? else {
            return Ok(false);
        };
        if context.lease_key() != key {
            return Err(SMBError::protocol_violation(format!(
                "asked for lease {} but was granted {}", key, context.lease_key()
            )));
        }
        let granted = context.lease_state()?;
        lease.apply_grant(granted, context.epoch()).await?;
        Ok(true)
    }

    /// Closes `handle`. Closing the same handle twice is an error; a close the
    /// transport failed to deliver can be retried.
    pub async fn close(&self, handle: &SMBHandle<T>) -> SMBResult<()> {
        if handle.mark_closed() {
            return Err(SMBError::precondition_failed(format!("handle {} is already closed", handle.id())));
        }
        if let Err(e) = self.transport.send_close(handle.file_id()).await {
            handle.clear_closed();
            return Err(e);
        }
        if handle.lease().is_some() {
            self.table.detach(handle.id()).await;
        }
        debug!("closed {} ({})", handle.id(), handle.file_name());
        Ok(())
    }

    /// The lease currently registered for `key`, if any.
    pub async fn lease(&self, key: SMBLeaseKey) -> Option<Arc<SMBLease<T>>> {
        self.table.lookup(key).await
    }

    /// Stops the break dispatcher. Leases keep working for acknowledgments the
    /// application still sends itself.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("lease break dispatcher ended abnormally: {}", e);
            }
        }
        info!("lease session shut down");
    }
}

impl<T: SMBLeaseTransport> Drop for SMBClientSession<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
