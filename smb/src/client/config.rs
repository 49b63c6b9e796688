use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smb_core::error::SMBError;

use crate::protocol::body::create::lease_context::SMBLeaseVersion;

/// What a lease does with a break when the application has not registered a
/// callback for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SMBBreakPolicy {
    /// Acknowledge exactly the state the server offered.
    #[default]
    AcceptOffered,
    /// Leave the break pending until the application acknowledges it or registers
    /// a callback.
    Defer,
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(name = "SMBClientConfigBuilder", pattern = "owned", default)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct SMBClientConfig {
    client_guid: Uuid,
    lease_version: SMBLeaseVersion,
    break_policy: SMBBreakPolicy,
    /// Bound of the channel between the transport and the break dispatcher.
    notification_capacity: usize,
    /// Drop a lease from the table once no handle, queued job or pending break
    /// refers to it.
    retire_idle_leases: bool,
}

impl Default for SMBClientConfig {
    fn default() -> Self {
        Self {
            client_guid: Uuid::new_v4(),
            lease_version: SMBLeaseVersion::V2,
            break_policy: SMBBreakPolicy::AcceptOffered,
            notification_capacity: 64,
            retire_idle_leases: true,
        }
    }
}

impl SMBClientConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.notification_capacity == Some(0) {
            return Err("notification_capacity must be greater than zero".into());
        }
        Ok(())
    }
}

impl SMBClientConfig {
    pub fn client_guid(&self) -> Uuid {
        self.client_guid
    }

    pub fn lease_version(&self) -> SMBLeaseVersion {
        self.lease_version
    }

    pub fn break_policy(&self) -> SMBBreakPolicy {
        self.break_policy
    }

    pub fn notification_capacity(&self) -> usize {
        self.notification_capacity
    }

    pub fn retire_idle_leases(&self) -> bool {
        self.retire_idle_leases
    }
}

impl From<SMBClientConfigBuilderError> for SMBError {
    fn from(value: SMBClientConfigBuilderError) -> Self {
        SMBError::precondition_failed(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use smb_core::error::SMBErrorKind;

    use super::*;

    #[test]
    fn unset_fields_take_the_defaults() {
        let config = SMBClientConfigBuilder::default()
            .break_policy(SMBBreakPolicy::Defer)
            .build()
            .unwrap();
        assert_eq!(config.break_policy(), SMBBreakPolicy::Defer);
        assert_eq!(config.lease_version(), SMBLeaseVersion::V2);
        assert_eq!(config.notification_capacity(), 64);
        assert!(config.retire_idle_leases());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err: SMBError = SMBClientConfigBuilder::default()
            .notification_capacity(0)
            .build()
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), SMBErrorKind::Usage);
        assert!(err.to_string().contains("notification_capacity"));
    }
}
