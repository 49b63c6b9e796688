use std::sync::Arc;

use smb_lease::client::{SMBClientConfigBuilder, SMBClientSession};
use smb_lease::protocol::lease::{SMBLeaseFlags, SMBLeaseKey, SMBLeaseState};
use smb_lease::transport::SMBLoopbackTransport;

const FILE_NAME: &str = "lease.txt";

/// Upgrades a lease from RW to RWH through a second open, then lets an open with
/// another key break it while the first lease gives up handle caching.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let transport = Arc::new(SMBLoopbackTransport::new());
    let config = SMBClientConfigBuilder::default().build()?;
    let session = Arc::new(SMBClientSession::start(transport.clone(), config)?);

    let first_key = SMBLeaseKey::random();
    let second_key = SMBLeaseKey::random();

    let handle1 = session.open_with_key(FILE_NAME, first_key, SMBLeaseState::RW).await?;
    println!("handle {} opened with {}", handle1.id(), handle1.lease_state());
    let handle2 = session.open_with_key(FILE_NAME, first_key, SMBLeaseState::RWH).await?;
    println!("handle {} upgraded the lease to {}", handle2.id(), handle2.lease_state());

    let lease = handle2.lease()
        .ok_or_else(|| anyhow::anyhow!("server granted no lease"))?
        .clone();
    lease.on_break(|offered| offered.without(SMBLeaseFlags::HANDLE_CACHING))?;
    let mut waiter = lease.break_waiter();

    let handle3 = session.open_with_key(FILE_NAME, second_key, SMBLeaseState::RWH).await?;
    let resolved = waiter.resolved().await?;
    println!("first lease broke to {} (server holds {:?})", resolved, transport.lease_state(first_key));
    println!("handle {} opened with {}", handle3.id(), handle3.lease_state());

    for handle in [&handle1, &handle2, &handle3] {
        session.close(handle).await?;
    }
    println!("{} leases left in the table", session.lease_table().len().await);
    session.shutdown().await;
    Ok(())
}
