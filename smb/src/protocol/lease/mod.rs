pub use key::SMBLeaseKey;
pub use state::{SMBLeaseFlags, SMBLeaseState};

mod key;
mod state;
