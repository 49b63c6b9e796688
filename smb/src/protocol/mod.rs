//! Wire-format types the lease engine exchanges with a server.
//!
//! - `lease`: lease keys and validated lease states.
//! - `body`: the CREATE fields and lease context, and the lease break
//!   notification and acknowledgment payloads ([\[MS-SMB2\] 2.2.23.2, 2.2.24.2, 2.2.25.2](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-smb2/5606ad47-5ee0-437a-817e-70c366052962)).

pub mod body;
pub mod lease;
