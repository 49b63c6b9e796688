//! Logging front-end shared by the workspace crates.
//!
//! With the `tracing` feature the macros are the ones from the `tracing` crate, so
//! structured fields (`key = %key`) and subscribers work as usual. Without it every
//! macro expands to `()` and the arguments are never evaluated.

#[cfg(feature = "tracing")]
pub use tracing::{trace, debug, info, warn, error};

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! trace {
    ($($t:tt)*) => {()};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => {()};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! info {
    ($($t:tt)*) => {()};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => {()};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! error {
    ($($t:tt)*) => {()};
}

#[cfg(not(feature = "tracing"))]
pub use crate::{trace, debug, info, warn, error};
