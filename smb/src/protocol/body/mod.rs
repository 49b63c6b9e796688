pub mod create;
pub mod lease_break;
