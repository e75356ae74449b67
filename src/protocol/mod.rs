//! Wire-level message conventions shared by publishers and subscribers

pub mod messages;

pub use messages::*;
