//! Test doubles for exercising the connector without a broker

pub mod mocks;

pub use mocks::*;
