//! Chain B bridge contract bindings.

pub mod chain_b;

pub use chain_b::BridgeB;
