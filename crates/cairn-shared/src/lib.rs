//! Shared types, crypto primitives and capability traits for Cairn.

pub mod capability;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod locks;
pub mod protocol;
pub mod types;
pub mod wallet;
