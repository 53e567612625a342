//! API Module
//!
//! HTTP surface for cache monitoring and administration.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
