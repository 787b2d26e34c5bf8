//! Passive network transaction observer.
//!
//! Reconstructs per-connection TCP state and HTTP/1.1, HTTP/2, and gRPC
//! request/response exchanges from captured link-layer packets, including
//! VXLAN-encapsulated traffic, and exports chunked TCP records, exchange
//! records, and windowed flow aggregates.

pub mod agg;
pub mod capture;
pub mod cli;
pub mod config;
pub mod conn;
pub mod error;
pub mod export;
pub mod filter;
pub mod http;
pub mod inventory;
pub mod listen;
pub mod packet;
pub mod recorder;
