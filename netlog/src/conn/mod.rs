//! TCP connection tracking: flow identity, sequence classification, chunked
//! packet accounting, the per-connection phase machine, and the sharded
//! time-evicting table that holds it all.

pub mod chunk;
pub mod key;
pub mod seq;
pub mod state;
pub mod table;
