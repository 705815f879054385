//! Offline reconstruction of streamed heap graphs: interning and typed
//! column storage, reachability and root distances, superclass resolution,
//! and folding retention into flamegraph rows.

pub mod flamegraph;
pub mod storage;
pub mod tracker;
