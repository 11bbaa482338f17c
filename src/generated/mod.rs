//! Generated protobuf and gRPC bindings.
//!
//! Regenerate with `cargo build --features regenerate-proto`.

pub mod plugin;
pub mod tfplugin5;
