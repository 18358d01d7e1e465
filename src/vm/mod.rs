//! Interpreter bridge (spec §4.7): a stable façade over the embedded VM.
//!
//! The VM is treated as opaque: module import by name, attribute get/set,
//! callable invocation, value marshalling, and exception capture, all
//! serialized by one process-wide lock. `mlua`'s `send` feature is what
//! makes parking the VM handle in an `Arc<Mutex<_>>` and moving it between
//! the caller thread and per-root worker threads sound — the same shape the
//! teacher uses for `Arc<Mutex<Demodulator>>` guarding hardware state shared
//! between a receiver thread and the UI thread.

mod bridge;

pub use bridge::Vm;
