//! Sandboxed execution of a compiled graph behind a byte-frame boundary.
//!
//! The module owns its own scheduler and linear memory. The host talks to it
//! only through [`bridge::VmBridge`], using the frames in [`protocol`].

pub mod bridge;
pub mod memory;
pub mod module;
pub mod protocol;
pub mod trace;
pub mod value_codec;

pub use bridge::VmBridge;
pub use module::{compile_project, FlowModule, GraphModule, ModuleOptions};
