//! Flow-programming runtime: component graphs, a tick scheduler, a debugger
//! session and a sandboxed module bridge.

pub mod config;
pub mod context;
pub mod debug_event;
pub mod debugger;
pub mod expression;
pub mod flow_state;
pub mod graph;
pub mod logging;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod vm;
