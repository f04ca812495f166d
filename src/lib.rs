//! flowtree: an execution-tree engine for BPMN-style process definitions.
//!
//! Process definitions are written with the [`dsl`] types (or loaded from YAML),
//! validated by the [`compiler`] into a [`runtime::graph::ProcessGraph`], and driven
//! by the [`runtime::engine::Engine`] one command at a time.

pub mod behaviors;
pub mod compiler;
pub mod dsl;
pub mod handlers;
pub mod runtime;
