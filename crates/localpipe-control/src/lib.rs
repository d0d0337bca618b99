//! Task lifecycle control for tunnel components
//!
//! Acceptors, connectors and relay sessions never spawn onto a global runtime
//! handle directly. They receive a [`TaskScope`] from their owner, so that the
//! owner decides when every background task belonging to it is torn down.

pub mod task_scope;

pub use task_scope::TaskScope;
