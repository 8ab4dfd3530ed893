//! Reconciliation core
//!
//! Everything between the caches and the proxy manager: the task queue,
//! fragment resolution, master/minion and VirtualServer merging, config
//! assembly and the configurator that owns the applied state.

pub mod annotations;
pub mod assembler;
pub mod cache;
pub mod configurator;
pub mod fragment;
pub mod merge;
pub mod params;
pub mod reporter;
pub mod resolver;
pub mod secrets;
pub mod task_queue;
pub mod virtualserver;
pub mod vs_assembler;
