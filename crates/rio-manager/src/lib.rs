//! Feature/task registry and module manager.
//!
//! Plugins implement [`Feature`] (descriptor + task factory) and register
//! in the compile-time [`PluginRegistry`]; the [`Manager`] binds them to
//! settings, owns the running [`Task`]s, and answers every lifecycle and
//! command-table operation. [`dispatch::execute`] is the single entry
//! point for running commands, delayed or not.

pub mod dispatch;
pub mod error;
pub mod feature;
pub mod manager;
pub mod registry;
pub mod simulator;

pub use dispatch::{dispatch_execution, execute};
pub use error::ManagerError;
pub use feature::{Feature, PropertyDefinition, Task};
pub use manager::{Manager, ShutdownOutcome, SHUTDOWN_ARM_WINDOW};
pub use registry::PluginRegistry;
pub use simulator::{SimulatorFeature, SIMULATOR_TYPE};
