//! Core types for the RIO field agent.
//!
//! This crate defines the foundational abstractions shared by every
//! subsystem: the dynamic [`Value`] model, the typed command grammar,
//! management messages, the process-wide knowledge store, agent settings,
//! and the notification bus.

pub mod command;
pub mod knowledge;
pub mod message;
pub mod notify;
pub mod settings;
pub mod template;
pub mod value;

pub use command::{Command, CommandError, Execution, ParamType, ParameterDefinition};
pub use knowledge::Knowledge;
pub use message::{Message, MessageType};
pub use notify::{Notification, NotifyBus, NotifyReceiver, DEFAULT_NOTIFY_CAPACITY};
pub use settings::{
    AdminSettings, BrokerSettings, FeatureConfig, GeoLocation, Settings, SettingsStore,
};
pub use template::expand_template;
pub use value::{Value, ValueMap};

/// Reserved target identifier for commands handled by the agent itself.
pub const SYSTEM_TARGET: &str = "RIO";

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::command::{Command, CommandError, Execution, ParamType, ParameterDefinition};
    pub use crate::knowledge::Knowledge;
    pub use crate::message::{Message, MessageType};
    pub use crate::notify::{Notification, NotifyBus};
    pub use crate::settings::{FeatureConfig, Settings, SettingsStore};
    pub use crate::value::{Value, ValueMap};
    pub use crate::SYSTEM_TARGET;
}
