//! Registry and lifecycle management for script-launched game servers.
//!
//! [`ServerManager`] is the entry point. Records live in a JSON registry
//! ([`registry::RegistryStore`]); each running server has a background
//! tracker that notices when its process goes away.

pub mod error;
pub mod launcher;
pub mod mods;
pub mod notify;
pub mod os_process;
pub mod process_manager;
pub mod registry;
pub mod settings;
pub mod tracker;

pub use error::{LaunchError, ManagerError, ModError, TerminationError};
pub use hearth_process::{ServerKey, ServerRecord, ServerStatus};
pub use launcher::{Launcher, ScriptLauncher};
pub use mods::{ModEntry, ModMetadata};
pub use notify::Notifier;
pub use process_manager::{ServerManager, StopReport};
