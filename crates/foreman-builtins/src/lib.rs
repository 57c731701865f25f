//! Builtin capabilities for the Foreman pipeline.
//!
//! All builtins operate inside a [`WorkspaceRoot`]: relative paths resolve
//! against it and nothing may escape it. They declare the resources they
//! touch, so a registry without the matching grant refuses to run them.
//!
//! # Main entry points
//!
//! - [`register_builtins()`] — Register every builtin into a registry.

/// `read_file`.
pub mod file_read;
/// `write_file`.
pub mod file_write;
/// `list_files`.
pub mod list_files;
/// Workspace path resolution and directory walking.
pub mod root;
/// `search_code`.
pub mod search_code;
/// `run_command`.
pub mod shell;

pub use file_read::ReadFile;
pub use file_write::WriteFile;
pub use list_files::ListFiles;
pub use root::WorkspaceRoot;
pub use search_code::SearchCode;
pub use shell::RunCommand;

use foreman_core::ForemanResult;
use foreman_skills::{CapabilityRegistry, RegisterMode};
use std::sync::Arc;

/// Register all builtins into `registry`. Returns the number registered.
pub fn register_builtins(registry: &CapabilityRegistry, root: WorkspaceRoot) -> ForemanResult<usize> {
    registry.register(Arc::new(ReadFile::new(root.clone())), RegisterMode::Overwrite)?;
    registry.register(Arc::new(WriteFile::new(root.clone())), RegisterMode::Overwrite)?;
    registry.register(Arc::new(ListFiles::new(root.clone())), RegisterMode::Overwrite)?;
    registry.register(Arc::new(SearchCode::new(root.clone())), RegisterMode::Overwrite)?;
    registry.register(Arc::new(RunCommand::new(root)), RegisterMode::Overwrite)?;
    Ok(5)
}
