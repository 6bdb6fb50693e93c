pub mod error;
pub mod format;
pub mod native;
pub mod registry;
pub mod traits;
pub mod validation;

// Re-export common types
pub use error::{ToolError, ToolResult};
pub use native::QueryDatabaseTool;
pub use registry::{sanitize, RegistryEntry, ToolRegistry, ToolTarget};
pub use traits::Tool;
