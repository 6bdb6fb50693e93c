/// Tool provider protocol
///
/// Line-delimited JSON-RPC over a provider process's stdio.
///
/// Architecture:
/// - `session`: stream ownership, request/response correlation, teardown
/// - `client`: startup sequence (probe, initialize, discovery) and tool calls
/// - `manager`: the set of connected providers
/// - `types`: wire types and errors
pub mod client;
pub mod manager;
pub mod session;
pub mod types;

pub use client::{McpClient, ProviderCallResult};
pub use manager::ProviderManager;
pub use session::ProviderSession;
pub use types::{
    McpError, ProviderConfig, ToolDescriptor, DEFAULT_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
