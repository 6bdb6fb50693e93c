pub mod database;

pub use database::{validate_query, QueryDatabaseTool, QUERY_TOOL_NAME};
