use crate::tools::{Tool, ToolError, ToolResult};
use crate::BridgeError;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const QUERY_TOOL_NAME: &str = "query_database";

const READ_ONLY_PREFIXES: &[&str] = &["SELECT", "WITH"];

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM",
];

// Schema discovery

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

fn load_schemas(conn: &Connection) -> rusqlite::Result<Vec<TableSchema>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut schemas = Vec::with_capacity(tables.len());
    for table in tables {
        let mut info = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let columns = info
            .query_map([&table], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        schemas.push(TableSchema {
            name: table,
            columns,
        });
    }

    Ok(schemas)
}

// Read-only gate

/// Blank out comments, literals and quoted identifiers so keyword checks
/// only see SQL
fn mask_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' | '[' => {
                let quote = if c == '[' { ']' } else { c };
                out.push(' ');
                for inner in chars.by_ref() {
                    if inner == quote {
                        break;
                    }
                }
                // A doubled quote is an escape; the loop above treats it as
                // close-then-open, which masks the same span.
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            other => out.push(other),
        }
    }

    out
}

/// Upper-cased words, each flagged when the next token is `(`
fn keywords(statement: &str) -> Vec<(String, bool)> {
    let mut words = Vec::new();
    let mut rest = statement;

    while let Some(start) = rest.find(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        let tail = &rest[start..];
        let end = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        let called = tail[end..].trim_start().starts_with('(');
        words.push((tail[..end].to_ascii_uppercase(), called));
        rest = &tail[end..];
    }

    words
}

/// Accept a single read-only statement, reject everything else
pub fn validate_query(sql: &str) -> ToolResult<()> {
    let masked = mask_sql(sql);
    let statement = masked.trim().trim_end_matches(';').trim();

    if statement.is_empty() {
        return Err(ToolError::invalid(QUERY_TOOL_NAME, "query is empty"));
    }

    if statement.contains(';') {
        return Err(ToolError::PermissionDenied(
            "only a single statement is allowed".to_string(),
        ));
    }

    let words = keywords(statement);

    let first = words.first().map(|(w, _)| w.as_str()).unwrap_or_default();
    if !READ_ONLY_PREFIXES.contains(&first) {
        return Err(ToolError::PermissionDenied(format!(
            "only read-only queries are allowed, got '{}'",
            first
        )));
    }

    // `replace(...)` is a string function, not the write verb
    let write = words.iter().find(|(w, called)| {
        WRITE_KEYWORDS.contains(&w.as_str()) && !(w == "REPLACE" && *called)
    });
    if let Some((word, _)) = write {
        return Err(ToolError::PermissionDenied(format!(
            "write keyword '{}' is not allowed",
            word
        )));
    }

    Ok(())
}

/// Built-in read-only SQL tool over one shared SQLite connection
pub struct QueryDatabaseTool {
    connection: Arc<Mutex<Connection>>,
    schemas: Vec<TableSchema>,
}

impl QueryDatabaseTool {
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let connection = Connection::open(path).map_err(|e| {
            BridgeError::Database(format!("failed to open {}: {}", path.display(), e))
        })?;
        let tool = Self::from_connection(connection)?;
        info!(
            target: "query_tool",
            path = %path.display(),
            tables = tool.schemas.len(),
            "Opened query database"
        );
        Ok(tool)
    }

    pub fn open_in_memory() -> crate::Result<Self> {
        let connection = Connection::open_in_memory()
            .map_err(|e| BridgeError::Database(format!("failed to open in-memory database: {}", e)))?;
        Self::from_connection(connection)
    }

    pub fn from_connection(connection: Connection) -> crate::Result<Self> {
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|e| BridgeError::Database(format!("failed to configure busy timeout: {}", e)))?;
        let schemas = load_schemas(&connection)
            .map_err(|e| BridgeError::Database(format!("failed to load schemas: {}", e)))?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            schemas,
        })
    }

    pub fn schemas(&self) -> &[TableSchema] {
        &self.schemas
    }

    /// Run a validated query on the blocking pool
    pub async fn query(&self, sql: &str) -> ToolResult<Vec<Map<String, Value>>> {
        validate_query(sql)?;

        let connection = Arc::clone(&self.connection);
        let sql = sql.to_string();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = lock(&connection)?;
            run_query(&conn, &sql)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("query task failed: {}", e)))??;

        debug!(target: "query_tool", rows = rows.len(), "Query finished");
        Ok(rows)
    }
}

fn lock(connection: &Mutex<Connection>) -> ToolResult<MutexGuard<'_, Connection>> {
    connection
        .lock()
        .map_err(|_| ToolError::ExecutionFailed("database lock poisoned".to_string()))
}

fn run_query(conn: &Connection, sql: &str) -> ToolResult<Vec<Map<String, Value>>> {
    let failed = |e: rusqlite::Error| ToolError::ExecutionFailed(format!("query failed: {}", e));

    let mut stmt = conn.prepare(sql).map_err(failed)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

    let mut rows = stmt.query([]).map_err(failed)?;
    let mut records = Vec::new();

    while let Some(row) = rows.next().map_err(failed)? {
        let mut record = Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = match row.get_ref(i).map_err(failed)? {
                ValueRef::Null => continue,
                ValueRef::Integer(n) => json!(n),
                ValueRef::Real(f) => json!(f),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    Value::String(String::from_utf8_lossy(bytes).into_owned())
                }
            };
            record.insert(column.clone(), value);
        }
        records.push(record);
    }

    Ok(records)
}

#[async_trait]
impl Tool for QueryDatabaseTool {
    fn name(&self) -> String {
        QUERY_TOOL_NAME.to_string()
    }

    fn description(&self) -> String {
        let mut description =
            "Execute a read-only SQL query (SELECT or WITH) against the database.".to_string();
        if !self.schemas.is_empty() {
            description.push_str(" Available schemas:");
            for table in &self.schemas {
                description.push_str(&format!("\nTable {}:", table.name));
                for column in &table.columns {
                    description.push_str(&format!("\n  - {} ({})", column.name, column.data_type));
                }
            }
        }
        description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "SQL query to execute"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, arguments: Value) -> ToolResult<Value> {
        let sql = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::invalid(QUERY_TOOL_NAME, "missing 'query' argument"))?;

        let rows = self.query(sql).await.map_err(|e| {
            warn!(target: "query_tool", error = %e, "Query rejected or failed");
            e
        })?;

        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }
}
