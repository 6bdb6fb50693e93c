//! Minimal stdio tool provider used by the integration tests.
//!
//! Serves `echo`, `fetch price` and `fail` over line-delimited JSON-RPC.
//! Writes a plain-text banner and a dev-mode notification first, like many
//! real providers do. With `ECHO_PROVIDER_SILENT=1` it reads requests but
//! never answers.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let silent = std::env::var("ECHO_PROVIDER_SILENT").map(|v| v == "1").unwrap_or(false);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if !silent {
        stdout.write_all(b"echo provider listening on stdio\n").await?;
        let banner = json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info", "data": "Running in development mode"}
        });
        write_line(&mut stdout, &banner).await?;
    }

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring non-JSON input");
            continue;
        };
        if silent {
            continue;
        }
        // Notifications carry no id and get no reply
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match handle(method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, text)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": text}})
            }
        };
        write_line(&mut stdout, &reply).await?;
    }

    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &Value) -> std::io::Result<()> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    stdout.write_all(&bytes).await?;
    stdout.flush().await
}

fn handle(method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => {
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or("2024-11-05");
            Ok(json!({
                "protocolVersion": version,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "echo", "version": "0.1.0"}
            }))
        }
        "tools/list" => Ok(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echo the given text",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }
                },
                {
                    "name": "fetch price",
                    "description": "Latest price for a symbol",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "symbol": {"type": "string"},
                            "limit": {"type": "string"}
                        },
                        "required": ["symbol"]
                    }
                },
                {
                    "name": "fail",
                    "description": "Always reports an error result",
                    "inputSchema": {"type": "object", "properties": {}}
                }
            ]
        })),
        "tools/call" => call_tool(params),
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = arguments.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(json!({"content": [{"type": "text", "text": text}]}))
        }
        "fetch price" => {
            let symbol = arguments.get("symbol").and_then(Value::as_str).unwrap_or("");
            let limit = arguments.get("limit").cloned().unwrap_or(Value::Null);
            let rows = json!([{"symbol": symbol, "price": 42000, "limit": limit}]);
            Ok(json!({"content": [{"type": "text", "text": rows.to_string()}]}))
        }
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "upstream unavailable"}],
            "isError": true
        })),
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}
