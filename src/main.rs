use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use ghidra_headless_mcp::artifact::{AnalysisArtifact, FunctionIndex};
use ghidra_headless_mcp::batch::BatchProcessor;
use ghidra_headless_mcp::cache::{CacheScope, CacheStore};
use ghidra_headless_mcp::config::{platform_info, GhidraConfig};
use ghidra_headless_mcp::error::AnalysisError;
use ghidra_headless_mcp::ghidra_headless::{AnalysisRunner, GhidraHeadless, DUMP_SCRIPT};
use ghidra_headless_mcp::orchestrator::AnalysisOrchestrator;
use ghidra_headless_mcp::session::SessionRegistry;

#[derive(Debug, Deserialize)]
struct McpRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct McpResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<McpError>,
}

#[derive(Debug, Serialize)]
struct McpError {
    code: i32,
    message: String,
}

/// 解析系ツールの実体（Ghidraが見つかった場合のみ生きる）
struct AnalysisHandles {
    orchestrator: Arc<AnalysisOrchestrator>,
    batch: BatchProcessor,
}

struct ServerState {
    config: GhidraConfig,
    cache: Arc<CacheStore>,
    session: Arc<SessionRegistry>,
    analysis: Option<AnalysisHandles>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdoutはMCPプロトコル専用。ログは必ずstderrへ
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("🦀 Ghidra Headless MCP Server starting...");

    let config = GhidraConfig::detect();
    let cache = Arc::new(CacheStore::new(config.cache_dir.clone())?);
    let session = Arc::new(SessionRegistry::new());

    let analysis = match GhidraHeadless::new(&config) {
        Ok(runner) => {
            info!(
                "✅ Ghidra Headless enabled at: {}",
                config
                    .headless_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            let orchestrator = Arc::new(
                AnalysisOrchestrator::new(
                    Arc::new(runner) as Arc<dyn AnalysisRunner>,
                    Arc::clone(&cache),
                    Arc::clone(&session),
                )
                .with_safe_dir(config.safe_dir.clone()),
            );
            let batch = BatchProcessor::new(Arc::clone(&orchestrator), config.batch_concurrency);
            Some(AnalysisHandles {
                orchestrator,
                batch,
            })
        }
        Err(e) => {
            info!("⚠️  Analysis tools disabled: {}", e);
            None
        }
    };

    if let Some(dir) = &config.safe_dir {
        info!("Analysis restricted to: {}", dir.display());
    }
    info!("Cache directory: {}", config.cache_dir.display());

    let state = Arc::new(ServerState {
        config,
        cache,
        session,
        analysis,
    });

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    info!("✅ Server ready ({} cached binaries)", state.cache.cached_count());

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match process_request(&line, Arc::clone(&state)).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!("Request processing error: {}", e);
                        McpResponse {
                            jsonrpc: "2.0".to_string(),
                            id: None,
                            result: None,
                            error: Some(McpError {
                                code: -32603,
                                message: e.to_string(),
                            }),
                        }
                    }
                };

                let response_str = serde_json::to_string(&response)?;
                stdout.write_all(response_str.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    info!("Server shutting down");
    Ok(())
}

async fn process_request(request_str: &str, state: Arc<ServerState>) -> Result<McpResponse> {
    let request: McpRequest = serde_json::from_str(request_str)?;

    info!("Processing method: {}", request.method);

    let result = match request.method.as_str() {
        "initialize" => handle_initialize(),
        "tools/list" => handle_list_tools(),
        "tools/call" => handle_tool_call(request.params, state).await?,
        // 通知はレスポンス不要だが、行単位プロトコルなので空resultで流す
        "notifications/initialized" => json!({}),
        _ => {
            return Ok(McpResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(McpError {
                    code: -32601,
                    message: format!("Method not found: {}", request.method),
                }),
            });
        }
    };

    Ok(McpResponse {
        jsonrpc: "2.0".to_string(),
        id: request.id,
        result: Some(result),
        error: None,
    })
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "ghidra-headless-mcp",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Ghidra headless analysis with content-addressed caching"
        }
    })
}

fn handle_list_tools() -> Value {
    let tools = vec![
        json!({
            "name": "analyze_binary",
            "description": "バイナリをGhidraで解析する。内容ハッシュでキャッシュされ、同一内容の再解析はスキップされる",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {
                        "type": "string",
                        "description": "解析対象バイナリのパス"
                    },
                    "force": {
                        "type": "boolean",
                        "description": "キャッシュを無視して再解析する",
                        "default": false
                    }
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "analyze_binaries",
            "description": "複数バイナリを並行解析する（同時実行数は制限付き）。1件の失敗は他をキャンセルしない",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_paths": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "解析対象バイナリのパス一覧"
                    }
                },
                "required": ["binary_paths"]
            }
        }),
        json!({
            "name": "analyze_folder",
            "description": "フォルダを再帰走査してバイナリを一括解析する。extensions未指定時はマジックバイトで実行形式を判定",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "folder_path": {
                        "type": "string",
                        "description": "走査するフォルダ"
                    },
                    "extensions": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "対象拡張子（例: [\"exe\", \"dll\"]）。省略時はマジックバイト判定"
                    }
                },
                "required": ["folder_path"]
            }
        }),
        json!({
            "name": "list_functions",
            "description": "解析済みバイナリの関数一覧（名前とエントリアドレス）",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"},
                    "limit": {
                        "type": "integer",
                        "description": "最大件数",
                        "default": 300
                    }
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "read_function_code",
            "description": "関数のデコンパイル済みCコードを取得。名前またはエントリアドレスで指定",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"},
                    "function_name": {
                        "type": "string",
                        "description": "関数名。同名関数が複数ある場合は全候補を返す"
                    },
                    "entry": {
                        "type": "string",
                        "description": "エントリアドレス（関数名より優先）"
                    }
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "read_strings",
            "description": "解析済みバイナリの文字列一覧",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"},
                    "min_length": {
                        "type": "integer",
                        "description": "この長さを超える文字列のみ返す",
                        "default": 5
                    },
                    "limit": {
                        "type": "integer",
                        "default": 100
                    }
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "list_imports",
            "description": "インポート一覧（ライブラリ別にグループ化）",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"}
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "list_exports",
            "description": "エクスポート一覧",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"}
                },
                "required": ["binary_path"]
            }
        }),
        json!({
            "name": "get_function_callers",
            "description": "指定関数を呼んでいる関数の一覧",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"},
                    "function_name": {"type": "string"}
                },
                "required": ["binary_path", "function_name"]
            }
        }),
        json!({
            "name": "get_function_callees",
            "description": "指定関数が呼んでいる関数の一覧",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "binary_path": {"type": "string"},
                    "function_name": {"type": "string"}
                },
                "required": ["binary_path", "function_name"]
            }
        }),
        json!({
            "name": "list_session_binaries",
            "description": "このセッションで解析済みのバイナリ一覧",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
        json!({
            "name": "clear_session",
            "description": "セッションをクリアする（ディスク上のキャッシュは保持される）",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
        json!({
            "name": "clear_cache",
            "description": "ディスク上の成果物キャッシュを削除する。older_than_hours指定時は古いエントリのみ",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "older_than_hours": {
                        "type": "integer",
                        "description": "この時間より古いエントリだけ削除する。省略時は全削除"
                    }
                }
            }
        }),
        json!({
            "name": "health_check",
            "description": "サーバーとGhidra環境の状態確認",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
    ];

    json!({ "tools": tools })
}

async fn handle_tool_call(params: Option<Value>, state: Arc<ServerState>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow::anyhow!("Missing params"))?;
    let tool_name = params["name"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing tool name"))?;
    let arguments = &params["arguments"];

    info!("Calling tool: {}", tool_name);

    let result = match dispatch_tool(tool_name, arguments, &state).await {
        Ok(data) => json!({
            "status": "success",
            "data": data
        }),
        Err(e) => {
            error!("Tool {} failed: {}", tool_name, e);
            tool_error(&e)
        }
    };

    Ok(json!({
        "content": [{
            "type": "text",
            "text": serde_json::to_string_pretty(&result)?
        }]
    }))
}

/// ツール失敗のエンベロープ。error_code でクライアント側の分岐を可能にする
fn tool_error(e: &ToolError) -> Value {
    match e {
        ToolError::Analysis(err) => {
            let mut body = json!({
                "status": "error",
                "error": err.to_string(),
                "error_code": err.code()
            });
            if let Some(tail) = err.log_tail() {
                body["details"] = json!({ "log_tail": tail });
            }
            body
        }
        ToolError::Argument(msg) => json!({
            "status": "error",
            "error": msg,
            "error_code": "INVALID_ARGUMENT"
        }),
        ToolError::GhidraUnavailable => json!({
            "status": "error",
            "error": "Ghidra installation not found. Set GHIDRA_INSTALL_DIR or GHIDRA_HEADLESS_PATH",
            "error_code": "GHIDRA_NOT_FOUND"
        }),
        ToolError::UnknownTool(name) => json!({
            "status": "error",
            "error": format!("Unknown tool: {}", name),
            "error_code": "UNKNOWN_TOOL"
        }),
    }
}

enum ToolError {
    Analysis(AnalysisError),
    Argument(String),
    GhidraUnavailable,
    UnknownTool(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Analysis(e) => write!(f, "{}", e),
            ToolError::Argument(msg) => write!(f, "{}", msg),
            ToolError::GhidraUnavailable => write!(f, "ghidra not available"),
            ToolError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
        }
    }
}

impl From<AnalysisError> for ToolError {
    fn from(e: AnalysisError) -> Self {
        ToolError::Analysis(e)
    }
}

fn require_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments[key]
        .as_str()
        .ok_or_else(|| ToolError::Argument(format!("Missing required argument: {}", key)))
}

fn optional_string_array(arguments: &Value, key: &str) -> Option<Vec<String>> {
    arguments[key].as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

async fn dispatch_tool(
    tool_name: &str,
    arguments: &Value,
    state: &ServerState,
) -> Result<Value, ToolError> {
    match tool_name {
        "analyze_binary" => {
            let path = require_str(arguments, "binary_path")?;
            let force = arguments["force"].as_bool().unwrap_or(false);
            let handles = state.analysis.as_ref().ok_or(ToolError::GhidraUnavailable)?;
            let report = handles
                .orchestrator
                .ensure_analyzed_with(path.as_ref(), force)
                .await?;
            Ok(serde_json::to_value(&report).unwrap_or(Value::Null))
        }

        "analyze_binaries" => {
            let paths = optional_string_array(arguments, "binary_paths")
                .ok_or_else(|| ToolError::Argument("Missing required argument: binary_paths".into()))?;
            if paths.is_empty() {
                return Err(ToolError::Argument("binary_paths is empty".into()));
            }
            let handles = state.analysis.as_ref().ok_or(ToolError::GhidraUnavailable)?;
            let report = handles
                .batch
                .run_batch(paths.into_iter().map(Into::into).collect())
                .await;
            Ok(serde_json::to_value(&report).unwrap_or(Value::Null))
        }

        "analyze_folder" => {
            let folder = require_str(arguments, "folder_path")?;
            let extensions = optional_string_array(arguments, "extensions");
            let handles = state.analysis.as_ref().ok_or(ToolError::GhidraUnavailable)?;
            let report = handles
                .batch
                .run_folder(folder.as_ref(), extensions.as_deref())
                .await?;
            Ok(serde_json::to_value(&report).unwrap_or(Value::Null))
        }

        "list_functions" => {
            let path = require_str(arguments, "binary_path")?;
            let limit = arguments["limit"].as_u64().unwrap_or(300) as usize;
            let artifact = state.session.get_by_path(path.as_ref())?;
            let functions: Vec<Value> = artifact
                .functions
                .iter()
                .take(limit)
                .map(|f| json!({ "name": f.name, "entry": f.entry }))
                .collect();
            Ok(json!({
                "binary": artifact.filename,
                "total": artifact.functions.len(),
                "returned": functions.len(),
                "functions": functions
            }))
        }

        "read_function_code" => {
            let path = require_str(arguments, "binary_path")?;
            let artifact = state.session.get_by_path(path.as_ref())?;
            read_function_code(arguments, &artifact)
        }

        "read_strings" => {
            let path = require_str(arguments, "binary_path")?;
            let min_length = arguments["min_length"].as_u64().unwrap_or(5) as usize;
            let limit = arguments["limit"].as_u64().unwrap_or(100) as usize;
            let artifact = state.session.get_by_path(path.as_ref())?;
            let strings: Vec<Value> = artifact
                .strings
                .iter()
                .filter(|s| s.value.chars().count() > min_length)
                .take(limit)
                .map(|s| json!({ "value": s.value, "address": s.address }))
                .collect();
            Ok(json!({
                "binary": artifact.filename,
                "total": artifact.strings.len(),
                "returned": strings.len(),
                "strings": strings
            }))
        }

        "list_imports" => {
            let path = require_str(arguments, "binary_path")?;
            let artifact = state.session.get_by_path(path.as_ref())?;
            // ライブラリ別にまとめる（表示順は成果物の出現順）
            let mut grouped: indexmap::IndexMap<&str, Vec<Value>> = indexmap::IndexMap::new();
            for import in &artifact.imports {
                grouped.entry(import.library.as_str()).or_default().push(
                    json!({ "name": import.name, "address": import.address }),
                );
            }
            let libraries: Vec<Value> = grouped
                .into_iter()
                .map(|(library, functions)| {
                    json!({
                        "library": library,
                        "count": functions.len(),
                        "functions": functions
                    })
                })
                .collect();
            Ok(json!({
                "binary": artifact.filename,
                "total": artifact.imports.len(),
                "libraries": libraries
            }))
        }

        "list_exports" => {
            let path = require_str(arguments, "binary_path")?;
            let artifact = state.session.get_by_path(path.as_ref())?;
            let exports: Vec<Value> = artifact
                .exports
                .iter()
                .map(|e| json!({ "name": e.name, "address": e.address }))
                .collect();
            Ok(json!({
                "binary": artifact.filename,
                "total": exports.len(),
                "exports": exports
            }))
        }

        "get_function_callers" => {
            let path = require_str(arguments, "binary_path")?;
            let name = require_str(arguments, "function_name")?;
            let artifact = state.session.get_by_path(path.as_ref())?;
            call_graph_neighbors(name, &artifact, Direction::Callers)
        }

        "get_function_callees" => {
            let path = require_str(arguments, "binary_path")?;
            let name = require_str(arguments, "function_name")?;
            let artifact = state.session.get_by_path(path.as_ref())?;
            call_graph_neighbors(name, &artifact, Direction::Callees)
        }

        "list_session_binaries" => {
            let binaries = state.session.list();
            Ok(json!({
                "count": binaries.len(),
                "binaries": binaries
            }))
        }

        "clear_session" => {
            let cleared = state.session.clear();
            Ok(json!({
                "cleared": cleared,
                "cached_on_disk": state.cache.cached_count()
            }))
        }

        "clear_cache" => {
            let scope = match arguments["older_than_hours"].as_u64() {
                Some(hours) => CacheScope::OlderThan(std::time::Duration::from_secs(hours * 3600)),
                None => CacheScope::All,
            };
            let removed = state.cache.clear(scope)?;
            Ok(json!({
                "removed": removed,
                "cached_on_disk": state.cache.cached_count()
            }))
        }

        "health_check" => Ok(health_check(state)),

        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

/// entry指定を優先し、なければ関数名で引く。同名複数は候補を全部返す
fn read_function_code(arguments: &Value, artifact: &AnalysisArtifact) -> Result<Value, ToolError> {
    let index = FunctionIndex::build(artifact);

    if let Some(entry) = arguments["entry"].as_str() {
        let function = index.at(entry).ok_or_else(|| {
            ToolError::Argument(format!("No function at entry {}", entry))
        })?;
        return Ok(json!({
            "name": function.name,
            "entry": function.entry,
            "code": function.code
        }));
    }

    let name = require_str(arguments, "function_name")?;
    let matches = index.named(name);
    if matches.is_empty() {
        return Err(ToolError::Argument(format!("Function not found: {}", name)));
    }
    if matches.len() == 1 {
        let function = matches[0];
        return Ok(json!({
            "name": function.name,
            "entry": function.entry,
            "code": function.code
        }));
    }

    // 同名関数は別エントリとして区別する。マージして返すことはしない
    let candidates: Vec<Value> = matches
        .iter()
        .map(|f| json!({ "name": f.name, "entry": f.entry, "code": f.code }))
        .collect();
    Ok(json!({
        "name": name,
        "ambiguous": true,
        "matches": candidates
    }))
}

enum Direction {
    Callers,
    Callees,
}

fn call_graph_neighbors(
    name: &str,
    artifact: &AnalysisArtifact,
    direction: Direction,
) -> Result<Value, ToolError> {
    let index = FunctionIndex::build(artifact);
    let matches = index.named(name);
    if matches.is_empty() {
        return Err(ToolError::Argument(format!("Function not found: {}", name)));
    }

    let entries: Vec<Value> = matches
        .iter()
        .map(|f| {
            let neighbors = match direction {
                Direction::Callers => &f.callers,
                Direction::Callees => &f.callees,
            };
            json!({
                "entry": f.entry,
                "functions": neighbors
            })
        })
        .collect();

    let key = match direction {
        Direction::Callers => "callers",
        Direction::Callees => "callees",
    };
    Ok(json!({
        "function": name,
        key: entries
    }))
}

fn health_check(state: &ServerState) -> Value {
    let config = &state.config;
    let script = config.script_dir.join(DUMP_SCRIPT);
    json!({
        "server": "ghidra-headless-mcp",
        "version": env!("CARGO_PKG_VERSION"),
        "ghidra_found": config.headless_path.is_some(),
        "ghidra_path": config.headless_path.as_deref().map(|p| p.display().to_string()),
        "scripts_found": script.is_file(),
        "script_dir": config.script_dir.display().to_string(),
        "output_dir": config.output_dir.display().to_string(),
        "cache_dir": config.cache_dir.display().to_string(),
        "safe_dir": config.safe_dir.as_deref().map(|p| p.display().to_string()),
        "analysis_timeout_secs": config.analysis_timeout.as_secs(),
        "batch_concurrency": config.batch_concurrency,
        "session_binaries": state.session.len(),
        "cached_binaries": state.cache.cached_count(),
        "platform": platform_info()
    })
}
