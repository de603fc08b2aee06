//! Ghidra Headless MCP サーバーのコアライブラリ
//!
//! analyzeHeadless をサブプロセスとして駆動し、成果物JSONを
//! 内容ハッシュでキャッシュして MCP ツール群に提供する。
//! プロトコル層（stdio JSON-RPC）は main.rs 側にある

pub mod artifact;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ghidra_headless;
pub mod orchestrator;
pub mod session;
