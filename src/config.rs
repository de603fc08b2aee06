use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 解析1回あたりの実時間上限（サブプロセスごと強制終了する）
const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(900);

/// Ghidra側に渡す -analysisTimeoutPerFile の既定値（秒）
const DEFAULT_PER_FILE_TIMEOUT_SECS: u64 = 600;

/// バッチ解析の既定同時実行数（Ghidraは1プロセスが重い）
const DEFAULT_BATCH_CONCURRENCY: usize = 2;

/// 実行時設定
///
/// 値のみを保持する。読み込み元は環境変数と標準配置の自動検出で、
/// それ以上の設定機構（ファイル等）は持たない
#[derive(Debug, Clone)]
pub struct GhidraConfig {
    /// analyzeHeadless 実行ファイル。未検出なら None（解析ツールは無効化）
    pub headless_path: Option<PathBuf>,
    /// Ghidraスクリプト置き場（DumpProgramData.java）
    pub script_dir: PathBuf,
    /// 解析成果物のルート
    pub output_dir: PathBuf,
    /// 使い捨てプロジェクトの置き場
    pub projects_dir: PathBuf,
    /// 成果物キャッシュ
    pub cache_dir: PathBuf,
    /// 設定されていれば、この配下のバイナリしか解析しない
    pub safe_dir: Option<PathBuf>,
    pub analysis_timeout: Duration,
    pub per_file_timeout_secs: u64,
    pub batch_concurrency: usize,
}

impl GhidraConfig {
    /// 環境変数と標準の配置から設定を組み立てる
    pub fn detect() -> Self {
        let base_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let output_dir = env::var_os("GHIDRA_MCP_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("analysis_output"));
        let script_dir = env::var_os("GHIDRA_MCP_SCRIPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("scripts").join("ghidra"));

        let analysis_timeout = env::var("GHIDRA_MCP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ANALYSIS_TIMEOUT);
        let per_file_timeout_secs = env::var("GHIDRA_MCP_PER_FILE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PER_FILE_TIMEOUT_SECS);
        let batch_concurrency = env::var("GHIDRA_MCP_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_BATCH_CONCURRENCY);

        Self {
            headless_path: find_ghidra_path(),
            script_dir,
            projects_dir: output_dir.join("projects"),
            cache_dir: output_dir.join("cache"),
            output_dir,
            safe_dir: env::var_os("GHIDRA_SAFE_DIR").map(PathBuf::from),
            analysis_timeout,
            per_file_timeout_secs,
            batch_concurrency,
        }
    }
}

/// analyzeHeadless の実行ファイル名（OS依存）
pub fn ghidra_executable_name() -> &'static str {
    if cfg!(windows) {
        "analyzeHeadless.bat"
    } else {
        "analyzeHeadless"
    }
}

/// Ghidraインストールの自動検出
///
/// 優先順: GHIDRA_HEADLESS_PATH → GHIDRA_INSTALL_DIR/support → 標準の配置
pub fn find_ghidra_path() -> Option<PathBuf> {
    if let Some(p) = env::var_os("GHIDRA_HEADLESS_PATH") {
        let p = PathBuf::from(p);
        if p.is_file() {
            return Some(p);
        }
    }

    if let Some(dir) = env::var_os("GHIDRA_INSTALL_DIR") {
        let candidate = PathBuf::from(dir)
            .join("support")
            .join(ghidra_executable_name());
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    for base in standard_locations() {
        if let Some(found) = probe_install(&base) {
            return Some(found);
        }
    }
    None
}

fn standard_locations() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if cfg!(windows) {
        paths.push(PathBuf::from("C:/ghidra"));
        paths.push(PathBuf::from("C:/Program Files/ghidra"));
    } else {
        paths.push(PathBuf::from("/opt/ghidra"));
        paths.push(PathBuf::from("/usr/local/ghidra"));
    }
    if let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) {
        paths.push(PathBuf::from(home).join("ghidra"));
    }
    paths
}

/// base直下、またはバージョン付きサブディレクトリ（ghidra_11.0_PUBLIC等）を探す
fn probe_install(base: &Path) -> Option<PathBuf> {
    let exe = ghidra_executable_name();

    let direct = base.join("support").join(exe);
    if direct.is_file() {
        return Some(direct);
    }

    let entries = std::fs::read_dir(base).ok()?;
    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("ghidra"))
                    .unwrap_or(false)
        })
        .collect();
    subdirs.sort();

    // 新しいバージョンを優先
    for dir in subdirs.into_iter().rev() {
        let candidate = dir.join("support").join(exe);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// health_check 用のプラットフォーム情報
pub fn platform_info() -> serde_json::Value {
    serde_json::json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "ghidra_executable": ghidra_executable_name(),
    })
}
