use std::path::PathBuf;
use std::time::Duration;

/// 解析パイプライン全体のエラー分類
///
/// サブプロセス系のエラーは診断用にキャプチャしたログの末尾を保持する。
/// どのエラーも自動リトライはしない（呼び出し側の判断に委ねる）
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// 入力ファイルが存在しない・読めない
    #[error("file not found or unreadable: {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// GHIDRA_SAFE_DIR の外へのアクセス
    #[error("access denied: {path} is outside the allowed directory")]
    AccessDenied { path: PathBuf },

    /// analyzeHeadless が見つからない
    #[error("Ghidra headless executable not found (set GHIDRA_HEADLESS_PATH or GHIDRA_INSTALL_DIR)")]
    GhidraNotFound,

    /// サブプロセスの起動失敗・異常終了など
    #[error("analysis failed: {message}")]
    AnalysisFailed { message: String, log_tail: String },

    /// 実時間タイムアウトで強制終了
    #[error("analysis timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// プロセスは終了したが完了タグがstdoutに無い
    /// （終了コード0でも成功とは見なさない）
    #[error("completion tag not found in engine output")]
    MissingArtifactSignal { log_tail: String },

    /// 成果物JSONが壊れている・読めない
    #[error("failed to parse analysis artifact: {message}")]
    ArtifactParse { message: String },

    /// 解析前にクエリされた
    #[error("no analysis found for {path} (run analyze_binary first)")]
    NotAnalyzed { path: PathBuf },

    /// フォルダ解析の対象がディレクトリではない
    #[error("not a directory: {path}")]
    NotDirectory { path: PathBuf },

    /// キャッシュ層などのI/O失敗
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    /// MCPレスポンス用のエラーコード
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fingerprint { .. } => "FILE_NOT_FOUND",
            Self::AccessDenied { .. } => "SECURITY_VIOLATION",
            Self::GhidraNotFound => "GHIDRA_NOT_FOUND",
            Self::AnalysisFailed { .. } => "ANALYSIS_FAILED",
            Self::Timeout { .. } => "ANALYSIS_TIMEOUT",
            Self::MissingArtifactSignal { .. } => "NO_JSON_SIGNAL",
            Self::ArtifactParse { .. } => "ARTIFACT_PARSE_ERROR",
            Self::NotAnalyzed { .. } => "NO_ANALYSIS",
            Self::NotDirectory { .. } => "NOT_DIRECTORY",
            Self::Io(_) => "SYSTEM_ERROR",
        }
    }

    /// 診断用ログ末尾（サブプロセス系エラーのみ）
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            Self::AnalysisFailed { log_tail, .. } | Self::MissingArtifactSignal { log_tail } => {
                Some(log_tail.as_str())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AnalysisError::GhidraNotFound;
        assert_eq!(err.code(), "GHIDRA_NOT_FOUND");

        let err = AnalysisError::MissingArtifactSignal {
            log_tail: "tail".to_string(),
        };
        assert_eq!(err.code(), "NO_JSON_SIGNAL");
        assert_eq!(err.log_tail(), Some("tail"));

        let err = AnalysisError::Timeout {
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.code(), "ANALYSIS_TIMEOUT");
        assert!(err.log_tail().is_none());
    }
}
