use crate::config::GhidraConfig;
use crate::error::AnalysisError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 完了タグ。Ghidra側スクリプトとの唯一の成功シグナルで、
/// このプレフィックスは契約として変更しない
pub const ARTIFACT_TAG: &str = "GHIDRA_JSON_GENERATED:";

/// 成果物の出力先をスクリプトへ伝える環境変数
pub const OUTPUT_DIR_ENV: &str = "GHIDRA_ANALYSIS_OUTPUT";

/// -postScript で実行する抽出スクリプト名
pub const DUMP_SCRIPT: &str = "DumpProgramData.java";

/// 診断用に保持するログ末尾の長さ
const LOG_TAIL_BYTES: usize = 2000;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// 1回の解析実行の結果
#[derive(Debug)]
pub struct RunOutput {
    /// スクリプトが書き出した成果物JSONのパス（タグ行から取得）
    pub artifact_path: PathBuf,
    /// キャプチャしたstdout+stderr
    pub log: String,
}

/// 解析エンジンの実行インタフェース
///
/// テストではモック実装に差し替えて、呼び出し回数や失敗を制御する
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    async fn run(&self, binary: &Path, output_dir: &Path) -> Result<RunOutput, AnalysisError>;
}

/// Ghidra analyzeHeadless をサブプロセスとして起動するランナー
///
/// 起動が遅く（解析で10〜60秒）、しかも終了コード0のまま失敗することがあるため、
/// 成功判定は完了タグのみで行う
pub struct GhidraHeadless {
    headless_path: PathBuf,
    script_dir: PathBuf,
    projects_dir: PathBuf,
    timeout: Duration,
    per_file_timeout_secs: u64,
}

/// 使い捨てプロジェクトのRAIIガード
///
/// タイムアウト・エラーを含むすべての経路で必ず削除する
struct ScratchProject(PathBuf);

impl Drop for ScratchProject {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean up project dir {}: {}", self.0.display(), e);
            }
        }
    }
}

impl GhidraHeadless {
    pub fn new(config: &GhidraConfig) -> Result<Self, AnalysisError> {
        let headless_path = config
            .headless_path
            .clone()
            .filter(|p| p.exists())
            .ok_or(AnalysisError::GhidraNotFound)?;

        Ok(Self {
            headless_path,
            script_dir: config.script_dir.clone(),
            projects_dir: config.projects_dir.clone(),
            timeout: config.analysis_timeout,
            per_file_timeout_secs: config.per_file_timeout_secs,
        })
    }
}

#[async_trait]
impl AnalysisRunner for GhidraHeadless {
    async fn run(&self, binary: &Path, output_dir: &Path) -> Result<RunOutput, AnalysisError> {
        let launch_err = |message: String| AnalysisError::AnalysisFailed {
            message,
            log_tail: String::new(),
        };

        let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
        let proj_dir = self
            .projects_dir
            .join(format!("proj_{}_{}", std::process::id(), seq));
        std::fs::create_dir_all(&proj_dir)
            .map_err(|e| launch_err(format!("cannot create project dir: {}", e)))?;
        let _scratch = ScratchProject(proj_dir.clone());

        std::fs::create_dir_all(output_dir)
            .map_err(|e| launch_err(format!("cannot create output dir: {}", e)))?;

        info!("Starting Ghidra analysis on: {}", binary.display());

        let mut cmd = Command::new(&self.headless_path);
        cmd.arg(&proj_dir)
            .arg("headless_proj")
            .arg("-import")
            .arg(binary)
            .arg("-scriptPath")
            .arg(&self.script_dir)
            .arg("-postScript")
            .arg(DUMP_SCRIPT)
            .arg("-deleteProject")
            .arg("-analysisTimeoutPerFile")
            .arg(self.per_file_timeout_secs.to_string())
            .env(OUTPUT_DIR_ENV, output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| launch_err(format!("failed to launch Ghidra: {}", e)))?;

        // タイムアウトでfutureを破棄すると kill_on_drop が子プロセスを殺す。
        // 部分出力は破棄する
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| launch_err(format!("wait failed: {}", e)))?,
            Err(_) => {
                warn!(
                    "Ghidra run timed out after {:?}, killing subprocess",
                    self.timeout
                );
                return Err(AnalysisError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("Ghidra stdout: {}", stdout);
        if !stderr.is_empty() {
            debug!("Ghidra stderr: {}", stderr);
        }
        let log = format!("{}\n--- stderr ---\n{}", stdout, stderr);

        // 終了コードは信用しない。タグが唯一の成功シグナル
        let artifact_path = match parse_artifact_tag(&stdout) {
            Some(path) => path,
            None => {
                if !output.status.success() {
                    return Err(AnalysisError::AnalysisFailed {
                        message: format!("Ghidra exited with {}", output.status),
                        log_tail: log_tail(&log, LOG_TAIL_BYTES),
                    });
                }
                return Err(AnalysisError::MissingArtifactSignal {
                    log_tail: log_tail(&log, LOG_TAIL_BYTES),
                });
            }
        };

        if !artifact_path.exists() {
            return Err(AnalysisError::AnalysisFailed {
                message: format!("artifact missing at: {}", artifact_path.display()),
                log_tail: log_tail(&log, LOG_TAIL_BYTES),
            });
        }

        Ok(RunOutput { artifact_path, log })
    }
}

/// stdoutから完了タグの行を探して成果物パスを取り出す
///
/// 行位置やエンコーディングは仮定しない。Ghidraはタグ行の後ろに
/// " (GhidraScript)" のようなログ接尾辞を付けることがあるので落とす
pub fn parse_artifact_tag(stdout: &str) -> Option<PathBuf> {
    for line in stdout.lines() {
        if let Some((_, rest)) = line.split_once(ARTIFACT_TAG) {
            let mut raw = rest.trim();
            if let Some(pos) = raw.find(" (") {
                raw = raw[..pos].trim();
            }
            let raw = raw.trim_matches('"').trim_matches('\'');
            if raw.is_empty() {
                continue;
            }
            return Some(PathBuf::from(raw));
        }
    }
    None
}

/// 診断用にログの末尾だけ残す（UTF-8境界を壊さない）
pub fn log_tail(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    let mut start = log.len() - max;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    log[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact_tag_plain() {
        let stdout = "INFO  other line\nGHIDRA_JSON_GENERATED: /tmp/out/sample.json\ndone";
        assert_eq!(
            parse_artifact_tag(stdout),
            Some(PathBuf::from("/tmp/out/sample.json"))
        );
    }

    #[test]
    fn test_parse_artifact_tag_with_log_prefix_and_suffix() {
        // Ghidraのログ装飾が前後に付くケース
        let stdout =
            "INFO  DumpProgramData.java> GHIDRA_JSON_GENERATED: /out/a.json (GhidraScript)";
        assert_eq!(parse_artifact_tag(stdout), Some(PathBuf::from("/out/a.json")));
    }

    #[test]
    fn test_parse_artifact_tag_strips_quotes() {
        let stdout = "GHIDRA_JSON_GENERATED: \"/out/with space.json\"";
        assert_eq!(
            parse_artifact_tag(stdout),
            Some(PathBuf::from("/out/with space.json"))
        );
    }

    #[test]
    fn test_parse_artifact_tag_absent() {
        assert_eq!(parse_artifact_tag("analysis done\nexit 0"), None);
        assert_eq!(parse_artifact_tag(""), None);
        // タグはあるがパスが空
        assert_eq!(parse_artifact_tag("GHIDRA_JSON_GENERATED:   "), None);
    }

    #[test]
    fn test_log_tail_respects_utf8_boundary() {
        let log = "あいうえお";
        let tail = log_tail(log, 4);
        assert!(tail.len() <= 4);
        assert!(log.ends_with(&tail));
        assert_eq!(log_tail("short", 100), "short");
    }

    #[cfg(unix)]
    mod subprocess {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_engine(dir: &Path, script_body: &str) -> GhidraConfig {
            let exe = dir.join("analyzeHeadless");
            std::fs::write(&exe, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

            GhidraConfig {
                headless_path: Some(exe),
                script_dir: dir.join("scripts"),
                output_dir: dir.join("out"),
                projects_dir: dir.join("projects"),
                cache_dir: dir.join("cache"),
                safe_dir: None,
                analysis_timeout: Duration::from_secs(10),
                per_file_timeout_secs: 600,
                batch_concurrency: 2,
            }
        }

        #[tokio::test]
        async fn test_zero_exit_without_tag_is_a_protocol_violation() {
            let dir = tempfile::tempdir().unwrap();
            let config = fake_engine(dir.path(), "echo analysis complete; exit 0");
            let runner = GhidraHeadless::new(&config).unwrap();
            let binary = dir.path().join("bin");
            std::fs::write(&binary, b"x").unwrap();

            let err = runner.run(&binary, &config.output_dir).await.unwrap_err();
            assert_eq!(err.code(), "NO_JSON_SIGNAL");
            assert!(err.log_tail().unwrap().contains("analysis complete"));
        }

        #[tokio::test]
        async fn test_tag_and_artifact_yield_success() {
            let dir = tempfile::tempdir().unwrap();
            let config = fake_engine(
                dir.path(),
                "mkdir -p \"$GHIDRA_ANALYSIS_OUTPUT\"\n\
                 printf '{}' > \"$GHIDRA_ANALYSIS_OUTPUT/dump.json\"\n\
                 echo \"GHIDRA_JSON_GENERATED: $GHIDRA_ANALYSIS_OUTPUT/dump.json\"",
            );
            let runner = GhidraHeadless::new(&config).unwrap();
            let binary = dir.path().join("bin");
            std::fs::write(&binary, b"x").unwrap();

            let out = runner.run(&binary, &config.output_dir).await.unwrap();
            assert!(out.artifact_path.ends_with("dump.json"));
            assert!(out.artifact_path.exists());
            // 使い捨てプロジェクトは掃除済み
            let leftovers: Vec<_> = std::fs::read_dir(&config.projects_dir)
                .map(|it| it.filter_map(|e| e.ok()).collect())
                .unwrap_or_default();
            assert!(leftovers.is_empty());
        }

        #[tokio::test]
        async fn test_nonzero_exit_without_tag_reports_failure() {
            let dir = tempfile::tempdir().unwrap();
            let config = fake_engine(dir.path(), "echo import failed >&2; exit 1");
            let runner = GhidraHeadless::new(&config).unwrap();
            let binary = dir.path().join("bin");
            std::fs::write(&binary, b"x").unwrap();

            let err = runner.run(&binary, &config.output_dir).await.unwrap_err();
            assert_eq!(err.code(), "ANALYSIS_FAILED");
            assert!(err.log_tail().unwrap().contains("import failed"));
        }

        #[tokio::test]
        async fn test_timeout_kills_subprocess() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = fake_engine(dir.path(), "sleep 30");
            config.analysis_timeout = Duration::from_millis(200);
            let runner = GhidraHeadless::new(&config).unwrap();
            let binary = dir.path().join("bin");
            std::fs::write(&binary, b"x").unwrap();

            let start = std::time::Instant::now();
            let err = runner.run(&binary, &config.output_dir).await.unwrap_err();
            assert_eq!(err.code(), "ANALYSIS_TIMEOUT");
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn test_missing_ghidra_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = fake_engine(dir.path(), "exit 0");
            config.headless_path = Some(dir.path().join("nonexistent"));
            assert!(matches!(
                GhidraHeadless::new(&config),
                Err(AnalysisError::GhidraNotFound)
            ));
            config.headless_path = None;
            assert!(matches!(
                GhidraHeadless::new(&config),
                Err(AnalysisError::GhidraNotFound)
            ));
        }
    }
}
