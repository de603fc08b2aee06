use crate::error::AnalysisError;
use crate::orchestrator::{AnalysisOrchestrator, AnalysisStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

/// バッチ1件の結末。1件の失敗は他の項目をキャンセルしない
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    Analyzed {
        name: String,
        functions: usize,
        analysis_time_ms: u64,
    },
    Cached {
        name: String,
        functions: usize,
    },
    Error {
        error: String,
        error_code: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub path: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

/// バッチ全体の集計
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub analyzed: usize,
    pub cached: usize,
    pub errors: usize,
    pub binaries: Vec<BatchItem>,
}

/// バッチ解析: 有界ワーカープールで ensure_analyzed を回す
///
/// 同時実行数はセマフォで制限する（Ghidraは1プロセスがCPU・メモリとも重い）。
/// 異なるバイナリ同士の完了順序は保証しない
pub struct BatchProcessor {
    orchestrator: Arc<AnalysisOrchestrator>,
    concurrency: usize,
}

impl BatchProcessor {
    pub fn new(orchestrator: Arc<AnalysisOrchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            concurrency: concurrency.max(1),
        }
    }

    /// 明示されたパス列を解析する。結果は入力順に並べ直して返す
    pub async fn run_batch(&self, paths: Vec<PathBuf>) -> BatchReport {
        info!(
            "Batch analysis: {} binaries, concurrency {}",
            paths.len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (idx, path) in paths.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("batch semaphore closed");
                let outcome = match orchestrator.ensure_analyzed(&path).await {
                    Ok(report) => match report.status {
                        AnalysisStatus::Cached => BatchOutcome::Cached {
                            name: report.binary_name,
                            functions: report.functions_count,
                        },
                        AnalysisStatus::Analyzed => BatchOutcome::Analyzed {
                            name: report.binary_name,
                            functions: report.functions_count,
                            analysis_time_ms: report.analysis_time_ms,
                        },
                    },
                    Err(e) => BatchOutcome::Error {
                        error: e.to_string(),
                        error_code: e.code().to_string(),
                    },
                };
                (
                    idx,
                    BatchItem {
                        path: path.display().to_string(),
                        outcome,
                    },
                )
            });
        }

        let mut items: Vec<(usize, BatchItem)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => items.push(pair),
                Err(e) => warn!("Batch worker panicked: {}", e),
            }
        }
        items.sort_by_key(|(idx, _)| *idx);

        let mut report = BatchReport {
            analyzed: 0,
            cached: 0,
            errors: 0,
            binaries: Vec::with_capacity(items.len()),
        };
        for (_, item) in items {
            match item.outcome {
                BatchOutcome::Analyzed { .. } => report.analyzed += 1,
                BatchOutcome::Cached { .. } => report.cached += 1,
                BatchOutcome::Error { .. } => report.errors += 1,
            }
            report.binaries.push(item);
        }
        report
    }

    /// フォルダを再帰走査して解析する
    ///
    /// extensions 指定時は拡張子で、未指定時はマジックバイトで
    /// 実行可能形式だけに絞る（非バイナリにGhidra起動を浪費しない）
    pub async fn run_folder(
        &self,
        folder: &Path,
        extensions: Option<&[String]>,
    ) -> Result<BatchReport, AnalysisError> {
        if !folder.is_dir() {
            return Err(AnalysisError::NotDirectory {
                path: folder.to_path_buf(),
            });
        }
        let paths = collect_binaries(folder, extensions);
        Ok(self.run_batch(paths).await)
    }
}

/// フォルダ配下の解析候補を集める
pub fn collect_binaries(folder: &Path, extensions: Option<&[String]>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(folder).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let keep = match extensions {
            Some(exts) => match path.extension().and_then(|e| e.to_str()) {
                Some(ext) => exts
                    .iter()
                    .any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(ext)),
                None => false,
            },
            None => looks_executable(path),
        };
        if keep {
            out.push(path.to_path_buf());
        }
    }
    out.sort();
    out
}

/// goblinのマジック判定でELF/PE/Mach-Oだけ通す
fn looks_executable(path: &Path) -> bool {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    matches!(
        goblin::peek(&mut file),
        Ok(goblin::Hint::Elf(_))
            | Ok(goblin::Hint::PE)
            | Ok(goblin::Hint::Mach(_))
            | Ok(goblin::Hint::MachFat(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::ghidra_headless::{AnalysisRunner, RunOutput};
    use crate::session::SessionRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// "bad" を含むファイル名で失敗するモック
    struct MarkerRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalysisRunner for MarkerRunner {
        async fn run(&self, binary: &Path, output_dir: &Path) -> Result<RunOutput, AnalysisError> {
            let seq = self.calls.fetch_add(1, Ordering::SeqCst);
            let name = binary.file_name().unwrap().to_string_lossy();
            if name.contains("bad") {
                return Err(AnalysisError::AnalysisFailed {
                    message: "mock failure".to_string(),
                    log_tail: String::new(),
                });
            }
            let artifact = serde_json::json!({
                "filename": name,
                "timestamp": "t",
                "functions": [{"name": "main", "entry": "00401000", "code": "int main(void) {}"}],
                "strings": []
            });
            std::fs::create_dir_all(output_dir).unwrap();
            let artifact_path = output_dir.join(format!("{}_{}.json", name, seq));
            std::fs::write(&artifact_path, artifact.to_string()).unwrap();
            Ok(RunOutput {
                artifact_path,
                log: String::new(),
            })
        }
    }

    fn processor(dir: &Path, concurrency: usize) -> BatchProcessor {
        let cache = Arc::new(CacheStore::new(dir.join("cache")).unwrap());
        let session = Arc::new(SessionRegistry::new());
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            Arc::new(MarkerRunner {
                calls: AtomicUsize::new(0),
            }),
            cache,
            session,
        ));
        BatchProcessor::new(orchestrator, concurrency)
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let bad = dir.path().join("bad.bin");
        let c = dir.path().join("c.bin");
        std::fs::write(&a, b"aa").unwrap();
        std::fs::write(&bad, b"bb").unwrap();
        std::fs::write(&c, b"cc").unwrap();

        let batch = processor(dir.path(), 2);
        let report = batch.run_batch(vec![a, bad, c]).await;

        assert_eq!(report.binaries.len(), 3);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.errors, 1);
        // 入力順が保たれ、2番目だけがエラー
        assert!(matches!(report.binaries[0].outcome, BatchOutcome::Analyzed { .. }));
        assert!(matches!(report.binaries[1].outcome, BatchOutcome::Error { .. }));
        assert!(matches!(report.binaries[2].outcome, BatchOutcome::Analyzed { .. }));
    }

    #[tokio::test]
    async fn test_second_run_reports_cached() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        std::fs::write(&a, b"same").unwrap();

        let batch = processor(dir.path(), 2);
        let first = batch.run_batch(vec![a.clone()]).await;
        assert_eq!(first.analyzed, 1);

        let second = batch.run_batch(vec![a]).await;
        assert_eq!(second.cached, 1);
        assert_eq!(second.analyzed, 0);
    }

    #[tokio::test]
    async fn test_run_folder_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();
        let batch = processor(dir.path(), 1);
        let err = batch.run_folder(&file, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_DIRECTORY");
    }

    #[test]
    fn test_collect_binaries_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();

        // 最低限のELFヘッダ先頭（マジック + クラス/エンディアン）
        let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        elf.resize(64, 0);
        std::fs::write(nested.join("real.elf"), &elf).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"just some text here").unwrap();

        let found = collect_binaries(dir.path(), None);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("real.elf"));
    }

    #[test]
    fn test_collect_binaries_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.dll"), b"MZ").unwrap();
        std::fs::write(dir.path().join("prog.exe"), b"MZ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

        let exts = vec![".exe".to_string(), "dll".to_string()];
        let found = collect_binaries(dir.path(), Some(&exts));
        assert_eq!(found.len(), 2);
    }
}
