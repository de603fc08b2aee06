use crate::artifact::AnalysisArtifact;
use crate::cache::CacheStore;
use crate::error::AnalysisError;
use crate::fingerprint::{fingerprint, BinaryFingerprint};
use crate::ghidra_headless::AnalysisRunner;
use crate::session::SessionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

/// fingerprint単位の排他ロック表
///
/// 参照カウントで管理し、誰も待っていないエントリは即座に除去する。
/// 長時間のバッチで異なるバイナリを大量に流しても表は成長しない
struct LockTable {
    inner: Mutex<HashMap<String, LockSlot>>,
}

struct LockSlot {
    refs: usize,
    lock: Arc<AsyncMutex<()>>,
}

struct LockGuard<'a> {
    table: &'a LockTable,
    key: String,
    _permit: OwnedMutexGuard<()>,
}

impl LockTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: &str) -> LockGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap();
            let slot = map.entry(key.to_string()).or_insert_with(|| LockSlot {
                refs: 0,
                lock: Arc::new(AsyncMutex::new(())),
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };
        // 先行の実行があればここで待つ
        let permit = lock.lock_owned().await;
        LockGuard {
            table: self,
            key: key.to_string(),
            _permit: permit,
        }
    }

    fn release(&self, key: &str) {
        let mut map = self.inner.lock().unwrap();
        if let Some(slot) = map.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                map.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// 1バイナリの解析結果の扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// キャッシュヒット（サブプロセスは起動していない）
    Cached,
    /// 新規にGhidraを実行した
    Analyzed,
}

/// ensure_analyzed の結果
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub binary: String,
    pub binary_name: String,
    pub binary_hash: String,
    pub status: AnalysisStatus,
    pub output_path: String,
    pub functions_count: usize,
    pub strings_count: usize,
    pub imports_count: usize,
    pub exports_count: usize,
    pub analysis_time_ms: u64,
    #[serde(skip)]
    pub artifact: Arc<AnalysisArtifact>,
}

impl AnalysisReport {
    fn build(
        fingerprint: &BinaryFingerprint,
        status: AnalysisStatus,
        output_path: &Path,
        artifact: Arc<AnalysisArtifact>,
        analysis_time_ms: u64,
    ) -> Self {
        Self {
            binary: fingerprint.path.display().to_string(),
            binary_name: fingerprint.name().to_string(),
            binary_hash: fingerprint.hash.clone(),
            status,
            output_path: output_path.display().to_string(),
            functions_count: artifact.functions.len(),
            strings_count: artifact.strings.len(),
            imports_count: artifact.imports.len(),
            exports_count: artifact.exports.len(),
            analysis_time_ms,
            artifact,
        }
    }
}

/// 解析オーケストレータ
///
/// fingerprint → キャッシュ照会 → （ミス時）fingerprint単位ロック下で
/// Ghidra実行 → 成果物の検証とキャッシュ登録 → セッション登録、の一本道を調停する。
/// 同じfingerprintへの並行要求は先行の1回の実行を待って結果を共有する
/// （at-most-one-concurrent-analysis-per-binary）
pub struct AnalysisOrchestrator {
    runner: Arc<dyn AnalysisRunner>,
    cache: Arc<CacheStore>,
    session: Arc<SessionRegistry>,
    locks: LockTable,
    safe_dir: Option<PathBuf>,
}

impl AnalysisOrchestrator {
    pub fn new(
        runner: Arc<dyn AnalysisRunner>,
        cache: Arc<CacheStore>,
        session: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            runner,
            cache,
            session,
            locks: LockTable::new(),
            safe_dir: None,
        }
    }

    /// GHIDRA_SAFE_DIR 相当の制限を有効化
    pub fn with_safe_dir(mut self, safe_dir: Option<PathBuf>) -> Self {
        self.safe_dir = safe_dir;
        self
    }

    pub async fn ensure_analyzed(&self, path: &Path) -> Result<AnalysisReport, AnalysisError> {
        self.ensure_analyzed_with(path, false).await
    }

    /// force=true でキャッシュを無視して再解析する
    pub async fn ensure_analyzed_with(
        &self,
        path: &Path,
        force: bool,
    ) -> Result<AnalysisReport, AnalysisError> {
        let started = Instant::now();
        let fp = fingerprint(path)?;
        self.check_safe_dir(&fp.path)?;

        if !force {
            if let Some(report) = self.try_cached(&fp) {
                return Ok(report);
            }
        }

        // 同一fingerprintの実行は一度に1つ。後続はここで先行の完了を待つ
        let _guard = self.locks.acquire(&fp.hash).await;

        // ロック待ちの間に先行者が完了していれば再照会がヒットする
        if !force {
            if let Some(report) = self.try_cached(&fp) {
                return Ok(report);
            }
        }

        info!(
            "Cache miss, running Ghidra for {} ({})",
            fp.name(),
            fp.short_hash()
        );

        // 失敗時はここで抜ける。キャッシュもセッションも汚さない
        let run = self.runner.run(&fp.path, self.cache.cache_dir()).await?;
        let artifact = AnalysisArtifact::load(&run.artifact_path)?;
        let stored = self.cache.store(&fp, &run.artifact_path, &artifact)?;

        let artifact = Arc::new(artifact);
        self.session.upsert(fp.clone(), Arc::clone(&artifact));

        let elapsed = started.elapsed().as_millis() as u64;
        info!(
            "Analysis complete for {}: {} functions in {}ms",
            fp.name(),
            artifact.functions.len(),
            elapsed
        );

        Ok(AnalysisReport::build(
            &fp,
            AnalysisStatus::Analyzed,
            &stored,
            artifact,
            elapsed,
        ))
    }

    fn try_cached(&self, fp: &BinaryFingerprint) -> Option<AnalysisReport> {
        let (path, artifact) = self.cache.lookup(fp)?;
        let artifact = Arc::new(artifact);
        self.session.upsert(fp.clone(), Arc::clone(&artifact));
        Some(AnalysisReport::build(
            fp,
            AnalysisStatus::Cached,
            &path,
            artifact,
            0,
        ))
    }

    fn check_safe_dir(&self, resolved: &Path) -> Result<(), AnalysisError> {
        let Some(safe_dir) = &self.safe_dir else {
            return Ok(());
        };
        let safe = safe_dir
            .canonicalize()
            .unwrap_or_else(|_| safe_dir.clone());
        if !resolved.starts_with(&safe) {
            return Err(AnalysisError::AccessDenied {
                path: resolved.to_path_buf(),
            });
        }
        Ok(())
    }
}
