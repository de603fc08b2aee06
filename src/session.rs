use crate::artifact::AnalysisArtifact;
use crate::error::AnalysisError;
use crate::fingerprint::BinaryFingerprint;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// セッションエントリ: 解析済みバイナリ1件
struct SessionEntry {
    fingerprint: BinaryFingerprint,
    artifact: Arc<AnalysisArtifact>,
    last_access: SystemTime,
}

/// list_session_binaries 用のサマリー
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub path: String,
    pub name: String,
    pub hash: String,
    pub functions: usize,
    pub strings: usize,
    pub imports: usize,
    pub exports: usize,
    /// 最終アクセス時刻（unix秒）
    pub last_access: u64,
}

/// プロセス内セッション（解析済みバイナリの表）
///
/// ハッシュをキーに成果物への参照を持つ純粋なインメモリ表。
/// 自動evictionはせず、clear_session されるまで保持し続ける。
/// クエリツールはパス指定で来るので、パス→ハッシュの側引きも持つ
/// （クエリごとにファイルを再ハッシュしないため）
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // 挿入順を保つ（list_session_binaries の表示順）
    entries: IndexMap<String, SessionEntry>,
    by_path: HashMap<PathBuf, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// 解析完了時に登録。同一fingerprintは上書き（last-writer-wins）
    pub fn upsert(&self, fingerprint: BinaryFingerprint, artifact: Arc<AnalysisArtifact>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_path
            .insert(fingerprint.path.clone(), fingerprint.hash.clone());
        let hash = fingerprint.hash.clone();
        inner.entries.insert(
            hash,
            SessionEntry {
                fingerprint,
                artifact,
                last_access: SystemTime::now(),
            },
        );
    }

    /// ハッシュで取得
    pub fn get(&self, hash: &str) -> Option<Arc<AnalysisArtifact>> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get_mut(hash).map(|entry| {
            entry.last_access = SystemTime::now();
            Arc::clone(&entry.artifact)
        })
    }

    /// パスで取得（クエリツール用）。未解析なら NotAnalyzed
    pub fn get_by_path(&self, path: &Path) -> Result<Arc<AnalysisArtifact>, AnalysisError> {
        let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.by_path.get(&abs).cloned().ok_or_else(|| {
            AnalysisError::NotAnalyzed {
                path: path.to_path_buf(),
            }
        })?;
        let entry = inner
            .entries
            .get_mut(&hash)
            .ok_or_else(|| AnalysisError::NotAnalyzed {
                path: path.to_path_buf(),
            })?;
        entry.last_access = SystemTime::now();
        Ok(Arc::clone(&entry.artifact))
    }

    /// セッション内の全バイナリのサマリー（挿入順）
    pub fn list(&self) -> Vec<SessionSummary> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .map(|entry| SessionSummary {
                path: entry.fingerprint.path.display().to_string(),
                name: entry.fingerprint.name().to_string(),
                hash: entry.fingerprint.hash.clone(),
                functions: entry.artifact.functions.len(),
                strings: entry.artifact.strings.len(),
                imports: entry.artifact.imports.len(),
                exports: entry.artifact.exports.len(),
                last_access: entry
                    .last_access
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }

    /// 全消去。消した件数を返す（キャッシュファイルは触らない）
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.by_path.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
