use crate::artifact::AnalysisArtifact;
use crate::error::AnalysisError;
use crate::fingerprint::BinaryFingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// キャッシュクリアの範囲
pub enum CacheScope {
    All,
    /// 作成から一定時間を超えたエントリのみ
    OlderThan(Duration),
}

/// index.json の形（ハッシュ→メタデータ）
#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: String,
    binaries: HashMap<String, IndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            binaries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub path: String,
    pub functions: usize,
    pub strings: usize,
    pub imports: usize,
    pub exports: usize,
    /// 作成時刻（unix秒）
    #[serde(default)]
    pub created: u64,
}

/// ディスク上のコンテンツアドレスキャッシュ
///
/// 成果物は <cache_dir>/<hash>.json、一覧は <cache_dir>/index.json。
/// プロセス再起動をまたいで生き残るので、同じバイナリの再解析を避けられる。
/// 同一fingerprintへの書き込み直列化はオーケストレータ側のロックが保証する
/// （ストア自身は single-writer-per-key を仮定する）
pub struct CacheStore {
    cache_dir: PathBuf,
    index_file: PathBuf,
    // index.json の read-modify-write 用
    index_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, AnalysisError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        let index_file = cache_dir.join("index.json");
        Ok(Self {
            cache_dir,
            index_file,
            index_lock: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// fingerprintに対応する成果物の置き場所
    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", hash))
    }

    /// キャッシュ照会。壊れたエントリはミス扱い（次の解析で上書きされる）
    pub fn lookup(&self, fingerprint: &BinaryFingerprint) -> Option<(PathBuf, AnalysisArtifact)> {
        let path = self.artifact_path(&fingerprint.hash);
        if !path.exists() {
            return None;
        }
        match AnalysisArtifact::load(&path) {
            Ok(artifact) => Some((path, artifact)),
            Err(e) => {
                warn!("Corrupted cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    /// エンジンが生成したJSONをハッシュ名に移してキャッシュ登録
    ///
    /// 既存エントリは上書き（新しい解析が勝つ）
    pub fn store(
        &self,
        fingerprint: &BinaryFingerprint,
        generated: &Path,
        artifact: &AnalysisArtifact,
    ) -> Result<PathBuf, AnalysisError> {
        let dest = self.artifact_path(&fingerprint.hash);
        if generated != dest {
            // 別ファイルシステムに跨る場合 rename は失敗するので copy にフォールバック
            if fs::rename(generated, &dest).is_err() {
                fs::copy(generated, &dest)?;
                let _ = fs::remove_file(generated);
            }
        }
        self.update_index(fingerprint, artifact)?;
        Ok(dest)
    }

    fn update_index(
        &self,
        fingerprint: &BinaryFingerprint,
        artifact: &AnalysisArtifact,
    ) -> Result<(), AnalysisError> {
        let _guard = self.index_lock.lock().unwrap();
        let mut index = self.load_index();
        index.binaries.insert(
            fingerprint.hash.clone(),
            IndexEntry {
                name: fingerprint.name().to_string(),
                path: fingerprint.path.display().to_string(),
                functions: artifact.functions.len(),
                strings: artifact.strings.len(),
                imports: artifact.imports.len(),
                exports: artifact.exports.len(),
                created: unix_now(),
            },
        );
        self.save_index(&index)
    }

    fn load_index(&self) -> CacheIndex {
        fs::read_to_string(&self.index_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_index(&self, index: &CacheIndex) -> Result<(), AnalysisError> {
        let raw = serde_json::to_string_pretty(index).map_err(|e| AnalysisError::ArtifactParse {
            message: e.to_string(),
        })?;
        fs::write(&self.index_file, raw)?;
        Ok(())
    }

    /// キャッシュ済みバイナリ数（health_check用）
    pub fn cached_count(&self) -> usize {
        let _guard = self.index_lock.lock().unwrap();
        self.load_index().binaries.len()
    }

    /// キャッシュ削除。削除した成果物の件数を返す
    pub fn clear(&self, scope: CacheScope) -> Result<usize, AnalysisError> {
        let _guard = self.index_lock.lock().unwrap();
        let mut index = self.load_index();
        let mut removed = 0;

        match scope {
            CacheScope::All => {
                for hash in index.binaries.keys() {
                    if fs::remove_file(self.artifact_path(hash)).is_ok() {
                        removed += 1;
                    }
                }
                index.binaries.clear();
            }
            CacheScope::OlderThan(age) => {
                let cutoff = unix_now().saturating_sub(age.as_secs());
                let stale: Vec<String> = index
                    .binaries
                    .iter()
                    .filter(|(_, entry)| entry.created <= cutoff)
                    .map(|(hash, _)| hash.clone())
                    .collect();
                for hash in stale {
                    if fs::remove_file(self.artifact_path(&hash)).is_ok() {
                        removed += 1;
                    }
                    index.binaries.remove(&hash);
                }
            }
        }

        self.save_index(&index)?;
        info!("Cache cleared: {} artifacts removed", removed);
        Ok(removed)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    fn sample_artifact() -> AnalysisArtifact {
        AnalysisArtifact::from_json(
            r#"{
                "filename": "sample.bin",
                "timestamp": "t",
                "functions": [{"name": "main", "entry": "00401000", "code": "int main(void) {}"}],
                "strings": [{"value": "hello", "address": "00402000"}]
            }"#,
        )
        .unwrap()
    }

    fn write_fixture(dir: &Path) -> (BinaryFingerprint, PathBuf, AnalysisArtifact) {
        let binary = dir.join("sample.bin");
        std::fs::write(&binary, b"binary contents").unwrap();
        let fp = fingerprint(&binary).unwrap();

        let artifact = sample_artifact();
        let generated = dir.join("sample_2024.json");
        std::fs::write(&generated, serde_json::to_string(&artifact).unwrap()).unwrap();
        (fp, generated, artifact)
    }

    #[test]
    fn test_store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache")).unwrap();
        let (fp, generated, artifact) = write_fixture(dir.path());

        assert!(store.lookup(&fp).is_none());

        let dest = store.store(&fp, &generated, &artifact).unwrap();
        assert_eq!(dest, store.artifact_path(&fp.hash));
        assert!(!generated.exists());

        let (_, cached) = store.lookup(&fp).unwrap();
        assert_eq!(cached.functions.len(), 1);
        assert_eq!(store.cached_count(), 1);
    }

    #[test]
    fn test_corrupted_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache")).unwrap();
        let binary = dir.path().join("a.bin");
        std::fs::write(&binary, b"aaa").unwrap();
        let fp = fingerprint(&binary).unwrap();

        std::fs::write(store.artifact_path(&fp.hash), "{ truncated").unwrap();
        assert!(store.lookup(&fp).is_none());
    }

    #[test]
    fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache")).unwrap();
        let (fp, generated, artifact) = write_fixture(dir.path());
        store.store(&fp, &generated, &artifact).unwrap();

        let removed = store.clear(CacheScope::All).unwrap();
        assert_eq!(removed, 1);
        assert!(store.lookup(&fp).is_none());
        assert_eq!(store.cached_count(), 0);
    }

    #[test]
    fn test_clear_older_than_keeps_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache")).unwrap();
        let (fp, generated, artifact) = write_fixture(dir.path());
        store.store(&fp, &generated, &artifact).unwrap();

        // 作成直後なので retention 1時間では消えない
        let removed = store.clear(CacheScope::OlderThan(Duration::from_secs(3600))).unwrap();
        assert_eq!(removed, 0);
        assert!(store.lookup(&fp).is_some());

        // retention 0 なら消える
        let removed = store.clear(CacheScope::OlderThan(Duration::from_secs(0))).unwrap();
        assert_eq!(removed, 1);
        assert!(store.lookup(&fp).is_none());
    }

    #[test]
    fn test_store_overwrites_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache")).unwrap();
        let (fp, generated, artifact) = write_fixture(dir.path());
        store.store(&fp, &generated, &artifact).unwrap();

        let mut newer = sample_artifact();
        newer.functions.clear();
        let regenerated = dir.path().join("regen.json");
        std::fs::write(&regenerated, serde_json::to_string(&newer).unwrap()).unwrap();
        store.store(&fp, &regenerated, &newer).unwrap();

        let (_, cached) = store.lookup(&fp).unwrap();
        assert!(cached.functions.is_empty());
        assert_eq!(store.cached_count(), 1);
    }
}
