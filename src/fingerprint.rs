use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// バイナリの内容由来の同一性
///
/// 同一性を決めるのはハッシュのみ。パスは表示用の付帯情報で、
/// コピー・移動されたバイナリでも同じfingerprintになる
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryFingerprint {
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
    pub modified: u64,
}

impl PartialEq for BinaryFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BinaryFingerprint {}

impl std::hash::Hash for BinaryFingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl BinaryFingerprint {
    /// 表示用のファイル名
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
    }

    /// ログ用の短縮ハッシュ
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(16)]
    }
}

/// ファイルのfingerprintを計算
///
/// SHA-256をストリーミングで計算する（巨大バイナリでもメモリを圧迫しない）。
/// 同じ内容なら必ず同じ結果、1バイトでも違えば別ハッシュになる
pub fn fingerprint(path: &Path) -> Result<BinaryFingerprint, AnalysisError> {
    let wrap = |source: std::io::Error| AnalysisError::Fingerprint {
        path: path.to_path_buf(),
        source,
    };

    let abs = path.canonicalize().map_err(wrap)?;
    let meta = std::fs::metadata(&abs).map_err(wrap)?;
    if !meta.is_file() {
        return Err(wrap(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    let mut file = File::open(&abs).map_err(wrap)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).map_err(wrap)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(BinaryFingerprint {
        path: abs,
        hash: format!("{:x}", hasher.finalize()),
        size: meta.len(),
        modified,
    })
}
