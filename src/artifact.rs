use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Ghidra側スクリプトが書き出す解析成果物
///
/// 旧版スクリプトは imports/exports/callers/callees を持たないため、
/// 欠けたフィールドは空列として読む（スキーマのバージョン番号は持たない）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub functions: Vec<FunctionRecord>,
    #[serde(default)]
    pub strings: Vec<StringRecord>,
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    #[serde(default)]
    pub exports: Vec<ExportRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    /// エントリアドレス（"00401000" のような文字列表現）
    pub entry: String,
    /// デコンパイル結果のC疑似コード、失敗時はプレースホルダコメント
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub callers: Vec<String>,
    #[serde(default)]
    pub callees: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringRecord {
    pub value: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRecord {
    #[serde(default)]
    pub library: String,
    /// 未解決シンボルはスクリプト側が "Unlabeled" を入れる
    pub name: String,
    /// アドレス未解決時はスクリプト側が "External" を入れる
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub name: String,
    #[serde(default)]
    pub address: String,
}

/// 件数だけの軽量サマリー（MCPレスポンス・バッチ結果用）
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub filename: String,
    pub functions: usize,
    pub strings: usize,
    pub imports: usize,
    pub exports: usize,
}

impl AnalysisArtifact {
    /// JSONファイルから読み込み
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let raw = std::fs::read_to_string(path).map_err(|e| AnalysisError::ArtifactParse {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AnalysisError> {
        serde_json::from_str(raw).map_err(|e| AnalysisError::ArtifactParse {
            message: e.to_string(),
        })
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            filename: self.filename.clone(),
            functions: self.functions.len(),
            strings: self.strings.len(),
            imports: self.imports.len(),
            exports: self.exports.len(),
        }
    }
}

/// 関数の引き当てインデックス
///
/// コールグラフの同一性は名前ベースだが、stripped binaryでは名前が重複しうる。
/// エントリアドレスを主キーに持ち、名前→アドレス列の多重マップで引くことで
/// 同名の別関数をサイレントにマージしない
pub struct FunctionIndex<'a> {
    by_entry: HashMap<&'a str, &'a FunctionRecord>,
    by_name: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> FunctionIndex<'a> {
    pub fn build(artifact: &'a AnalysisArtifact) -> Self {
        let mut by_entry: HashMap<&str, &FunctionRecord> = HashMap::new();
        let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        for func in &artifact.functions {
            by_entry.insert(func.entry.as_str(), func);
            by_name
                .entry(func.name.as_str())
                .or_default()
                .push(func.entry.as_str());
        }
        Self { by_entry, by_name }
    }

    /// エントリアドレスで引く
    pub fn at(&self, entry: &str) -> Option<&'a FunctionRecord> {
        self.by_entry.get(entry).copied()
    }

    /// 名前で引く。重複名はすべて返す（呼び出し側が曖昧さを報告する）
    pub fn named(&self, name: &str) -> Vec<&'a FunctionRecord> {
        self.by_name
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| self.at(entry))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_schema() {
        let raw = r#"{
            "filename": "sample.exe",
            "timestamp": "2024-01-01_12-00-00",
            "functions": [
                {"name": "main", "entry": "00401000", "code": "int main(void) {}",
                 "callers": [], "callees": ["sub_1"]}
            ],
            "strings": [{"value": "hello", "address": "00402000"}],
            "imports": [{"library": "KERNEL32.dll", "name": "ExitProcess", "address": "External"}],
            "exports": [{"name": "main", "address": "00401000"}]
        }"#;
        let artifact = AnalysisArtifact::from_json(raw).unwrap();
        assert_eq!(artifact.functions.len(), 1);
        assert_eq!(artifact.functions[0].callees, vec!["sub_1"]);
        assert_eq!(artifact.imports[0].address, "External");
        let summary = artifact.summary();
        assert_eq!(summary.functions, 1);
        assert_eq!(summary.exports, 1);
    }

    #[test]
    fn test_parse_legacy_schema_without_imports_exports() {
        // 旧版スクリプトの出力: imports/exports/callers/callees が無い
        let raw = r#"{
            "filename": "old.bin",
            "timestamp": "2023-06-01_00-00-00",
            "functions": [{"name": "entry", "entry": "00001000", "code": "// Decompilation failed"}],
            "strings": []
        }"#;
        let artifact = AnalysisArtifact::from_json(raw).unwrap();
        assert!(artifact.imports.is_empty());
        assert!(artifact.exports.is_empty());
        assert!(artifact.functions[0].callers.is_empty());
        assert!(artifact.functions[0].callees.is_empty());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = AnalysisArtifact::from_json("{ not json").unwrap_err();
        assert_eq!(err.code(), "ARTIFACT_PARSE_ERROR");

        // 型が合わないものも拒否
        let err = AnalysisArtifact::from_json(r#"{"functions": "nope"}"#).unwrap_err();
        assert_eq!(err.code(), "ARTIFACT_PARSE_ERROR");
    }

    #[test]
    fn test_function_index_keeps_duplicate_names_apart() {
        let raw = r#"{
            "filename": "stripped.so",
            "timestamp": "t",
            "functions": [
                {"name": "FUN_1", "entry": "00001000", "code": "a"},
                {"name": "dup", "entry": "00002000", "code": "b"},
                {"name": "dup", "entry": "00003000", "code": "c"}
            ],
            "strings": []
        }"#;
        let artifact = AnalysisArtifact::from_json(raw).unwrap();
        let index = FunctionIndex::build(&artifact);

        assert_eq!(index.named("FUN_1").len(), 1);
        let dups = index.named("dup");
        assert_eq!(dups.len(), 2);
        assert_ne!(dups[0].entry, dups[1].entry);
        assert!(index.named("missing").is_empty());
        assert_eq!(index.at("00002000").unwrap().code, "b");
    }
}
