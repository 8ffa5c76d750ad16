//! エラー分類
//!
//! エンジン境界では失敗を `None` や空の結果として返すため、
//! ここで定義するエラーは主にログ出力と `decode` の戻り値で使われます。

use crate::uid::Uid;
use thiserror::Error;

/// DWARF解析で発生するエラー
#[derive(Debug, Error)]
pub enum DwarfError {
    /// 不正な略語コードや途中で切れた属性など、DIE単位の破損
    #[error("malformed DWARF data at {location}: {reason}")]
    MalformedData { location: String, reason: String },

    /// 存在しないセクション（多くは任意なので機能無効として扱う）
    #[error("section {0} is not present")]
    MissingSection(String),

    /// このエンジンが発行していない識別子
    #[error("invalid identifier {0}")]
    InvalidIdentifier(Uid),

    /// 分割デバッグファイル（.dwo/.dwp）が見つからない
    #[error("external debug file unavailable: {0}")]
    ExternalFileUnavailable(String),

    /// オブジェクトファイルの解析失敗
    #[error("failed to parse object file {path}: {reason}")]
    Object { path: String, reason: String },

    /// ファイル入出力
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DwarfError {
    /// gimliのエラーを位置情報付きの `MalformedData` に変換する
    pub fn malformed(location: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DwarfError::MalformedData {
            location: location.into(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DwarfError::malformed("info+0x2a", "unknown abbreviation code 99");
        assert_eq!(
            err.to_string(),
            "malformed DWARF data at info+0x2a: unknown abbreviation code 99"
        );

        let err = DwarfError::InvalidIdentifier(Uid(0xdead_0000_0000_0000));
        assert!(err.to_string().contains("invalid identifier"));
    }
}
