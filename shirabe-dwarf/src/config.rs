//! エンジン設定

use std::path::PathBuf;

/// DWARFエンジンの設定
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// .dwoファイルを探す追加ディレクトリ
    pub split_search_paths: Vec<PathBuf>,
    /// .dwpパッケージのパス（Noneならバイナリ名 + ".dwp"）
    pub package_path: Option<PathBuf>,
    /// スケルトンユニットの分割ファイルを読み込むかどうか
    pub load_split_units: bool,
    /// ブロック木の最大深さ（再帰制限）
    pub max_block_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            split_search_paths: Vec::new(),
            package_path: None,
            load_split_units: true,
            max_block_depth: 64,
        }
    }
}
