//! オブジェクトファイルからのエンジン構築

use crate::config::EngineConfig;
use crate::engine::DwarfEngine;
use crate::section::ObjectFileSource;
use crate::split::FsLocator;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// DWARFローダー
pub struct DwarfLoader;

impl DwarfLoader {
    /// ELF/Mach-OファイルからDWARFエンジンを作成する
    ///
    /// ファイルの読み込みとヘッダの検証だけを行い、デバッグセクションは
    /// 最初に必要になったときに読み込まれます。.dwo / .dwp はバイナリと同じ
    /// ディレクトリ、DW_AT_comp_dir、設定の検索パスから探します。
    pub fn load<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<DwarfEngine> {
        let path = path.as_ref();
        let source = ObjectFileSource::open(path)?;
        let locator = FsLocator::new(path, &config);

        info!("loaded {}", path.display());
        Ok(DwarfEngine::with_locator(
            Arc::new(source),
            Arc::new(locator),
            config,
        ))
    }

    /// 補助オブジェクトファイル（デバッグマップ）と合わせて読み込む
    pub fn load_with_companions<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        companions: &[Q],
        config: EngineConfig,
    ) -> Result<DwarfEngine> {
        let mut engine = Self::load(path, config)?;
        for companion in companions {
            let source = ObjectFileSource::open(companion)?;
            engine.add_companion(Arc::new(source));
        }
        Ok(engine)
    }
}
