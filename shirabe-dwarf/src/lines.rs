//! ソース行情報

use crate::section::{DwarfReader, SectionCache};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// ソース行情報の取得
///
/// addr2lineのコンテキストは最初の検索時に一度だけ構築します。
pub struct LineInfoProvider {
    sections: Arc<SectionCache>,
    context: OnceCell<Option<Mutex<addr2line::Context<DwarfReader>>>>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(sections: Arc<SectionCache>) -> Self {
        Self {
            sections,
            context: OnceCell::new(),
        }
    }

    fn context(&self) -> Option<&Mutex<addr2line::Context<DwarfReader>>> {
        self.context
            .get_or_init(|| {
                let dwarf = match self.sections.load_dwarf() {
                    Ok(dwarf) => dwarf,
                    Err(e) => {
                        warn!("failed to load DWARF for line lookup: {}", e);
                        return None;
                    }
                };
                match addr2line::Context::from_dwarf(dwarf) {
                    Ok(ctx) => {
                        debug!("built line table context for {}", self.sections.source_name());
                        Some(Mutex::new(ctx))
                    }
                    Err(e) => {
                        warn!("failed to build line table context: {}", e);
                        None
                    }
                }
            })
            .as_ref()
    }

    /// アドレスからソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Option<LineInfo> {
        let ctx = self.context()?.lock();
        let location = match ctx.find_location(addr) {
            Ok(location) => location?,
            Err(e) => {
                debug!("line lookup failed at 0x{:x}: {}", addr, e);
                return None;
            }
        };
        Some(LineInfo {
            file: location.file?.to_string(),
            line: location.line?,
            column: location.column,
        })
    }
}
