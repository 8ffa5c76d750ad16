//! DWARFを保持する1つのファイル（メイン、分割ユニット、補助オブジェクト）

use crate::die::Die;
use crate::section::{DwarfReader, SectionCache};
use crate::uid::{EntryRef, FileTag};
use crate::unit::{CompileUnit, UnitIndex};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, warn};

/// DWARFファイル
pub struct DwarfFile {
    tag: FileTag,
    name: String,
    endian: gimli::RunTimeEndian,
    sections: Option<Arc<SectionCache>>,
    /// 初回のユニットアクセスで構築（失敗も記録する）
    dwarf: OnceCell<Option<gimli::Dwarf<DwarfReader>>>,
    units: UnitIndex,
}

impl DwarfFile {
    /// セクションキャッシュから遅延構築されるファイルを作成する
    pub fn from_sections(tag: FileTag, sections: SectionCache) -> Self {
        Self {
            tag,
            name: sections.source_name(),
            endian: sections.endian(),
            sections: Some(Arc::new(sections)),
            dwarf: OnceCell::new(),
            units: UnitIndex::new(tag),
        }
    }

    /// 構築済みの分割ユニットからファイルを作成する
    pub fn split(
        tag: FileTag,
        name: impl Into<String>,
        endian: gimli::RunTimeEndian,
        sections: Option<SectionCache>,
        dwarf: gimli::Dwarf<DwarfReader>,
        skeleton: Arc<CompileUnit>,
    ) -> Self {
        Self {
            tag,
            name: name.into(),
            endian,
            sections: sections.map(Arc::new),
            dwarf: OnceCell::with_value(Some(dwarf)),
            units: UnitIndex::for_split(tag, skeleton),
        }
    }

    /// ファイルタグ
    pub fn tag(&self) -> FileTag {
        self.tag
    }

    /// 表示名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// バイトオーダー
    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    /// セクションキャッシュ（分割パッケージ内のユニットにはない）
    pub fn sections(&self) -> Option<&Arc<SectionCache>> {
        self.sections.as_ref()
    }

    /// gimliの `Dwarf` を取得する
    pub fn dwarf(&self) -> Option<&gimli::Dwarf<DwarfReader>> {
        self.dwarf
            .get_or_init(|| {
                let sections = self.sections.as_ref()?;
                match sections.load_dwarf() {
                    Ok(dwarf) => {
                        debug!(file = %self.tag, name = %self.name, "loaded DWARF sections");
                        Some(dwarf)
                    }
                    Err(e) => {
                        warn!(file = %self.tag, "failed to load DWARF from {}: {}", self.name, e);
                        None
                    }
                }
            })
            .as_ref()
    }

    /// コンパイルユニット数
    pub fn num_units(&self) -> usize {
        self.dwarf().map_or(0, |dwarf| self.units.len(dwarf))
    }

    /// i番目のコンパイルユニット
    pub fn unit_at(&self, index: usize) -> Option<Arc<CompileUnit>> {
        self.units.unit_at(self.dwarf()?, index)
    }

    /// すべてのコンパイルユニット（解析に失敗したものは除く）
    pub fn units(&self) -> Vec<Arc<CompileUnit>> {
        (0..self.num_units()).filter_map(|i| self.unit_at(i)).collect()
    }

    /// セクションオフセットを含むユニット
    pub fn unit_containing(&self, offset: usize) -> Option<Arc<CompileUnit>> {
        self.units.unit_containing(self.dwarf()?, offset)
    }

    /// ユニット解析の実行回数
    pub fn parse_count(&self) -> usize {
        self.units.parse_count()
    }

    /// 参照が指すDIEを取得する
    ///
    /// 参照がこのファイルのものでない場合や、DIEの先頭を指していない場合は `None`。
    pub fn die(self: &Arc<Self>, entry: EntryRef) -> Option<Die> {
        if entry.file != self.tag {
            return None;
        }
        let unit = self.unit_containing(entry.offset)?;
        let offset = unit.unit_offset(entry)?;
        if !unit.has_entry(offset) {
            return None;
        }
        Some(Die::new(self.clone(), unit, offset, entry))
    }

    /// ユニットのルートDIE
    pub fn unit_root(self: &Arc<Self>, unit: &Arc<CompileUnit>) -> Option<Die> {
        let offset = unit.root_offset()?;
        let entry = unit.entry_ref(offset)?;
        Some(Die::new(self.clone(), unit.clone(), offset, entry))
    }
}
