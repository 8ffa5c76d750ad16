//! コンパイルユニットの索引と遅延解析

use crate::errors::DwarfError;
use crate::section::DwarfReader;
use crate::uid::{EntryRef, FileTag};
use crate::Result;
use gimli::{DebugInfoOffset, Reader, UnitOffset};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// 解析済みのコンパイルユニット
pub struct CompileUnit {
    index: usize,
    file: FileTag,
    offset: DebugInfoOffset<usize>,
    unit: gimli::Unit<DwarfReader>,
    name: Option<String>,
    comp_dir: Option<String>,
    producer: Option<String>,
    language: Option<gimli::DwLang>,
    dwo_name: Option<String>,
    /// ルートDIEが DW_AT_low_pc を持つ場合の基底アドレス（0も有効）
    base_address: Option<u64>,
    /// 子DIEオフセット -> 親DIEオフセット（初回の親探索で構築）
    parents: OnceCell<HashMap<UnitOffset<usize>, UnitOffset<usize>>>,
}

/// コンパイルユニットの概要（表示用）
#[derive(Debug, Clone)]
pub struct UnitSummary {
    pub index: usize,
    pub file: FileTag,
    pub offset: usize,
    pub version: u16,
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    pub producer: Option<String>,
    pub language: Option<String>,
    pub dwo_id: Option<u64>,
    pub dwo_name: Option<String>,
}

impl CompileUnit {
    fn parse(
        dwarf: &gimli::Dwarf<DwarfReader>,
        file: FileTag,
        index: usize,
        offset: DebugInfoOffset<usize>,
        skeleton: Option<&CompileUnit>,
    ) -> Result<Self> {
        let header = dwarf.debug_info.header_from_offset(offset)?;
        let mut unit = dwarf.unit(header)?;
        // 分割ユニットは .debug_addr などの基底をスケルトンから引き継ぐ
        if let Some(skeleton) = skeleton {
            unit.copy_relocated_attributes(skeleton.unit());
        }

        let name = unit
            .name
            .as_ref()
            .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()));
        let comp_dir = unit
            .comp_dir
            .as_ref()
            .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()));

        // ルートDIEから言語と生成元を取得
        let mut language = None;
        let mut producer = None;
        let mut has_low_pc = false;
        {
            let mut entries = unit.entries();
            if let Some((_, root)) = entries.next_dfs()? {
                if let Some(gimli::AttributeValue::Language(lang)) =
                    root.attr_value(gimli::DW_AT_language)?
                {
                    language = Some(lang);
                }
                has_low_pc = root.attr(gimli::DW_AT_low_pc)?.is_some();
                if let Some(value) = root.attr_value(gimli::DW_AT_producer)? {
                    producer = dwarf
                        .attr_string(&unit, value)
                        .ok()
                        .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()));
                }
            }
        }

        let dwo_name = match unit.dwo_name()? {
            Some(value) => dwarf
                .attr_string(&unit, value)
                .ok()
                .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned())),
            None => None,
        };

        // 分割ユニットの基底はスケルトン側の属性で決まる
        let base_address = match skeleton {
            Some(skeleton) => skeleton.base_address,
            None if has_low_pc => Some(unit.low_pc),
            None => None,
        };

        Ok(Self {
            index,
            file,
            offset,
            unit,
            name,
            comp_dir,
            producer,
            language,
            dwo_name,
            base_address,
            parents: OnceCell::new(),
        })
    }

    /// 論理インデックス
    pub fn index(&self) -> usize {
        self.index
    }

    /// 所属ファイル
    pub fn file(&self) -> FileTag {
        self.file
    }

    /// ヘッダの `.debug_info` オフセット
    pub fn offset(&self) -> DebugInfoOffset<usize> {
        self.offset
    }

    /// ユニットの終端オフセット（次のユニットの開始位置）
    pub fn end_offset(&self) -> usize {
        self.offset.0 + self.unit.header.length_including_self()
    }

    /// セクションオフセットがこのユニットに含まれるか
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.offset.0 && offset < self.end_offset()
    }

    /// gimliのユニット
    pub fn unit(&self) -> &gimli::Unit<DwarfReader> {
        &self.unit
    }

    /// DWARFバージョン
    pub fn version(&self) -> u16 {
        self.unit.header.version()
    }

    /// ソース言語
    pub fn language(&self) -> Option<gimli::DwLang> {
        self.language
    }

    /// DW_AT_name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// DW_AT_comp_dir
    pub fn comp_dir(&self) -> Option<&str> {
        self.comp_dir.as_deref()
    }

    /// ユニットの基底アドレス
    ///
    /// `DW_AT_low_pc` がない場合は `None`。値が0でも属性があれば `Some(0)` です。
    pub fn base_address(&self) -> Option<u64> {
        self.base_address
    }

    /// DWO ID
    pub fn dwo_id(&self) -> Option<u64> {
        self.unit.dwo_id.map(|id| id.0)
    }

    /// 分割ファイル名
    pub fn dwo_name(&self) -> Option<&str> {
        self.dwo_name.as_deref()
    }

    /// 分割データへの参照しか持たないスケルトンユニットか
    pub fn is_skeleton(&self) -> bool {
        if matches!(self.file, FileTag::Split(_)) {
            return false;
        }
        matches!(self.unit.header.type_(), gimli::UnitType::Skeleton(_)) || self.unit.dwo_id.is_some()
    }

    /// ユニット内オフセットをセクション参照に変換する
    pub fn entry_ref(&self, offset: UnitOffset<usize>) -> Option<EntryRef> {
        offset
            .to_debug_info_offset(&self.unit.header)
            .map(|o| EntryRef::new(self.file, o))
    }

    /// セクション参照をユニット内オフセットに変換する
    pub fn unit_offset(&self, entry: EntryRef) -> Option<UnitOffset<usize>> {
        if entry.file != self.file || !self.contains(entry.offset) {
            return None;
        }
        entry.debug_info_offset().to_unit_offset(&self.unit.header)
    }

    /// ルートDIEのオフセット
    pub fn root_offset(&self) -> Option<UnitOffset<usize>> {
        let mut entries = self.unit.entries();
        match entries.next_dfs() {
            Ok(Some((_, root))) => Some(root.offset()),
            _ => None,
        }
    }

    /// オフセットがDIEの先頭を指しているか
    pub fn has_entry(&self, offset: UnitOffset<usize>) -> bool {
        self.root_offset() == Some(offset) || self.parent_of(offset).is_some()
    }

    /// 親DIEのオフセットを取得する
    pub fn parent_of(&self, offset: UnitOffset<usize>) -> Option<UnitOffset<usize>> {
        self.parents
            .get_or_init(|| self.build_parent_map())
            .get(&offset)
            .copied()
    }

    /// ユニット全体を一度走査して親子関係を記録する
    ///
    /// 途中で不正なエントリに当たった場合は、それまでの結果を保持します。
    fn build_parent_map(&self) -> HashMap<UnitOffset<usize>, UnitOffset<usize>> {
        let mut parents = HashMap::new();
        let mut ancestors: Vec<UnitOffset<usize>> = Vec::new();
        let mut depth: isize = 0;
        let mut entries = self.unit.entries();

        loop {
            match entries.next_dfs() {
                Ok(Some((delta, entry))) => {
                    depth += delta;
                    ancestors.truncate(depth.max(0) as usize);
                    if let Some(parent) = ancestors.last() {
                        parents.insert(entry.offset(), *parent);
                    }
                    ancestors.push(entry.offset());
                }
                Ok(None) => break,
                Err(e) => {
                    let err = DwarfError::malformed(
                        format!("{} unit 0x{:x}", self.file, self.offset.0),
                        e,
                    );
                    warn!("stopped parent scan: {}", err);
                    break;
                }
            }
        }

        debug!(file = %self.file, unit = self.index, entries = parents.len() + 1, "built parent map");
        parents
    }

    /// 概要を作成する
    pub fn summary(&self) -> UnitSummary {
        UnitSummary {
            index: self.index,
            file: self.file,
            offset: self.offset.0,
            version: self.version(),
            name: self.name.clone(),
            comp_dir: self.comp_dir.clone(),
            producer: self.producer.clone(),
            language: self.language.map(|l| l.static_string().unwrap_or("DW_LANG_unknown").to_string()),
            dwo_id: self.dwo_id(),
            dwo_name: self.dwo_name.clone(),
        }
    }
}

/// 索引の1行（オフセットと遅延解析されるユニット）
struct UnitSlot {
    offset: DebugInfoOffset<usize>,
    /// 失敗も記録して再試行しない
    unit: OnceCell<Option<Arc<CompileUnit>>>,
}

/// ファイル内のコンパイルユニット索引
pub struct UnitIndex {
    file: FileTag,
    skeleton: Option<Arc<CompileUnit>>,
    slots: OnceCell<Vec<UnitSlot>>,
    parses: AtomicUsize,
}

impl UnitIndex {
    /// 空の索引を作成する
    pub fn new(file: FileTag) -> Self {
        Self {
            file,
            skeleton: None,
            slots: OnceCell::new(),
            parses: AtomicUsize::new(0),
        }
    }

    /// 分割ファイル用の索引を作成する
    pub fn for_split(file: FileTag, skeleton: Arc<CompileUnit>) -> Self {
        Self {
            skeleton: Some(skeleton),
            ..Self::new(file)
        }
    }

    /// ユニットヘッダ列を一度だけ走査して索引を作る
    fn build_index(&self, dwarf: &gimli::Dwarf<DwarfReader>) -> &[UnitSlot] {
        self.slots.get_or_init(|| {
            let mut slots = Vec::new();
            let mut headers = dwarf.units();
            loop {
                match headers.next() {
                    Ok(Some(header)) => {
                        if let Some(offset) = header.offset().as_debug_info_offset() {
                            slots.push(UnitSlot {
                                offset,
                                unit: OnceCell::new(),
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stopped unit header scan in {}: {}", self.file, e);
                        break;
                    }
                }
            }
            debug!(file = %self.file, units = slots.len(), "built compile unit index");
            slots
        })
    }

    /// ユニット数
    pub fn len(&self, dwarf: &gimli::Dwarf<DwarfReader>) -> usize {
        self.build_index(dwarf).len()
    }

    /// i番目のユニットのオフセット
    pub fn offset_at(
        &self,
        dwarf: &gimli::Dwarf<DwarfReader>,
        index: usize,
    ) -> Option<DebugInfoOffset<usize>> {
        self.build_index(dwarf).get(index).map(|slot| slot.offset)
    }

    /// i番目のユニットを取得する（未解析なら解析する）
    pub fn unit_at(
        &self,
        dwarf: &gimli::Dwarf<DwarfReader>,
        index: usize,
    ) -> Option<Arc<CompileUnit>> {
        let slot = self.build_index(dwarf).get(index)?;
        slot.unit
            .get_or_init(|| {
                self.parses.fetch_add(1, Ordering::SeqCst);
                match CompileUnit::parse(dwarf, self.file, index, slot.offset, self.skeleton.as_deref()) {
                    Ok(unit) => Some(Arc::new(unit)),
                    Err(e) => {
                        let err = DwarfError::malformed(
                            format!("{} unit 0x{:x}", self.file, slot.offset.0),
                            e,
                        );
                        warn!("failed to parse compile unit: {}", err);
                        None
                    }
                }
            })
            .clone()
    }

    /// セクションオフセットを含むユニットを探す
    pub fn unit_containing(
        &self,
        dwarf: &gimli::Dwarf<DwarfReader>,
        offset: usize,
    ) -> Option<Arc<CompileUnit>> {
        let slots = self.build_index(dwarf);
        let idx = slots.partition_point(|slot| slot.offset.0 <= offset);
        if idx == 0 {
            return None;
        }
        let unit = self.unit_at(dwarf, idx - 1)?;
        unit.contains(offset).then_some(unit)
    }

    /// ユニット解析の実行回数
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }
}
