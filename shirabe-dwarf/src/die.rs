//! DIE（Debug Information Entry）の遅延アクセス
//!
//! `Die` はファイル・ユニット・ユニット内オフセットの組で、実際のデコードは
//! `load()` や `children()` が呼ばれたときに行います。

use crate::errors::DwarfError;
use crate::file::DwarfFile;
use crate::section::DwarfReader;
use crate::uid::{EntryRef, Uid};
use crate::unit::CompileUnit;
use crate::Result;
use gimli::{AttributeValue, DwAt, DwTag, Reader, UnitOffset};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::warn;

/// デコード済みの属性値
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Unsigned(u64),
    Signed(i64),
    /// 固定長の定数（data1/2/4/8）。符号の有無は型の側で決まる
    Data { value: u64, size: u8 },
    Flag(bool),
    Address(u64),
    /// 同じファイル内の別DIEへの参照
    Reference(EntryRef),
    /// DWARF式（exprloc）
    Expression(Vec<u8>),
    /// ロケーションリストのセクションオフセット
    LocationList(usize),
    /// 範囲リストのセクションオフセット
    RangeList(usize),
    Language(gimli::DwLang),
    Encoding(gimli::DwAte),
    Block(Vec<u8>),
    /// このエンジンでは解釈しない値
    Other(String),
}

impl AttrValue {
    /// 符号なし整数として取得する
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            AttrValue::Unsigned(v) | AttrValue::Address(v) => Some(*v),
            AttrValue::Data { value, .. } => Some(*value),
            AttrValue::Signed(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// 符号付き整数として取得する
    pub fn as_signed(&self) -> Option<i64> {
        match self {
            AttrValue::Signed(v) => Some(*v),
            AttrValue::Unsigned(v) => Some(*v as i64),
            AttrValue::Data { value, .. } => Some(*value as i64),
            _ => None,
        }
    }

    /// 固定長の定数を符号拡張して取得する
    pub fn sign_extended(&self) -> Option<i64> {
        match self {
            AttrValue::Data { value, size } if *size < 8 => {
                let shift = 64 - u32::from(*size) * 8;
                Some(((*value << shift) as i64) >> shift)
            }
            other => other.as_signed(),
        }
    }
}

/// デコード済みのDIE
#[derive(Debug, Clone)]
pub struct DieData {
    pub entry: EntryRef,
    pub tag: DwTag,
    pub has_children: bool,
    pub attrs: Vec<(DwAt, AttrValue)>,
    /// DW_AT_low_pc/high_pc または DW_AT_ranges から得たアドレス範囲
    pub ranges: Vec<Range<u64>>,
}

impl DieData {
    pub fn attr(&self, at: DwAt) -> Option<&AttrValue> {
        self.attrs.iter().find(|(a, _)| *a == at).map(|(_, v)| v)
    }

    pub fn string(&self, at: DwAt) -> Option<&str> {
        match self.attr(at)? {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn unsigned(&self, at: DwAt) -> Option<u64> {
        self.attr(at)?.as_unsigned()
    }

    pub fn signed(&self, at: DwAt) -> Option<i64> {
        self.attr(at)?.as_signed()
    }

    pub fn flag(&self, at: DwAt) -> bool {
        matches!(self.attr(at), Some(AttrValue::Flag(true)))
    }

    pub fn reference(&self, at: DwAt) -> Option<EntryRef> {
        match self.attr(at)? {
            AttrValue::Reference(entry) => Some(*entry),
            _ => None,
        }
    }

    /// DW_AT_name
    pub fn name(&self) -> Option<&str> {
        self.string(gimli::DW_AT_name)
    }

    /// DW_AT_linkage_name（古いMIPS形式も含む）
    pub fn linkage_name(&self) -> Option<&str> {
        self.string(gimli::DW_AT_linkage_name)
            .or_else(|| self.string(gimli::DW_AT_MIPS_linkage_name))
    }

    /// 前方宣言か
    pub fn is_declaration(&self) -> bool {
        self.flag(gimli::DW_AT_declaration)
    }

    /// DW_AT_byte_size
    pub fn byte_size(&self) -> Option<u64> {
        self.unsigned(gimli::DW_AT_byte_size)
    }

    /// 関数の入口アドレス（DW_AT_entry_pc、なければ最小の開始アドレス）
    pub fn entry_pc(&self) -> Option<u64> {
        if let Some(AttrValue::Address(addr)) = self.attr(gimli::DW_AT_entry_pc) {
            return Some(*addr);
        }
        if let Some(AttrValue::Address(addr)) = self.attr(gimli::DW_AT_low_pc) {
            return Some(*addr);
        }
        self.ranges.iter().map(|r| r.start).min()
    }
}

/// DW_AT_specification / DW_AT_abstract_origin を辿る上限
const MAX_ORIGIN_HOPS: usize = 64;

/// DIEへのハンドル
#[derive(Clone)]
pub struct Die {
    file: Arc<DwarfFile>,
    unit: Arc<CompileUnit>,
    offset: UnitOffset<usize>,
    entry: EntryRef,
}

impl fmt::Debug for Die {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Die").field(&self.entry).finish()
    }
}

/// 宣言コンテキストになるタグ
fn is_decl_context(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_namespace
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_class_type
            | gimli::DW_TAG_union_type
            | gimli::DW_TAG_enumeration_type
            | gimli::DW_TAG_subprogram
            | gimli::DW_TAG_compile_unit
            | gimli::DW_TAG_partial_unit
            | gimli::DW_TAG_skeleton_unit
    )
}

fn is_unit_tag(tag: DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_compile_unit | gimli::DW_TAG_partial_unit | gimli::DW_TAG_skeleton_unit
    )
}

impl Die {
    pub(crate) fn new(
        file: Arc<DwarfFile>,
        unit: Arc<CompileUnit>,
        offset: UnitOffset<usize>,
        entry: EntryRef,
    ) -> Self {
        Self {
            file,
            unit,
            offset,
            entry,
        }
    }

    pub fn file(&self) -> &Arc<DwarfFile> {
        &self.file
    }

    pub fn unit(&self) -> &Arc<CompileUnit> {
        &self.unit
    }

    pub fn offset(&self) -> UnitOffset<usize> {
        self.offset
    }

    pub fn entry_ref(&self) -> EntryRef {
        self.entry
    }

    pub fn uid(&self) -> Uid {
        self.entry.uid()
    }

    fn location(&self) -> String {
        self.entry.to_string()
    }

    fn dwarf(&self) -> Result<&gimli::Dwarf<DwarfReader>> {
        self.file
            .dwarf()
            .ok_or_else(|| DwarfError::MissingSection(".debug_info".to_string()).into())
    }

    /// タグだけを読む
    pub fn tag(&self) -> Option<DwTag> {
        self.unit.unit().entry(self.offset).ok().map(|entry| entry.tag())
    }

    /// 属性をすべてデコードする
    pub fn load(&self) -> Result<DieData> {
        self.load_inner()
            .map_err(|e| DwarfError::malformed(self.location(), e).into())
    }

    fn load_inner(&self) -> Result<DieData> {
        let dwarf = self.dwarf()?;
        let unit = self.unit.unit();
        let entry = unit.entry(self.offset)?;

        let mut attrs = Vec::new();
        let mut iter = entry.attrs();
        while let Some(attr) = iter.next()? {
            let value = self.decode_attr(dwarf, attr.value())?;
            attrs.push((attr.name(), value));
        }

        let mut ranges = Vec::new();
        let mut range_iter = dwarf.die_ranges(unit, &entry)?;
        while let Some(range) = range_iter.next()? {
            if range.begin < range.end {
                ranges.push(range.begin..range.end);
            }
        }

        Ok(DieData {
            entry: self.entry,
            tag: entry.tag(),
            has_children: entry.has_children(),
            attrs,
            ranges,
        })
    }

    fn decode_attr(
        &self,
        dwarf: &gimli::Dwarf<DwarfReader>,
        value: AttributeValue<DwarfReader>,
    ) -> Result<AttrValue> {
        let unit = self.unit.unit();
        let decoded = match value {
            AttributeValue::UnitRef(offset) => match self.unit.entry_ref(offset) {
                Some(entry) => AttrValue::Reference(entry),
                None => anyhow::bail!("unit reference 0x{:x} out of range", offset.0),
            },
            AttributeValue::DebugInfoRef(offset) => {
                AttrValue::Reference(EntryRef::new(self.file.tag(), offset))
            }
            AttributeValue::Addr(addr) => AttrValue::Address(addr),
            AttributeValue::DebugAddrIndex(index) => AttrValue::Address(dwarf.address(unit, index)?),
            AttributeValue::Udata(v) => AttrValue::Unsigned(v),
            AttributeValue::Data1(v) => AttrValue::Data {
                value: u64::from(v),
                size: 1,
            },
            AttributeValue::Data2(v) => AttrValue::Data {
                value: u64::from(v),
                size: 2,
            },
            AttributeValue::Data4(v) => AttrValue::Data {
                value: u64::from(v),
                size: 4,
            },
            AttributeValue::Data8(v) => AttrValue::Data { value: v, size: 8 },
            AttributeValue::Sdata(v) => AttrValue::Signed(v),
            AttributeValue::Flag(b) => AttrValue::Flag(b),
            AttributeValue::Exprloc(expr) => AttrValue::Expression(expr.0.to_slice()?.into_owned()),
            AttributeValue::Block(block) => AttrValue::Block(block.to_slice()?.into_owned()),
            AttributeValue::LocationListsRef(offset) => AttrValue::LocationList(offset.0),
            AttributeValue::DebugLocListsIndex(index) => {
                AttrValue::LocationList(dwarf.locations_offset(unit, index)?.0)
            }
            AttributeValue::RangeListsRef(offset) => AttrValue::RangeList(offset.0),
            AttributeValue::DebugRngListsIndex(index) => {
                AttrValue::RangeList(dwarf.ranges_offset(unit, index)?.0)
            }
            AttributeValue::Language(lang) => AttrValue::Language(lang),
            AttributeValue::Encoding(enc) => AttrValue::Encoding(enc),
            AttributeValue::DwoId(id) => AttrValue::Unsigned(id.0),
            value @ (AttributeValue::String(_)
            | AttributeValue::DebugStrRef(_)
            | AttributeValue::DebugStrOffsetsIndex(_)
            | AttributeValue::DebugLineStrRef(_)
            | AttributeValue::DebugStrRefSup(_)) => {
                let s = dwarf.attr_string(unit, value)?;
                AttrValue::String(s.to_string_lossy()?.into_owned())
            }
            other => AttrValue::Other(format!("{:?}", other)),
        };
        Ok(decoded)
    }

    /// 名前だけを読む
    pub fn name(&self) -> Option<String> {
        self.load().ok()?.name().map(str::to_string)
    }

    /// 同じファイル内の参照先DIEを取得する
    pub fn follow(&self, entry: EntryRef) -> Option<Die> {
        self.file.die(entry)
    }

    /// 子DIEの一覧
    ///
    /// 途中で不正なエントリに当たった場合は、それまでに読めた子だけを返します。
    pub fn children(&self) -> Vec<Die> {
        let mut result = Vec::new();
        if let Err(e) = self.collect_children(&mut result) {
            warn!(
                "stopped reading children: {}",
                DwarfError::malformed(self.location(), e)
            );
        }
        result
    }

    fn collect_children(&self, result: &mut Vec<Die>) -> Result<()> {
        let unit = self.unit.unit();
        let mut tree = unit.entries_tree(Some(self.offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let offset = child.entry().offset();
            if let Some(entry) = self.unit.entry_ref(offset) {
                result.push(Die::new(self.file.clone(), self.unit.clone(), offset, entry));
            }
        }
        Ok(())
    }

    /// 親DIE
    pub fn parent(&self) -> Option<Die> {
        let offset = self.unit.parent_of(self.offset)?;
        let entry = self.unit.entry_ref(offset)?;
        Some(Die::new(self.file.clone(), self.unit.clone(), offset, entry))
    }

    /// 次の兄弟DIE
    pub fn next_sibling(&self) -> Option<Die> {
        let siblings = self.parent()?.children();
        let pos = siblings.iter().position(|d| d.offset == self.offset)?;
        siblings.into_iter().nth(pos + 1)
    }

    /// 最も近い宣言コンテキスト（名前空間・レコード・列挙・関数）
    ///
    /// レキシカルブロックなどは読み飛ばします。ユニット直下なら `None`。
    pub fn enclosing_decl_context(&self) -> Option<Die> {
        let mut current = self.parent();
        while let Some(die) = current {
            let tag = die.tag()?;
            if is_unit_tag(tag) {
                return None;
            }
            if is_decl_context(tag) {
                return Some(die);
            }
            current = die.parent();
        }
        None
    }

    /// 宣言の本体（DW_AT_specification / DW_AT_abstract_origin の参照先）
    pub fn declaration_origin(&self, data: &DieData) -> Option<Die> {
        data.reference(gimli::DW_AT_specification)
            .or_else(|| data.reference(gimli::DW_AT_abstract_origin))
            .and_then(|entry| self.follow(entry))
    }

    /// 宣言コンテキストを決めるDIE
    ///
    /// 定義がクラス外にある場合は DW_AT_specification / DW_AT_abstract_origin を
    /// 辿った先の宣言を返します。参照が循環している場合は壊れたデータとして
    /// 警告し、自身を返します。
    fn declaration_scope(&self) -> Die {
        let mut visited = HashSet::new();
        visited.insert(self.entry);
        let mut current = self.clone();
        loop {
            let origin = match current.load() {
                Ok(data) => current.declaration_origin(&data),
                Err(_) => None,
            };
            let Some(origin) = origin else {
                return current;
            };
            if !visited.insert(origin.entry) || visited.len() > MAX_ORIGIN_HOPS {
                warn!(
                    "{}",
                    DwarfError::malformed(self.location(), "cyclic declaration origin chain")
                );
                return self.clone();
            }
            current = origin;
        }
    }

    /// 外側から順に並べた宣言コンテキストの名前
    pub fn decl_context_names(&self) -> Vec<String> {
        let scope = self.declaration_scope();
        let mut names = Vec::new();
        let mut current = scope.enclosing_decl_context();
        let mut depth = 0;
        while let Some(die) = current {
            depth += 1;
            if depth > 256 {
                break;
            }
            let name = die.load().ok().and_then(|d| {
                d.name().map(str::to_string).or_else(|| {
                    (d.tag == gimli::DW_TAG_namespace).then(|| "(anonymous namespace)".to_string())
                })
            });
            if let Some(name) = name {
                names.push(name);
            }
            current = die.enclosing_decl_context();
        }
        names.reverse();
        names
    }

    /// `::` で連結した完全修飾名
    pub fn qualified_name(&self) -> Option<String> {
        let data = self.load().ok()?;
        let name = match data.name() {
            Some(name) => name.to_string(),
            None => self
                .declaration_origin(&data)
                .and_then(|origin| origin.load().ok())
                .and_then(|d| d.name().map(str::to_string))?,
        };
        let mut parts = self.decl_context_names();
        parts.push(name);
        Some(parts.join("::"))
    }

    /// ユニット直下のDIEか
    pub fn is_top_level(&self) -> bool {
        match self.parent() {
            Some(parent) => parent.tag().map_or(false, is_unit_tag),
            None => false,
        }
    }
}
