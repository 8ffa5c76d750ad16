//! DWARF解決エンジン
//!
//! メインファイル・分割ユニット・補助オブジェクトをまとめて1つのモジュールとして
//! 扱い、識別子の発行、アドレス検索、名前検索、解決済みエンティティの
//! キャッシュを提供します。
//!
//! キャッシュの更新はすべて1つの再入可能ロックの下で行います。セクション読み込み、
//! ユニット解析、名前索引、行テーブルは一度きり初期化のセルで守られ、その初期化中に
//! このロックを取ることはありません。

use crate::config::EngineConfig;
use crate::die::Die;
use crate::entity::{Block, Function, Namespace, ResolvedEntity, Type, Variable};
use crate::errors::DwarfError;
use crate::file::DwarfFile;
use crate::lines::{LineInfo, LineInfoProvider};
use crate::location::VariableLocation;
use crate::names::NameIndex;
use crate::ranges::{RangeEntry, RangeIndex, RangeKind};
use crate::section::{SectionCache, SectionNaming, SectionSource};
use crate::split::{DebugFileLocator, DwarfPackage, NullLocator, SplitRegistry};
use crate::uid::{self, EntryRef, FileTag, Uid};
use crate::unique::UniqueTypeMap;
use crate::unit::{CompileUnit, UnitSummary};
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// エンジンが所有するキャッシュ
#[derive(Default)]
pub(crate) struct Caches {
    pub(crate) types: HashMap<EntryRef, Arc<Type>>,
    pub(crate) variables: HashMap<EntryRef, Arc<Variable>>,
    pub(crate) functions: HashMap<EntryRef, Arc<Function>>,
    pub(crate) blocks: HashMap<EntryRef, Arc<Block>>,
    pub(crate) namespaces: HashMap<EntryRef, Arc<Namespace>>,
    pub(crate) unique: UniqueTypeMap,
}

/// アドレスに対応する情報一式
#[derive(Debug, Clone, Default)]
pub struct SymbolContext {
    pub address: u64,
    pub unit: Option<UnitSummary>,
    pub function: Option<Arc<Function>>,
    /// アドレスを含む最も内側のブロック
    pub block: Option<Arc<Block>>,
    pub line: Option<LineInfo>,
}

/// キャッシュの件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub types: usize,
    pub unique_types: usize,
    pub variables: usize,
    pub functions: usize,
    pub blocks: usize,
    pub namespaces: usize,
}

/// DWARF解決エンジン
pub struct DwarfEngine {
    pub(crate) config: EngineConfig,
    pub(crate) primary: Arc<DwarfFile>,
    pub(crate) companions: Vec<Arc<DwarfFile>>,
    pub(crate) splits: SplitRegistry,
    pub(crate) caches: ReentrantMutex<RefCell<Caches>>,
    ranges: OnceCell<RangeIndex>,
    names: OnceCell<NameIndex>,
    lines: Option<LineInfoProvider>,
}

impl DwarfEngine {
    /// 分割ファイルを探さないエンジンを作成する
    pub fn new(source: Arc<dyn SectionSource>, config: EngineConfig) -> Self {
        Self::with_locator(source, Arc::new(NullLocator), config)
    }

    /// 分割ファイルのロケータを指定してエンジンを作成する
    pub fn with_locator(
        source: Arc<dyn SectionSource>,
        locator: Arc<dyn DebugFileLocator>,
        config: EngineConfig,
    ) -> Self {
        let primary = Arc::new(DwarfFile::from_sections(
            FileTag::Primary,
            SectionCache::new(source, SectionNaming::Main),
        ));
        let lines = primary.sections().map(|s| LineInfoProvider::new(s.clone()));
        let splits = SplitRegistry::new(locator, config.load_split_units);

        Self {
            config,
            primary,
            companions: Vec::new(),
            splits,
            caches: ReentrantMutex::new(RefCell::new(Caches::default())),
            ranges: OnceCell::new(),
            names: OnceCell::new(),
            lines,
        }
    }

    /// 同じモジュールを構成する補助オブジェクトファイルを追加する
    ///
    /// 識別子のタグに番号が収まらない場合は追加せず `None` を返します。
    pub fn add_companion(&mut self, source: Arc<dyn SectionSource>) -> Option<FileTag> {
        let Some(tag) = FileTag::companion(self.companions.len()) else {
            warn!("too many companion objects; ignoring {}", source.display_name());
            return None;
        };
        let file = DwarfFile::from_sections(tag, SectionCache::new(source, SectionNaming::Main));
        info!(file = %tag, "added companion object {}", file.name());
        self.companions.push(Arc::new(file));
        // 索引は次の検索で作り直す
        self.ranges = OnceCell::new();
        self.names = OnceCell::new();
        Some(tag)
    }

    /// 設定
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// メインファイル
    pub fn primary(&self) -> &Arc<DwarfFile> {
        &self.primary
    }

    /// メインファイルのセクションを取得する
    pub fn section(&self, id: gimli::SectionId) -> Arc<[u8]> {
        match self.primary.sections() {
            Some(sections) => sections.section(id),
            None => Arc::from(Vec::new()),
        }
    }

    /// タグに対応するファイル
    pub fn file(&self, tag: FileTag) -> Option<Arc<DwarfFile>> {
        match tag {
            FileTag::Primary => Some(self.primary.clone()),
            FileTag::Split(n) => self.splits.file(n),
            FileTag::Companion(n) => self.companions.get(n as usize).cloned(),
        }
    }

    /// 参照を識別子に変換する
    pub fn encode(&self, entry: EntryRef) -> Uid {
        uid::encode(entry)
    }

    /// 識別子を参照に戻す
    ///
    /// ファイルが存在し、その位置からDIEが始まっている場合だけ成功します。
    /// 必要ならユニットを解析します。
    pub fn decode(&self, uid: Uid) -> std::result::Result<EntryRef, DwarfError> {
        let entry = uid::decode_bits(uid);
        match self.file(entry.file).and_then(|file| file.die(entry)) {
            Some(_) => Ok(entry),
            None => Err(DwarfError::InvalidIdentifier(uid)),
        }
    }

    /// メインファイルのコンパイルユニット数
    pub fn num_compile_units(&self) -> usize {
        self.primary.num_units()
    }

    /// メインファイルのi番目のコンパイルユニット
    pub fn unit_at(&self, index: usize) -> Option<Arc<CompileUnit>> {
        self.primary.unit_at(index)
    }

    /// メインファイルのユニット解析回数
    pub fn parse_count(&self) -> usize {
        self.primary.parse_count()
    }

    /// 参照が指すDIE
    pub fn die(&self, entry: EntryRef) -> Option<Die> {
        self.file(entry.file)?.die(entry)
    }

    /// スケルトンユニットの分割ファイル
    pub fn dwo_for(&self, unit: &Arc<CompileUnit>) -> Option<Arc<DwarfFile>> {
        let parent = self.file(unit.file())?;
        self.splits.dwo_for(&parent, unit)
    }

    /// .dwp パッケージ
    pub fn dwp(&self) -> Option<Arc<DwarfPackage>> {
        self.splits.package()
    }

    /// メインファイルと補助オブジェクト
    fn base_files(&self) -> Vec<Arc<DwarfFile>> {
        let mut files = vec![self.primary.clone()];
        files.extend(self.companions.iter().cloned());
        files
    }

    /// 走査対象のユニットのルートDIE
    ///
    /// スケルトンユニットは分割ユニットに置き換え、見つからなければ
    /// スケルトン自身を使います。
    pub(crate) fn unit_roots(&self) -> Vec<Die> {
        let mut roots = Vec::new();
        for file in self.base_files() {
            for unit in file.units() {
                if unit.is_skeleton() {
                    if let Some(split) = self.dwo_for(&unit) {
                        roots.extend(split.units().iter().filter_map(|u| split.unit_root(u)));
                        continue;
                    }
                }
                roots.extend(file.unit_root(&unit));
            }
        }
        roots
    }

    /// 全コンパイルユニットの概要
    pub fn compile_units(&self) -> Vec<UnitSummary> {
        let mut summaries = Vec::new();
        for file in self.base_files() {
            for unit in file.units() {
                summaries.push(unit.summary());
                if unit.is_skeleton() {
                    if let Some(split) = self.dwo_for(&unit) {
                        summaries.extend(split.units().iter().map(|u| u.summary()));
                    }
                }
            }
        }
        summaries
    }

    /// 識別子からエンティティを解決する
    pub fn resolve(&self, uid: Uid) -> Option<ResolvedEntity> {
        let entry = self.decode(uid).ok()?;
        let die = self.die(entry)?;
        let tag = die.tag()?;

        if crate::entity::TypeKind::from_tag(tag).is_some() {
            return self.resolve_type(entry).map(ResolvedEntity::Type);
        }
        match tag {
            gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                self.resolve_variable(entry, None).map(ResolvedEntity::Variable)
            }
            gimli::DW_TAG_subprogram => self.resolve_function(entry).map(ResolvedEntity::Function),
            gimli::DW_TAG_lexical_block | gimli::DW_TAG_inlined_subroutine => {
                self.resolve_block(entry).map(ResolvedEntity::Block)
            }
            gimli::DW_TAG_namespace => self.resolve_namespace(entry).map(ResolvedEntity::Namespace),
            _ => None,
        }
    }

    /// アドレス範囲索引（最初の呼び出しで構築）
    pub fn range_index(&self) -> &RangeIndex {
        if let Some(index) = self.ranges.get() {
            return index;
        }
        let _guard = self.caches.lock();
        self.ranges.get_or_init(|| self.build_range_index())
    }

    fn build_range_index(&self) -> RangeIndex {
        let mut entries = Vec::new();
        for root in self.unit_roots() {
            self.collect_ranges(&root, &mut entries);
        }
        let index = RangeIndex::from_entries(entries);
        debug!(entries = index.len(), "built address range index");
        index
    }

    fn collect_ranges(&self, parent: &Die, entries: &mut Vec<RangeEntry>) {
        for child in parent.children() {
            let Some(tag) = child.tag() else { continue };
            match tag {
                gimli::DW_TAG_namespace => self.collect_ranges(&child, entries),
                gimli::DW_TAG_subprogram => {
                    let Ok(data) = child.load() else { continue };
                    if data.is_declaration() {
                        continue;
                    }
                    for range in data.ranges {
                        entries.push(RangeEntry {
                            range,
                            entry: child.entry_ref(),
                            kind: RangeKind::Function,
                        });
                    }
                }
                gimli::DW_TAG_variable => {
                    let Some(var) = self.resolve_variable(child.entry_ref(), None) else {
                        continue;
                    };
                    if let VariableLocation::Address(addr) = var.location {
                        let size = var.ty().and_then(|t| t.byte_size()).unwrap_or(1).max(1);
                        entries.push(RangeEntry {
                            range: addr..addr.saturating_add(size),
                            entry: child.entry_ref(),
                            kind: RangeKind::Variable,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    /// アドレスを含む関数またはグローバル変数
    pub fn lookup_address(&self, address: u64) -> Option<ResolvedEntity> {
        let found = self.range_index().lookup(address)?.clone();
        match found.kind {
            RangeKind::Function => self.resolve_function(found.entry).map(ResolvedEntity::Function),
            RangeKind::Variable => self
                .resolve_variable(found.entry, None)
                .map(ResolvedEntity::Variable),
        }
    }

    /// 名前索引（最初の呼び出しで構築）
    pub fn name_index(&self) -> &NameIndex {
        self.names.get_or_init(|| {
            let mut index = NameIndex::new();
            for root in self.unit_roots() {
                index.index_unit(&root);
            }
            debug!(names = index.len(), "built name index");
            index
        })
    }

    /// 名前で関数を探す（基本名・修飾名・リンケージ名）
    pub fn find_functions(&self, name: &str) -> Vec<Arc<Function>> {
        self.name_index()
            .functions(name)
            .iter()
            .filter_map(|entry| self.resolve_function(*entry))
            .collect()
    }

    /// 名前でグローバル変数を探す
    pub fn find_global_variables(&self, name: &str) -> Vec<Arc<Variable>> {
        self.name_index()
            .variables(name)
            .iter()
            .filter_map(|entry| self.resolve_variable(*entry, None))
            .collect()
    }

    /// 名前で型を探す（重複排除済みの正規型を返す）
    pub fn find_types(&self, name: &str) -> Vec<Arc<Type>> {
        let mut types: Vec<Arc<Type>> = Vec::new();
        for entry in self.name_index().types(name) {
            if let Some(ty) = self.resolve_type(*entry) {
                if !types.iter().any(|t| Arc::ptr_eq(t, &ty)) {
                    types.push(ty);
                }
            }
        }
        types
    }

    /// 名前空間を探す（完全修飾名）
    pub fn find_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.name_index()
            .namespaces(name)
            .iter()
            .find_map(|entry| self.resolve_namespace(*entry))
    }

    /// アドレスのソース行
    pub fn line_for_address(&self, address: u64) -> Option<LineInfo> {
        self.lines.as_ref()?.lookup(address)
    }

    /// アドレスに対応する関数・ブロック・行をまとめて取得する
    pub fn resolve_symbol_context(&self, address: u64) -> SymbolContext {
        let mut context = SymbolContext {
            address,
            line: self.line_for_address(address),
            ..Default::default()
        };

        let Some(found) = self.range_index().lookup(address).cloned() else {
            return context;
        };
        if found.kind != RangeKind::Function {
            return context;
        }
        if let Some(die) = self.die(found.entry) {
            context.unit = Some(die.unit().summary());
        }
        if let Some(function) = self.resolve_function(found.entry) {
            context.block = self
                .function_root_block(&function)
                .and_then(|root| root.innermost(address));
            context.function = Some(function);
        }
        context
    }

    /// キャッシュの件数
    pub fn cache_stats(&self) -> CacheStats {
        let guard = self.caches.lock();
        let caches = guard.borrow();
        CacheStats {
            types: caches.types.len(),
            unique_types: caches.unique.len(),
            variables: caches.variables.len(),
            functions: caches.functions.len(),
            blocks: caches.blocks.len(),
            namespaces: caches.namespaces.len(),
        }
    }
}
