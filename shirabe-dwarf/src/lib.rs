//! Shirabe DWARF デバッグ情報解決エンジン
//!
//! このクレートは、DWARFデバッグ情報を必要な分だけ遅延デコードし、型・変数・関数・
//! スコープとして解決する機能を提供します。解決結果は同一性を保ってキャッシュされ、
//! 複数のコンパイルユニットに現れる同じ型は1つにまとめられます。分割DWARF
//! （.dwo/.dwp）への委譲とアドレス範囲検索も扱います。

pub mod config;
pub mod die;
pub mod engine;
pub mod entity;
pub mod errors;
pub mod file;
pub mod lines;
pub mod loader;
pub mod location;
pub mod names;
pub mod ranges;
mod resolver;
pub mod section;
pub mod split;
pub mod uid;
pub mod unique;
pub mod unit;

pub use config::EngineConfig;
pub use die::{AttrValue, Die, DieData};
pub use engine::{CacheStats, DwarfEngine, SymbolContext};
pub use entity::{
    BaseClass, Block, Enumerator, Function, InlinedCall, Member, Namespace, ResolvedEntity, Type,
    TypeBody, TypeKind, TypeLink, Variable, VariableScope,
};
pub use errors::DwarfError;
pub use file::DwarfFile;
pub use lines::{LineInfo, LineInfoProvider};
pub use loader::DwarfLoader;
pub use location::{LocationListEntry, VariableLocation};
pub use ranges::{RangeEntry, RangeIndex, RangeKind};
pub use resolver::demangle_symbol;
pub use section::{MemorySource, ObjectFileSource, SectionCache, SectionNaming, SectionSource};
pub use split::{DebugFileLocator, DwarfPackage, FsLocator, MemoryLocator, NullLocator};
pub use uid::{EntryRef, FileTag, Uid};
pub use unit::{CompileUnit, UnitSummary};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
