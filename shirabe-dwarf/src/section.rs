//! デバッグセクションの遅延読み込み
//!
//! セクションは最初に要求されたときに一度だけ読み込まれ、以降はキャッシュされた
//! バイト列を返します。同時に初回要求が来た場合は、一方が読み込みを行い、
//! 他方はその完了を待ちます。

use crate::errors::DwarfError;
use crate::Result;
use gimli::{EndianArcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// エンジン全体で使うgimliリーダー
pub type DwarfReader = EndianArcSlice<RunTimeEndian>;

/// 生のセクションバイト列を供給するもの
pub trait SectionSource: Send + Sync {
    /// 名前でセクションを取得する（存在しなければNone）
    fn raw_section(&self, name: &str) -> Option<Vec<u8>>;

    /// バイトオーダー
    fn endian(&self) -> RunTimeEndian {
        RunTimeEndian::Little
    }

    /// ログ用の表示名
    fn display_name(&self) -> String {
        "<memory>".to_string()
    }
}

/// メモリ上のセクション集合
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    name: String,
    sections: HashMap<String, Vec<u8>>,
    big_endian: bool,
}

impl MemorySource {
    /// 空のソースを作成する
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: HashMap::new(),
            big_endian: false,
        }
    }

    /// セクションを追加する
    pub fn with_section(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.sections.insert(name.into(), data);
        self
    }

    /// ビッグエンディアンとして扱う
    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// セクションを追加する（可変参照版）
    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.sections.insert(name.into(), data);
    }
}

impl SectionSource for MemorySource {
    fn raw_section(&self, name: &str) -> Option<Vec<u8>> {
        self.sections.get(name).cloned()
    }

    fn endian(&self) -> RunTimeEndian {
        if self.big_endian {
            RunTimeEndian::Big
        } else {
            RunTimeEndian::Little
        }
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }
}

/// ELF/Mach-O/PEファイルからセクションを読むソース
///
/// ファイル全体を `Arc<[u8]>` として保持し、要求のたびにヘッダを解析して
/// 目的のセクションだけを取り出します（圧縮セクションは展開されます）。
pub struct ObjectFileSource {
    path: PathBuf,
    data: Arc<[u8]>,
    endian: RunTimeEndian,
}

impl ObjectFileSource {
    /// ファイルを読み込む
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| DwarfError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(path, Arc::from(bytes))
    }

    /// メモリ上のファイルイメージから作成する
    pub fn from_bytes<P: AsRef<Path>>(path: P, data: Arc<[u8]>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // objectクレートでヘッダだけ検証し、エンディアンを取得
        let file = object::File::parse(&*data).map_err(|e| DwarfError::Object {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        Ok(Self { path, data, endian })
    }

    /// ファイルパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_section(&self, name: &str) -> Option<Vec<u8>> {
        let file = object::File::parse(&*self.data).ok()?;

        // Mach-Oでは ".debug_info" が "__debug_info" になる
        let macho_name = name.strip_prefix('.').map(|rest| format!("__{}", rest));
        let section = file
            .section_by_name(name)
            .or_else(|| macho_name.as_deref().and_then(|n| file.section_by_name(n)))?;

        match section.uncompressed_data() {
            Ok(Cow::Borrowed(bytes)) => Some(bytes.to_vec()),
            Ok(Cow::Owned(bytes)) => Some(bytes),
            Err(e) => {
                debug!(path = %self.path.display(), section = name, "failed to read section: {}", e);
                None
            }
        }
    }
}

impl SectionSource for ObjectFileSource {
    fn raw_section(&self, name: &str) -> Option<Vec<u8>> {
        self.read_section(name)
    }

    fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

/// セクション名の付け方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionNaming {
    /// 通常のファイル（".debug_info"）
    Main,
    /// 分割ファイル（".debug_info.dwo"）
    Dwo,
}

impl SectionNaming {
    /// gimliのセクションIDからセクション名を得る
    pub fn name(self, id: SectionId) -> &'static str {
        match self {
            SectionNaming::Main => id.name(),
            SectionNaming::Dwo => id.dwo_name().unwrap_or_else(|| id.name()),
        }
    }
}

type SectionSlot = Arc<OnceCell<Arc<[u8]>>>;

/// 遅延セクションキャッシュ
pub struct SectionCache {
    source: Arc<dyn SectionSource>,
    naming: SectionNaming,
    /// セクション名 -> 読み込み済みバイト列
    slots: Mutex<HashMap<String, SectionSlot>>,
    /// 実際にソースから読み込んだ回数
    loads: AtomicUsize,
}

impl SectionCache {
    /// 新しいキャッシュを作成する
    pub fn new(source: Arc<dyn SectionSource>, naming: SectionNaming) -> Self {
        Self {
            source,
            naming,
            slots: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// gimliのセクションIDでセクションを取得する
    pub fn section(&self, id: SectionId) -> Arc<[u8]> {
        self.section_by_name(self.naming.name(id))
    }

    /// 名前でセクションを取得する
    ///
    /// 存在しないセクションは空のバイト列になります。
    pub fn section_by_name(&self, name: &str) -> Arc<[u8]> {
        // マップのロックはスロットの取得だけに使い、読み込み中は保持しない
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(name.to_string()).or_default().clone()
        };

        slot.get_or_init(|| {
            self.loads.fetch_add(1, Ordering::SeqCst);
            match self.source.raw_section(name) {
                Some(bytes) => {
                    trace!(source = %self.source.display_name(), section = name, len = bytes.len(), "loaded section");
                    Arc::from(bytes)
                }
                None => {
                    trace!(source = %self.source.display_name(), section = name, "section not present");
                    Arc::from(Vec::new())
                }
            }
        })
        .clone()
    }

    /// gimli用のリーダーを作成する
    pub fn reader(&self, id: SectionId) -> DwarfReader {
        EndianArcSlice::new(self.section(id), self.source.endian())
    }

    /// 空のリーダーを作成する
    pub fn empty_reader(&self) -> DwarfReader {
        EndianArcSlice::new(Arc::from(Vec::new()), self.source.endian())
    }

    /// バイトオーダー
    pub fn endian(&self) -> RunTimeEndian {
        self.source.endian()
    }

    /// ソースからの読み込み回数
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// ソースの表示名
    pub fn source_name(&self) -> String {
        self.source.display_name()
    }

    /// gimliの `Dwarf` を構築する
    pub fn load_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        let dwarf = gimli::Dwarf::load(|id| Ok::<_, gimli::Error>(self.reader(id)))?;
        Ok(dwarf)
    }

    /// .dwpパッケージとして読み込む
    pub fn load_package(&self) -> Result<gimli::DwarfPackage<DwarfReader>> {
        let package = gimli::DwarfPackage::load(
            |id| Ok::<_, gimli::Error>(self.reader(id)),
            self.empty_reader(),
        )?;
        Ok(package)
    }
}
