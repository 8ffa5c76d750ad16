//! 分割DWARF（.dwo / .dwp）への委譲
//!
//! スケルトンユニットが指す分割ユニットを、まず .dwp パッケージから、
//! 見つからなければ個別の .dwo ファイルから探します。見つからない場合は
//! スケルトンの情報だけで動作を続けます。

use crate::config::EngineConfig;
use crate::errors::DwarfError;
use crate::file::DwarfFile;
use crate::section::{DwarfReader, ObjectFileSource, SectionCache, SectionNaming, SectionSource};
use crate::uid::{EntryRef, FileTag};
use crate::unit::CompileUnit;
use crate::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 分割デバッグファイルを探すもの
pub trait DebugFileLocator: Send + Sync {
    /// .dwo ファイルを探す
    fn locate_dwo(&self, comp_dir: Option<&str>, dwo_name: &str) -> Option<Arc<dyn SectionSource>>;

    /// .dwp パッケージを探す
    fn locate_package(&self) -> Option<Arc<dyn SectionSource>>;
}

/// 何も見つけないロケータ
pub struct NullLocator;

impl DebugFileLocator for NullLocator {
    fn locate_dwo(&self, _comp_dir: Option<&str>, _dwo_name: &str) -> Option<Arc<dyn SectionSource>> {
        None
    }

    fn locate_package(&self) -> Option<Arc<dyn SectionSource>> {
        None
    }
}

/// ファイルシステムから探すロケータ
pub struct FsLocator {
    binary: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
    package_path: Option<PathBuf>,
}

impl FsLocator {
    /// バイナリのパスと設定から作成する
    pub fn new(binary: &Path, config: &EngineConfig) -> Self {
        Self {
            binary: Some(binary.to_path_buf()),
            search_paths: config.split_search_paths.clone(),
            package_path: config.package_path.clone(),
        }
    }

    /// 探索候補のパス（優先順）
    pub fn dwo_candidates(&self, comp_dir: Option<&str>, dwo_name: &str) -> Vec<PathBuf> {
        let name = Path::new(dwo_name);
        let mut candidates = Vec::new();

        if name.is_absolute() {
            candidates.push(name.to_path_buf());
        } else {
            if let Some(dir) = comp_dir {
                candidates.push(Path::new(dir).join(name));
            }
            if let Some(dir) = self.binary.as_deref().and_then(Path::parent) {
                candidates.push(dir.join(name));
            }
        }

        for dir in &self.search_paths {
            candidates.push(dir.join(name));
            if let Some(file_name) = name.file_name() {
                candidates.push(dir.join(file_name));
            }
        }

        candidates.dedup();
        candidates
    }

    /// パッケージのパス（指定がなければ `<binary>.dwp`）
    pub fn package_candidate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.package_path {
            return Some(path.clone());
        }
        let binary = self.binary.as_ref()?;
        let mut name = binary.file_name()?.to_os_string();
        name.push(".dwp");
        Some(binary.with_file_name(name))
    }
}

fn open_source(path: &Path) -> Option<Arc<dyn SectionSource>> {
    if !path.is_file() {
        return None;
    }
    match ObjectFileSource::open(path) {
        Ok(source) => Some(Arc::new(source)),
        Err(e) => {
            warn!("failed to open {}: {}", path.display(), e);
            None
        }
    }
}

impl DebugFileLocator for FsLocator {
    fn locate_dwo(&self, comp_dir: Option<&str>, dwo_name: &str) -> Option<Arc<dyn SectionSource>> {
        self.dwo_candidates(comp_dir, dwo_name)
            .iter()
            .find_map(|path| open_source(path))
    }

    fn locate_package(&self) -> Option<Arc<dyn SectionSource>> {
        open_source(&self.package_candidate()?)
    }
}

/// メモリ上の分割ファイルを返すロケータ
#[derive(Default)]
pub struct MemoryLocator {
    dwos: HashMap<String, Arc<dyn SectionSource>>,
    package: Option<Arc<dyn SectionSource>>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// .dwo を登録する（DW_AT_dwo_name と一致させる）
    pub fn with_dwo(mut self, dwo_name: impl Into<String>, source: Arc<dyn SectionSource>) -> Self {
        self.dwos.insert(dwo_name.into(), source);
        self
    }

    /// .dwp を登録する
    pub fn with_package(mut self, source: Arc<dyn SectionSource>) -> Self {
        self.package = Some(source);
        self
    }
}

impl DebugFileLocator for MemoryLocator {
    fn locate_dwo(&self, _comp_dir: Option<&str>, dwo_name: &str) -> Option<Arc<dyn SectionSource>> {
        self.dwos.get(dwo_name).cloned()
    }

    fn locate_package(&self) -> Option<Arc<dyn SectionSource>> {
        self.package.clone()
    }
}

/// 開いた .dwp パッケージ
pub struct DwarfPackage {
    name: String,
    endian: gimli::RunTimeEndian,
    package: gimli::DwarfPackage<DwarfReader>,
}

impl DwarfPackage {
    /// パッケージを開く
    pub fn open(source: Arc<dyn SectionSource>) -> Result<Self> {
        let sections = SectionCache::new(source, SectionNaming::Dwo);
        let package = sections.load_package()?;
        Ok(Self {
            name: sections.source_name(),
            endian: sections.endian(),
            package,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// DWO IDに対応するユニットを取り出す
    pub fn find_unit(
        &self,
        dwo_id: u64,
        parent: &gimli::Dwarf<DwarfReader>,
    ) -> Result<Option<gimli::Dwarf<DwarfReader>>> {
        Ok(self.package.find_cu(gimli::DwoId(dwo_id), parent)?)
    }
}

struct SplitState {
    /// スケルトンユニット -> 分割ファイル（見つからなかったことも記録）
    by_skeleton: HashMap<EntryRef, Option<Arc<DwarfFile>>>,
    /// `FileTag::Split(n)` の n 番目
    files: Vec<Arc<DwarfFile>>,
}

/// 分割ファイルの表
///
/// 表は専用のロックで守られ、その間に取るのは一度きり初期化のセルだけです。
pub struct SplitRegistry {
    locator: Arc<dyn DebugFileLocator>,
    enabled: bool,
    package: OnceCell<Option<Arc<DwarfPackage>>>,
    state: Mutex<SplitState>,
}

impl SplitRegistry {
    pub fn new(locator: Arc<dyn DebugFileLocator>, enabled: bool) -> Self {
        Self {
            locator,
            enabled,
            package: OnceCell::new(),
            state: Mutex::new(SplitState {
                by_skeleton: HashMap::new(),
                files: Vec::new(),
            }),
        }
    }

    /// .dwp パッケージ（最初の呼び出しで一度だけ開く）
    pub fn package(&self) -> Option<Arc<DwarfPackage>> {
        self.package
            .get_or_init(|| {
                if !self.enabled {
                    return None;
                }
                let source = self.locator.locate_package()?;
                match DwarfPackage::open(source) {
                    Ok(package) => {
                        info!("opened split DWARF package {}", package.name());
                        Some(Arc::new(package))
                    }
                    Err(e) => {
                        let err = DwarfError::ExternalFileUnavailable(format!("package: {}", e));
                        warn!("{}", err);
                        None
                    }
                }
            })
            .clone()
    }

    /// n番目の分割ファイル
    pub fn file(&self, index: u32) -> Option<Arc<DwarfFile>> {
        self.state.lock().files.get(index as usize).cloned()
    }

    /// 開いた分割ファイルの一覧
    pub fn files(&self) -> Vec<Arc<DwarfFile>> {
        self.state.lock().files.clone()
    }

    /// スケルトンユニットの分割ファイルを取得する
    pub fn dwo_for(&self, parent: &DwarfFile, unit: &Arc<CompileUnit>) -> Option<Arc<DwarfFile>> {
        if !self.enabled || !unit.is_skeleton() {
            return None;
        }
        let dwo_id = unit.dwo_id()?;
        let key = EntryRef::new(unit.file(), unit.offset());

        let mut state = self.state.lock();
        if let Some(cached) = state.by_skeleton.get(&key) {
            return cached.clone();
        }

        let index = state.files.len() as u32;
        let result = if index > FileTag::max_index() {
            warn!("too many split units; ignoring {}", key);
            None
        } else {
            match self.open_split(FileTag::Split(index), parent, unit, dwo_id) {
                Ok(file) => Some(Arc::new(file)),
                Err(e) => {
                    let err = DwarfError::ExternalFileUnavailable(format!(
                        "{} (dwo_id 0x{:016x}): {}",
                        unit.dwo_name().unwrap_or("<unnamed>"),
                        dwo_id,
                        e
                    ));
                    warn!("{}", err);
                    None
                }
            }
        };

        if let Some(file) = &result {
            debug!(skeleton = %key, file = %file.tag(), "attached split unit {}", file.name());
            state.files.push(file.clone());
        }
        state.by_skeleton.insert(key, result.clone());
        result
    }

    fn open_split(
        &self,
        tag: FileTag,
        parent: &DwarfFile,
        unit: &Arc<CompileUnit>,
        dwo_id: u64,
    ) -> Result<DwarfFile> {
        let parent_dwarf = parent
            .dwarf()
            .ok_or_else(|| DwarfError::MissingSection(".debug_info".to_string()))?;

        if let Some(package) = self.package() {
            if let Some(dwarf) = package.find_unit(dwo_id, parent_dwarf)? {
                return Ok(DwarfFile::split(
                    tag,
                    format!("{}[0x{:016x}]", package.name(), dwo_id),
                    package.endian,
                    None,
                    dwarf,
                    unit.clone(),
                ));
            }
        }

        let dwo_name = unit
            .dwo_name()
            .ok_or_else(|| anyhow::anyhow!("skeleton unit has no dwo name"))?;
        let source = self
            .locator
            .locate_dwo(unit.comp_dir(), dwo_name)
            .ok_or_else(|| anyhow::anyhow!("{} not found", dwo_name))?;

        let sections = SectionCache::new(source, SectionNaming::Dwo);
        let mut dwarf = sections.load_dwarf()?;
        dwarf.make_dwo(parent_dwarf);

        Ok(DwarfFile::split(
            tag,
            sections.source_name(),
            sections.endian(),
            Some(sections),
            dwarf,
            unit.clone(),
        ))
    }
}
