//! DIE参照と数値識別子の相互変換
//!
//! 識別子のレイアウト:
//! - bit 0..40: `.debug_info` セクション内のオフセット
//! - bit 40..64: ファイルタグ（0 = メインファイル、`1..=0x7f_ffff` = 分割ユニット番号 + 1、
//!   `0x80_0000 | n` = n番目の補助オブジェクトファイル）
//!
//! 同じオフセットでもファイルが異なれば別の識別子になります。

use std::fmt;

/// オフセット部のビット数
pub const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const COMPANION_FLAG: u32 = 0x80_0000;
const TAG_MASK: u32 = 0xff_ffff;

/// 利用者に公開される不透明な識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// DIEが属するファイル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileTag {
    /// メインのオブジェクトファイル
    Primary,
    /// n番目に開いた分割ユニット（.dwo または .dwp 内のユニット）
    Split(u32),
    /// n番目の補助オブジェクトファイル
    Companion(u32),
}

impl FileTag {
    fn to_bits(self) -> u64 {
        match self {
            FileTag::Primary => 0,
            FileTag::Split(n) => u64::from(n) + 1,
            FileTag::Companion(n) => u64::from(COMPANION_FLAG | n),
        }
    }

    fn from_bits(bits: u32) -> Self {
        if bits == 0 {
            FileTag::Primary
        } else if bits & COMPANION_FLAG != 0 {
            FileTag::Companion(bits & !COMPANION_FLAG)
        } else {
            FileTag::Split(bits - 1)
        }
    }

    /// タグに収まる最大の番号
    pub fn max_index() -> u32 {
        COMPANION_FLAG - 2
    }

    /// n番目の補助ファイルのタグ（番号がタグに収まらなければ `None`）
    pub fn companion(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .filter(|&n| n < COMPANION_FLAG)
            .map(FileTag::Companion)
    }
}

impl fmt::Display for FileTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileTag::Primary => write!(f, "primary"),
            FileTag::Split(n) => write!(f, "split#{}", n),
            FileTag::Companion(n) => write!(f, "companion#{}", n),
        }
    }
}

/// DIEへの参照（ファイル + `.debug_info` 内オフセット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub file: FileTag,
    pub offset: usize,
}

impl EntryRef {
    /// 参照を作成する
    pub fn new(file: FileTag, offset: gimli::DebugInfoOffset<usize>) -> Self {
        Self {
            file,
            offset: offset.0,
        }
    }

    /// gimliのオフセット型に変換する
    pub fn debug_info_offset(&self) -> gimli::DebugInfoOffset<usize> {
        gimli::DebugInfoOffset(self.offset)
    }

    /// 識別子に変換する
    pub fn uid(&self) -> Uid {
        encode(*self)
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+0x{:x}", self.file, self.offset)
    }
}

/// 参照を識別子に変換する
pub fn encode(entry: EntryRef) -> Uid {
    // オフセットは40bitに収まる（セクションサイズはそれより小さい）
    Uid((entry.file.to_bits() << OFFSET_BITS) | (entry.offset as u64 & OFFSET_MASK))
}

/// 識別子を参照に戻す（構造上の変換のみ）
///
/// ファイルやユニットの存在確認は `DwarfEngine::decode` が行います。
pub fn decode_bits(uid: Uid) -> EntryRef {
    let tag = ((uid.0 >> OFFSET_BITS) as u32) & TAG_MASK;
    EntryRef {
        file: FileTag::from_bits(tag),
        offset: (uid.0 & OFFSET_MASK) as usize,
    }
}
