//! アドレス範囲 -> エンティティの索引

use crate::uid::EntryRef;
use std::ops::Range;

/// 範囲が指すエンティティの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Function,
    Variable,
}

/// 索引の1項目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub range: Range<u64>,
    pub entry: EntryRef,
    pub kind: RangeKind,
}

/// 開始アドレス順に並んだ、重なりのない範囲の列
#[derive(Debug, Default)]
pub struct RangeIndex {
    entries: Vec<RangeEntry>,
}

impl RangeIndex {
    /// 範囲の集合から索引を作る
    ///
    /// 重なった部分は開始アドレスが小さい方が優先され、後ろの範囲は削られます。
    pub fn from_entries(mut entries: Vec<RangeEntry>) -> Self {
        entries.retain(|e| e.range.start < e.range.end);
        entries.sort_by_key(|e| e.range.start);

        let mut trimmed: Vec<RangeEntry> = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if let Some(prev) = trimmed.last() {
                if entry.range.start < prev.range.end {
                    entry.range.start = prev.range.end;
                }
            }
            if entry.range.start < entry.range.end {
                trimmed.push(entry);
            }
        }

        Self { entries: trimmed }
    }

    /// アドレスを含む項目を二分探索で探す
    pub fn lookup(&self, address: u64) -> Option<&RangeEntry> {
        let idx = self.entries.partition_point(|e| e.range.start <= address);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        entry.range.contains(&address).then_some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangeEntry> {
        self.entries.iter()
    }
}
