//! 変数のロケーション分類
//!
//! DW_AT_location の式やロケーションリストを、デバッガが扱いやすい形に
//! 分類します。式の評価そのものは行いません。

use crate::section::DwarfReader;
use crate::Result;
use gimli::{Operation, RawLocListEntry, Reader};
use std::ops::Range;

/// 変数のロケーション
#[derive(Debug, Clone, PartialEq)]
pub enum VariableLocation {
    /// フレームベースからのオフセット（DW_OP_fbreg）
    FrameOffset(i64),
    /// レジスタに格納（DW_OP_regN）
    Register(u16),
    /// レジスタ + オフセット（DW_OP_bregN）
    RegisterOffset { register: u16, offset: i64 },
    /// 静的アドレス（DW_OP_addr）
    Address(u64),
    /// 値そのもの（DW_AT_const_value または DW_OP_constu + DW_OP_stack_value）
    Constant(i64),
    /// 単純な形に分類できない式
    Expression(Vec<u8>),
    /// PC範囲ごとのロケーション
    List(Vec<LocationListEntry>),
    /// 最適化で消えた
    OptimizedOut,
}

/// ロケーションリストの1項目
#[derive(Debug, Clone, PartialEq)]
pub struct LocationListEntry {
    pub range: Range<u64>,
    pub location: VariableLocation,
}

/// DWARF式を分類する
pub fn classify_expression(
    bytes: &[u8],
    encoding: gimli::Encoding,
    endian: gimli::RunTimeEndian,
) -> VariableLocation {
    if bytes.is_empty() {
        return VariableLocation::OptimizedOut;
    }

    let expr = gimli::Expression(gimli::EndianSlice::new(bytes, endian));
    let mut ops = Vec::new();
    let mut iter = expr.operations(encoding);
    loop {
        match iter.next() {
            Ok(Some(op)) => ops.push(op),
            Ok(None) => break,
            Err(_) => return VariableLocation::Expression(bytes.to_vec()),
        }
    }

    match ops.as_slice() {
        [Operation::FrameOffset { offset }] => VariableLocation::FrameOffset(*offset),
        [Operation::Register { register }] => VariableLocation::Register(register.0),
        [Operation::RegisterOffset {
            register, offset, ..
        }] => VariableLocation::RegisterOffset {
            register: register.0,
            offset: *offset,
        },
        [Operation::Address { address }] => VariableLocation::Address(*address),
        [Operation::UnsignedConstant { value }, Operation::StackValue] => {
            VariableLocation::Constant(*value as i64)
        }
        [Operation::SignedConstant { value }, Operation::StackValue] => {
            VariableLocation::Constant(*value)
        }
        _ => VariableLocation::Expression(bytes.to_vec()),
    }
}

/// ロケーションリストを読む
///
/// `base_address` はユニットの `DW_AT_low_pc`（値が0でも属性があれば `Some`）。
/// ユニットが基底アドレスを持たない場合だけ、関数の入口アドレスを基底として
/// オフセット形式の範囲を解決します。
pub fn read_location_list(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    base_address: Option<u64>,
    offset: usize,
    function_entry: Option<u64>,
) -> Result<Vec<LocationListEntry>> {
    let encoding = unit.encoding();
    let mut base = base_address.or(function_entry).unwrap_or(0);

    let mut entries = Vec::new();
    let mut iter = dwarf.raw_locations(unit, gimli::LocationListsOffset(offset))?;
    while let Some(raw) = iter.next()? {
        let (range, data) = match raw {
            RawLocListEntry::BaseAddress { addr } => {
                base = addr;
                continue;
            }
            RawLocListEntry::BaseAddressx { addr } => {
                base = dwarf.address(unit, addr)?;
                continue;
            }
            RawLocListEntry::AddressOrOffsetPair { begin, end, data }
            | RawLocListEntry::OffsetPair { begin, end, data } => {
                (base.wrapping_add(begin)..base.wrapping_add(end), data)
            }
            RawLocListEntry::StartEnd { begin, end, data } => (begin..end, data),
            RawLocListEntry::StartLength { begin, length, data } => {
                (begin..begin.wrapping_add(length), data)
            }
            RawLocListEntry::StartxEndx { begin, end, data } => {
                (dwarf.address(unit, begin)?..dwarf.address(unit, end)?, data)
            }
            RawLocListEntry::StartxLength {
                begin,
                length,
                data,
            } => {
                let begin = dwarf.address(unit, begin)?;
                (begin..begin.wrapping_add(length), data)
            }
            // 範囲を持たない既定ロケーションは扱わない
            RawLocListEntry::DefaultLocation { .. } => continue,
        };

        if range.start >= range.end {
            continue;
        }
        let bytes = data.0.to_slice()?;
        entries.push(LocationListEntry {
            range,
            location: classify_expression(&bytes, encoding, data.0.endian()),
        });
    }
    Ok(entries)
}
