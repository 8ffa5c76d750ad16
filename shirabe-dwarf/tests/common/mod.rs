//! テスト用のDWARF 4アセンブラ
//!
//! DIEの木を組み立てて `.debug_info` / `.debug_abbrev` のバイト列を生成します。
//! DIEごとに専用の略語コードを割り当て、ユニットごとに略語表を1つ作ります。
//! `Value::Ref` はラベルで指定し、2パスでオフセットを解決します。

#![allow(dead_code)]

use gimli::{DwAt, DwTag};
use shirabe_dwarf::{EntryRef, FileTag, MemorySource};
use std::collections::HashMap;

const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_DATA2: u64 = 0x05;
const DW_FORM_DATA4: u64 = 0x06;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_DATA1: u64 = 0x0b;
const DW_FORM_SDATA: u64 = 0x0d;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_REF4: u64 = 0x13;
const DW_FORM_SEC_OFFSET: u64 = 0x17;
const DW_FORM_EXPRLOC: u64 = 0x18;
const DW_FORM_FLAG_PRESENT: u64 = 0x19;

/// 属性値
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Data1(u8),
    Data2(u16),
    Data4(u32),
    Data8(u64),
    Sdata(i64),
    Udata(u64),
    Addr(u64),
    Flag,
    /// 同じユニット内のラベルへの参照
    Ref(String),
    Expr(Vec<u8>),
    SecOffset(u32),
}

impl Value {
    fn form(&self) -> u64 {
        match self {
            Value::Str(_) => DW_FORM_STRING,
            Value::Data1(_) => DW_FORM_DATA1,
            Value::Data2(_) => DW_FORM_DATA2,
            Value::Data4(_) => DW_FORM_DATA4,
            Value::Data8(_) => DW_FORM_DATA8,
            Value::Sdata(_) => DW_FORM_SDATA,
            Value::Udata(_) => DW_FORM_UDATA,
            Value::Addr(_) => DW_FORM_ADDR,
            Value::Flag => DW_FORM_FLAG_PRESENT,
            Value::Ref(_) => DW_FORM_REF4,
            Value::Expr(_) => DW_FORM_EXPRLOC,
            Value::SecOffset(_) => DW_FORM_SEC_OFFSET,
        }
    }

    fn encode(&self, labels: &HashMap<String, usize>, out: &mut Vec<u8>) {
        match self {
            Value::Str(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Value::Data1(v) => out.push(*v),
            Value::Data2(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Data4(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Data8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Sdata(v) => sleb(*v, out),
            Value::Udata(v) => uleb(*v, out),
            Value::Addr(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Flag => {}
            Value::Ref(label) => {
                let offset = *labels
                    .get(label)
                    .unwrap_or_else(|| panic!("unknown label {}", label));
                out.extend_from_slice(&(offset as u32).to_le_bytes());
            }
            Value::Expr(bytes) => {
                uleb(bytes.len() as u64, out);
                out.extend_from_slice(bytes);
            }
            Value::SecOffset(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn size(&self) -> usize {
        if let Value::Ref(_) = self {
            return 4;
        }
        let mut buf = Vec::new();
        self.encode(&HashMap::new(), &mut buf);
        buf.len()
    }
}

pub fn uleb(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// DIEの定義
#[derive(Debug, Clone)]
pub struct DieDef {
    tag: DwTag,
    label: Option<String>,
    attrs: Vec<(DwAt, Value)>,
    children: Vec<DieDef>,
    /// 略語を使わずにそのまま出力するバイト列（壊れたDIEの再現用）
    raw: Option<Vec<u8>>,
}

pub fn die(tag: DwTag) -> DieDef {
    DieDef {
        tag,
        label: None,
        attrs: Vec::new(),
        children: Vec::new(),
        raw: None,
    }
}

/// 生のバイト列
pub fn raw(bytes: Vec<u8>) -> DieDef {
    DieDef {
        raw: Some(bytes),
        ..die(gimli::DW_TAG_null)
    }
}

impl DieDef {
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn attr(mut self, at: DwAt, value: Value) -> Self {
        self.attrs.push((at, value));
        self
    }

    pub fn name(self, name: &str) -> Self {
        self.attr(gimli::DW_AT_name, Value::Str(name.to_string()))
    }

    pub fn type_ref(self, label: &str) -> Self {
        self.attr(gimli::DW_AT_type, Value::Ref(label.to_string()))
    }

    pub fn byte_size(self, size: u8) -> Self {
        self.attr(gimli::DW_AT_byte_size, Value::Data1(size))
    }

    pub fn declaration(self) -> Self {
        self.attr(gimli::DW_AT_declaration, Value::Flag)
    }

    /// low_pc / high_pc（長さ形式）
    pub fn pc_range(self, low: u64, high: u64) -> Self {
        self.attr(gimli::DW_AT_low_pc, Value::Addr(low))
            .attr(gimli::DW_AT_high_pc, Value::Data4((high - low) as u32))
    }

    pub fn child(mut self, child: DieDef) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = DieDef>) -> Self {
        self.children.extend(children);
        self
    }
}

/// DW_OP_fbreg offset
pub fn fbreg(offset: i64) -> Vec<u8> {
    let mut out = vec![0x91];
    sleb(offset, &mut out);
    out
}

/// DW_OP_addr address
pub fn op_addr(address: u64) -> Vec<u8> {
    let mut out = vec![0x03];
    out.extend_from_slice(&address.to_le_bytes());
    out
}

/// DW_OP_plus_uconst offset
pub fn plus_uconst(offset: u64) -> Vec<u8> {
    let mut out = vec![0x23];
    uleb(offset, &mut out);
    out
}

const HEADER_SIZE: usize = 11;

/// 組み立て済みのユニット
pub struct UnitBytes {
    pub info: Vec<u8>,
    pub abbrev: Vec<u8>,
    /// ラベル -> ユニット先頭からのオフセット
    pub labels: HashMap<String, usize>,
}

struct Layout {
    next_code: u64,
    offset: usize,
    labels: HashMap<String, usize>,
}

fn layout(def: &DieDef, state: &mut Layout) {
    if let Some(label) = &def.label {
        state.labels.insert(label.clone(), state.offset);
    }
    if let Some(raw) = &def.raw {
        state.offset += raw.len();
        return;
    }
    let code = state.next_code;
    state.next_code += 1;
    let mut buf = Vec::new();
    uleb(code, &mut buf);
    state.offset += buf.len();
    state.offset += def.attrs.iter().map(|(_, v)| v.size()).sum::<usize>();
    if !def.children.is_empty() {
        for child in &def.children {
            layout(child, state);
        }
        state.offset += 1;
    }
}

fn emit(
    def: &DieDef,
    next_code: &mut u64,
    labels: &HashMap<String, usize>,
    info: &mut Vec<u8>,
    abbrev: &mut Vec<u8>,
) {
    if let Some(raw) = &def.raw {
        info.extend_from_slice(raw);
        return;
    }
    let code = *next_code;
    *next_code += 1;

    uleb(code, abbrev);
    uleb(u64::from(def.tag.0), abbrev);
    abbrev.push(u8::from(!def.children.is_empty()));
    for (at, value) in &def.attrs {
        uleb(u64::from(at.0), abbrev);
        uleb(value.form(), abbrev);
    }
    abbrev.extend_from_slice(&[0, 0]);

    uleb(code, info);
    for (_, value) in &def.attrs {
        value.encode(labels, info);
    }
    if !def.children.is_empty() {
        for child in &def.children {
            emit(child, next_code, labels, info, abbrev);
        }
        info.push(0);
    }
}

/// 1つのユニットを組み立てる（略語表のオフセットを指定）
pub fn assemble_unit(root: &DieDef, abbrev_offset: u32) -> UnitBytes {
    let mut state = Layout {
        next_code: 1,
        offset: HEADER_SIZE,
        labels: HashMap::new(),
    };
    layout(root, &mut state);

    let mut body = Vec::new();
    let mut abbrev = Vec::new();
    let mut next_code = 1;
    emit(root, &mut next_code, &state.labels, &mut body, &mut abbrev);
    abbrev.push(0);
    assert_eq!(HEADER_SIZE + body.len(), state.offset, "layout mismatch");

    let mut info = Vec::new();
    let unit_length = (body.len() + 7) as u32;
    info.extend_from_slice(&unit_length.to_le_bytes());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&abbrev_offset.to_le_bytes());
    info.push(8);
    info.extend_from_slice(&body);

    UnitBytes {
        info,
        abbrev,
        labels: state.labels,
    }
}

/// 複数ユニットを連結した結果
pub struct Assembled {
    pub info: Vec<u8>,
    pub abbrev: Vec<u8>,
    /// ラベル -> `.debug_info` 内のオフセット
    pub labels: HashMap<String, usize>,
    /// 各ユニットの開始オフセット
    pub unit_offsets: Vec<usize>,
}

impl Assembled {
    /// ラベルの付いたDIEへの参照
    pub fn entry(&self, label: &str) -> EntryRef {
        self.entry_in(FileTag::Primary, label)
    }

    pub fn entry_in(&self, file: FileTag, label: &str) -> EntryRef {
        let offset = *self
            .labels
            .get(label)
            .unwrap_or_else(|| panic!("unknown label {}", label));
        EntryRef { file, offset }
    }

    /// メインファイル用のセクション集合
    pub fn source(&self, name: &str) -> MemorySource {
        MemorySource::new(name)
            .with_section(".debug_info", self.info.clone())
            .with_section(".debug_abbrev", self.abbrev.clone())
    }

    /// .dwo 用のセクション集合
    pub fn dwo_source(&self, name: &str) -> MemorySource {
        MemorySource::new(name)
            .with_section(".debug_info.dwo", self.info.clone())
            .with_section(".debug_abbrev.dwo", self.abbrev.clone())
    }
}

/// ユニットを順に連結する（ラベルはファイル全体で一意にすること）
pub fn assemble(roots: &[DieDef]) -> Assembled {
    let mut info = Vec::new();
    let mut abbrev = Vec::new();
    let mut labels = HashMap::new();
    let mut unit_offsets = Vec::new();

    for root in roots {
        let unit = assemble_unit(root, abbrev.len() as u32);
        let base = info.len();
        unit_offsets.push(base);
        for (label, offset) in unit.labels {
            labels.insert(label, base + offset);
        }
        info.extend_from_slice(&unit.info);
        abbrev.extend_from_slice(&unit.abbrev);
    }

    Assembled {
        info,
        abbrev,
        labels,
        unit_offsets,
    }
}

/// C++ のコンパイルユニット
pub fn cpp_unit(name: &str) -> DieDef {
    die(gimli::DW_TAG_compile_unit)
        .name(name)
        .attr(gimli::DW_AT_language, Value::Data2(gimli::DW_LANG_C_plus_plus.0))
        .attr(gimli::DW_AT_comp_dir, Value::Str("/src".to_string()))
}

/// スケルトンユニット（GNU拡張形式）
pub fn skeleton_unit(name: &str, dwo_name: &str, dwo_id: u64) -> DieDef {
    die(gimli::DW_TAG_compile_unit)
        .name(name)
        .attr(gimli::DW_AT_comp_dir, Value::Str("/src".to_string()))
        .attr(gimli::DW_AT_GNU_dwo_name, Value::Str(dwo_name.to_string()))
        .attr(gimli::DW_AT_GNU_dwo_id, Value::Data8(dwo_id))
}

/// 分割ユニット側のコンパイルユニット
pub fn split_unit(name: &str, dwo_id: u64) -> DieDef {
    cpp_unit(name).attr(gimli::DW_AT_GNU_dwo_id, Value::Data8(dwo_id))
}

/// .dwp パッケージ（`.debug_cu_index` バージョン2）を作る
pub fn package(units: &[(u64, DieDef)]) -> (MemorySource, Vec<HashMap<String, usize>>) {
    let mut info = Vec::new();
    let mut abbrev = Vec::new();
    let mut rows = Vec::new();
    let mut labels = Vec::new();

    for (dwo_id, root) in units {
        let unit = assemble_unit(root, 0);
        rows.push((
            *dwo_id,
            info.len() as u32,
            unit.info.len() as u32,
            abbrev.len() as u32,
            unit.abbrev.len() as u32,
        ));
        info.extend_from_slice(&unit.info);
        abbrev.extend_from_slice(&unit.abbrev);
        labels.push(unit.labels);
    }

    let mut slot_count = 2u32;
    while slot_count <= rows.len() as u32 {
        slot_count *= 2;
    }
    let mask = u64::from(slot_count - 1);
    let mut hash_ids = vec![0u64; slot_count as usize];
    let mut hash_rows = vec![0u32; slot_count as usize];
    for (row, (dwo_id, ..)) in rows.iter().enumerate() {
        let mut slot = dwo_id & mask;
        let step = ((dwo_id >> 32) & mask) | 1;
        while hash_rows[slot as usize] != 0 {
            slot = (slot + step) & mask;
        }
        hash_ids[slot as usize] = *dwo_id;
        hash_rows[slot as usize] = row as u32 + 1;
    }

    let mut index = Vec::new();
    index.extend_from_slice(&2u32.to_le_bytes());
    index.extend_from_slice(&2u32.to_le_bytes());
    index.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    index.extend_from_slice(&slot_count.to_le_bytes());
    for id in &hash_ids {
        index.extend_from_slice(&id.to_le_bytes());
    }
    for row in &hash_rows {
        index.extend_from_slice(&row.to_le_bytes());
    }
    // DW_SECT_INFO = 1, DW_SECT_ABBREV = 3
    index.extend_from_slice(&1u32.to_le_bytes());
    index.extend_from_slice(&3u32.to_le_bytes());
    for (_, info_off, _, abbrev_off, _) in &rows {
        index.extend_from_slice(&info_off.to_le_bytes());
        index.extend_from_slice(&abbrev_off.to_le_bytes());
    }
    for (_, _, info_size, _, abbrev_size) in &rows {
        index.extend_from_slice(&info_size.to_le_bytes());
        index.extend_from_slice(&abbrev_size.to_le_bytes());
    }

    let source = MemorySource::new("app.dwp")
        .with_section(".debug_info.dwo", info)
        .with_section(".debug_abbrev.dwo", abbrev)
        .with_section(".debug_cu_index", index);
    (source, labels)
}

/// レコードのメンバ
pub fn member(name: &str, ty: &str, offset: u8) -> DieDef {
    die(gimli::DW_TAG_member)
        .name(name)
        .type_ref(ty)
        .attr(gimli::DW_AT_data_member_location, Value::Data1(offset))
}

/// 符号付き整数の基本型
pub fn int_type(label: &str) -> DieDef {
    die(gimli::DW_TAG_base_type)
        .label(label)
        .name("int")
        .byte_size(4)
        .attr(gimli::DW_AT_encoding, Value::Data1(gimli::DW_ATE_signed.0))
}

/// 自己参照する `struct Node { int value; Node *next; }`
pub fn node_types(suffix: &str) -> Vec<DieDef> {
    let int = format!("int_{}", suffix);
    let node = format!("node_{}", suffix);
    let ptr = format!("node_ptr_{}", suffix);
    vec![
        int_type(&int),
        die(gimli::DW_TAG_structure_type)
            .label(&node)
            .name("Node")
            .byte_size(16)
            .children([member("value", &int, 0), member("next", &ptr, 8)]),
        die(gimli::DW_TAG_pointer_type)
            .label(&ptr)
            .byte_size(8)
            .type_ref(&node),
    ]
}

/// 2つのC++ユニットからなるプログラム
///
/// a.cpp:
/// - `Node`（自己参照）、`Fwd` の前方宣言とそのポインタ、4バイトの `Mismatch`
/// - `ns::Inner`、壊れたDIEを参照するメンバを持つ `Bad`
/// - `main` [0x1000, 0x1100)（引数 `argc` とブロック [0x1040, 0x1080) 内の `tmp`）
/// - グローバル変数 `counter` @ 0x4000
/// - 末尾に未定義の略語コードを持つ壊れたDIE
///
/// b.cpp:
/// - `Node`、`Fwd` の定義、8バイトの `Mismatch`、`ns::Inner`
/// - `helper` [0x2000, 0x2100)（Rustのリンケージ名付き、定数変数 `answer`）
pub fn sample_program() -> Assembled {
    let a = cpp_unit("a.cpp")
        .children(node_types("a"))
        .children([
            die(gimli::DW_TAG_structure_type)
                .label("fwd_decl")
                .name("Fwd")
                .declaration(),
            die(gimli::DW_TAG_pointer_type)
                .label("fwd_ptr")
                .byte_size(8)
                .type_ref("fwd_decl"),
            die(gimli::DW_TAG_structure_type)
                .label("mismatch_a")
                .name("Mismatch")
                .byte_size(4),
            die(gimli::DW_TAG_namespace).label("ns_a").name("ns").child(
                die(gimli::DW_TAG_structure_type)
                    .label("inner_a")
                    .name("Inner")
                    .byte_size(4)
                    .child(member("x", "int_a", 0)),
            ),
            die(gimli::DW_TAG_structure_type)
                .label("bad_struct")
                .name("Bad")
                .byte_size(4)
                .child(member("broken", "bogus", 0)),
            die(gimli::DW_TAG_subprogram)
                .label("main")
                .name("main")
                .attr(gimli::DW_AT_external, Value::Flag)
                .type_ref("int_a")
                .pc_range(0x1000, 0x1100)
                .children([
                    die(gimli::DW_TAG_formal_parameter)
                        .label("argc")
                        .name("argc")
                        .type_ref("int_a")
                        .attr(gimli::DW_AT_location, Value::Expr(fbreg(-20))),
                    die(gimli::DW_TAG_lexical_block)
                        .label("block")
                        .pc_range(0x1040, 0x1080)
                        .child(
                            die(gimli::DW_TAG_variable)
                                .label("tmp")
                                .name("tmp")
                                .type_ref("int_a")
                                .attr(gimli::DW_AT_location, Value::Expr(fbreg(-24))),
                        ),
                ]),
            die(gimli::DW_TAG_variable)
                .label("counter")
                .name("counter")
                .type_ref("int_a")
                .attr(gimli::DW_AT_external, Value::Flag)
                .attr(gimli::DW_AT_location, Value::Expr(op_addr(0x4000))),
            raw(vec![0x63]).label("bogus"),
        ]);

    let b = cpp_unit("b.cpp")
        .children(node_types("b"))
        .children([
            die(gimli::DW_TAG_structure_type)
                .label("fwd_def")
                .name("Fwd")
                .byte_size(8)
                .child(member("a", "int_b", 0)),
            die(gimli::DW_TAG_structure_type)
                .label("mismatch_b")
                .name("Mismatch")
                .byte_size(8),
            die(gimli::DW_TAG_namespace).label("ns_b").name("ns").child(
                die(gimli::DW_TAG_structure_type)
                    .label("inner_b")
                    .name("Inner")
                    .byte_size(4)
                    .child(member("x", "int_b", 0)),
            ),
            die(gimli::DW_TAG_subprogram)
                .label("helper")
                .name("helper")
                .attr(
                    gimli::DW_AT_linkage_name,
                    Value::Str("_ZN4core3fmt5write17h0123456789abcdefE".to_string()),
                )
                .pc_range(0x2000, 0x2100)
                .child(
                    die(gimli::DW_TAG_variable)
                        .label("answer")
                        .name("answer")
                        .type_ref("int_b")
                        .attr(gimli::DW_AT_const_value, Value::Sdata(42)),
                ),
        ]);

    assemble(&[a, b])
}
