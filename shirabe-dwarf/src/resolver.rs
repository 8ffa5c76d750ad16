//! DIEからエンティティへの解決とキャッシュ
//!
//! 解決は次の順で行います。
//! 1. キャッシュを確認する
//! 2. DIE自身の属性を読み、名前付きレコード・列挙型なら正規型を確認する
//! 3. プレースホルダをキャッシュに入れてから、参照先やメンバを再帰的に解決する
//! 4. プレースホルダの中身を埋める
//!
//! 自己参照する型は3の時点でキャッシュから自分自身を得るため、再帰は停止します。

use crate::die::{AttrValue, Die, DieData};
use crate::engine::DwarfEngine;
use crate::entity::{
    BaseClass, Block, Enumerator, Function, InlinedCall, Member, Namespace, Type, TypeBody,
    TypeKind, TypeLink, Variable, VariableScope,
};
use crate::errors::DwarfError;
use crate::location::{classify_expression, read_location_list, VariableLocation};
use crate::uid::EntryRef;
use crate::unique::{Canonical, UniqueTypeKey};
use gimli::Reader;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// シンボル名をデマングルする（Rustのシンボルのみ）
pub fn demangle_symbol(name: &str) -> Option<String> {
    rustc_demangle::try_demangle(name)
        .ok()
        .map(|demangled| format!("{:#}", demangled))
}

/// DW_OP_plus_uconst 形式のメンバオフセットを読む
fn member_offset(value: &AttrValue) -> Option<u64> {
    match value {
        AttrValue::Expression(bytes) | AttrValue::Block(bytes) => {
            let (&op, rest) = bytes.split_first()?;
            if op != gimli::DW_OP_plus_uconst.0 {
                return None;
            }
            let mut reader = gimli::EndianSlice::new(rest, gimli::LittleEndian);
            reader.read_uleb128().ok()
        }
        other => other.as_unsigned(),
    }
}

/// DWARF 2/3 の DW_AT_bit_offset（格納単位の最上位ビットから数える）を
/// 構造体先頭からのビット位置に直す
fn legacy_bit_offset(
    data: &DieData,
    byte_offset: Option<u64>,
    storage_size: Option<u64>,
    big_endian: bool,
) -> Option<u64> {
    let bit_offset = data.unsigned(gimli::DW_AT_bit_offset)?;
    let base = byte_offset.unwrap_or(0).checked_mul(8)?;
    if big_endian {
        return base.checked_add(bit_offset);
    }
    let bit_size = data.unsigned(gimli::DW_AT_bit_size)?;
    let storage_bits = storage_size?.checked_mul(8)?;
    base.checked_add(storage_bits)?
        .checked_sub(bit_offset)?
        .checked_sub(bit_size)
}

/// 列挙型の基底型が符号付き整数か（typedefや修飾子は辿る）
fn has_signed_encoding(mut ty: Option<Arc<Type>>) -> bool {
    for _ in 0..16 {
        let Some(current) = ty else {
            return false;
        };
        if current.kind() == TypeKind::Base {
            return matches!(
                current.body().encoding,
                Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char)
            );
        }
        ty = current.target();
    }
    false
}

fn enumerator_value(data: &DieData, signed: bool) -> i64 {
    let value = data.attr(gimli::DW_AT_const_value);
    let value = if signed {
        value.and_then(AttrValue::sign_extended)
    } else {
        value.and_then(AttrValue::as_signed)
    };
    value.unwrap_or(0)
}

fn is_scope_tag(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_compile_unit
            | gimli::DW_TAG_partial_unit
            | gimli::DW_TAG_skeleton_unit
            | gimli::DW_TAG_namespace
    )
}

impl DwarfEngine {
    /// 型を解決する
    ///
    /// 同じ参照には常に同じ `Arc` を返します。DIEが壊れている場合は
    /// 種類 `Unknown` の未完了の型になります。
    pub fn resolve_type(&self, entry: EntryRef) -> Option<Arc<Type>> {
        let guard = self.caches.lock();
        if let Some(ty) = guard.borrow().types.get(&entry).cloned() {
            return Some(ty);
        }

        let die = match self.die(entry) {
            Some(die) => die,
            None => return self.malformed_type(entry, "no entry starts at this offset"),
        };
        let data = match die.load() {
            Ok(data) => data,
            Err(e) => return self.malformed_type(entry, e),
        };

        Some(self.build_type(&die, &data))
    }

    /// 壊れた参照先に `Unknown` 型を割り当てる（ファイル内の位置でなければ `None`）
    fn malformed_type(&self, entry: EntryRef, reason: impl std::fmt::Display) -> Option<Arc<Type>> {
        let file = self.file(entry.file)?;
        let unit = file.unit_containing(entry.offset)?;
        warn!("{}", DwarfError::malformed(entry.to_string(), reason));

        let ty = Arc::new(Type::placeholder(
            entry.uid(),
            None,
            None,
            TypeKind::Unknown,
            unit.language(),
        ));
        let guard = self.caches.lock();
        guard.borrow_mut().types.insert(entry, ty.clone());
        Some(ty)
    }

    fn build_type(&self, die: &Die, data: &DieData) -> Arc<Type> {
        let entry = die.entry_ref();
        let kind = TypeKind::from_tag(data.tag).unwrap_or(TypeKind::Unknown);
        let language = die.unit().language();
        let name = data.name().map(str::to_string);
        let qualified = name.as_ref().and_then(|_| die.qualified_name());
        let is_definition = !data.is_declaration();

        let make = || {
            Arc::new(Type::placeholder(
                entry.uid(),
                name.clone(),
                qualified.clone(),
                kind,
                language,
            ))
        };

        let guard = self.caches.lock();

        if kind.is_unique_candidate() {
            if let Some(qualified_name) = qualified.clone() {
                let key = UniqueTypeKey {
                    qualified_name,
                    language,
                    kind,
                };
                let canonical =
                    guard
                        .borrow_mut()
                        .unique
                        .canonicalize(key, data.byte_size(), is_definition, &make);
                match canonical {
                    Canonical::Existing(ty) => {
                        trace!(uid = %entry.uid(), canonical = %ty.uid(), "mapped to canonical type");
                        guard.borrow_mut().types.insert(entry, ty.clone());
                        return ty;
                    }
                    Canonical::Upgraded(ty) => {
                        guard.borrow_mut().types.insert(entry, ty.clone());
                        self.fill_type(&ty, die, data);
                        ty.mark_complete();
                        debug!(uid = %entry.uid(), canonical = %ty.uid(), "completed forward declaration");
                        return ty;
                    }
                    Canonical::Registered(ty) => {
                        guard.borrow_mut().types.insert(entry, ty.clone());
                        self.fill_type(&ty, die, data);
                        if is_definition {
                            ty.mark_complete();
                        }
                        return ty;
                    }
                    Canonical::Conflict(existing) => {
                        warn!(
                            uid = %entry.uid(),
                            canonical = %existing.uid(),
                            "conflicting definitions of {} ({:?} vs {:?} bytes)",
                            existing.display_name(),
                            existing.byte_size(),
                            data.byte_size()
                        );
                    }
                }
            }
        }

        let ty = make();
        guard.borrow_mut().types.insert(entry, ty.clone());
        self.fill_type(&ty, die, data);
        if is_definition && kind != TypeKind::Unknown {
            ty.mark_complete();
        }
        ty
    }

    fn type_link(&self, entry: Option<EntryRef>) -> Option<TypeLink> {
        let ty = self.resolve_type(entry?)?;
        Some(TypeLink::new(&ty))
    }

    fn fill_type(&self, ty: &Arc<Type>, die: &Die, data: &DieData) {
        let mut body = TypeBody {
            byte_size: data.byte_size(),
            encoding: match data.attr(gimli::DW_AT_encoding) {
                Some(AttrValue::Encoding(enc)) => Some(*enc),
                _ => None,
            },
            declaration: data.is_declaration(),
            ..Default::default()
        };
        body.target = self.type_link(data.reference(gimli::DW_AT_type));
        let signed_enumerators = ty.kind() == TypeKind::Enumeration
            && has_signed_encoding(body.target.as_ref().and_then(TypeLink::get));
        let big_endian = die.file().endian() == gimli::RunTimeEndian::Big;

        if data.has_children {
            for child in die.children() {
                let child_data = match child.load() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("skipping child of {}: {}", ty.uid(), e);
                        continue;
                    }
                };
                match child_data.tag {
                    gimli::DW_TAG_member if ty.kind().is_record() => {
                        if child_data.flag(gimli::DW_AT_external) {
                            // 静的メンバは宣言だけ
                            continue;
                        }
                        let member_ty = self.type_link(child_data.reference(gimli::DW_AT_type));
                        let byte_offset = child_data
                            .attr(gimli::DW_AT_data_member_location)
                            .and_then(member_offset);
                        let bit_offset = child_data
                            .unsigned(gimli::DW_AT_data_bit_offset)
                            .or_else(|| {
                                let storage = child_data.byte_size().or_else(|| {
                                    member_ty.as_ref().and_then(TypeLink::get)?.byte_size()
                                });
                                legacy_bit_offset(&child_data, byte_offset, storage, big_endian)
                            });
                        body.members.push(Member {
                            name: child_data.name().map(str::to_string),
                            ty: member_ty,
                            byte_offset,
                            bit_size: child_data.unsigned(gimli::DW_AT_bit_size),
                            bit_offset,
                            artificial: child_data.flag(gimli::DW_AT_artificial),
                        });
                    }
                    gimli::DW_TAG_inheritance => {
                        body.base_classes.push(BaseClass {
                            ty: self.type_link(child_data.reference(gimli::DW_AT_type)),
                            byte_offset: child_data
                                .attr(gimli::DW_AT_data_member_location)
                                .and_then(member_offset),
                            is_virtual: child_data.unsigned(gimli::DW_AT_virtuality).unwrap_or(0) != 0,
                        });
                    }
                    gimli::DW_TAG_enumerator => {
                        if let Some(name) = child_data.name() {
                            body.enumerators.push(Enumerator {
                                name: name.to_string(),
                                value: enumerator_value(&child_data, signed_enumerators),
                            });
                        }
                    }
                    gimli::DW_TAG_subrange_type => {
                        let count = child_data.unsigned(gimli::DW_AT_count).or_else(|| {
                            let upper = child_data.signed(gimli::DW_AT_upper_bound)?;
                            let lower = child_data.signed(gimli::DW_AT_lower_bound).unwrap_or(0);
                            let count = upper.checked_sub(lower)?.checked_add(1)?;
                            u64::try_from(count).ok()
                        });
                        body.dimensions.push(count);
                    }
                    gimli::DW_TAG_formal_parameter if ty.kind() == TypeKind::Subroutine => {
                        body.parameters
                            .push(self.type_link(child_data.reference(gimli::DW_AT_type)));
                    }
                    _ => {}
                }
            }
        }

        ty.set_body(body);
    }

    /// 変数を解決する
    ///
    /// `function_entry` はロケーションリストの基底に使う関数の入口アドレスです。
    /// 省略した場合は外側の関数から求めます。キャッシュは参照ごとなので、
    /// 最初の解決時の値が使われます。
    pub fn resolve_variable(
        &self,
        entry: EntryRef,
        function_entry: Option<u64>,
    ) -> Option<Arc<Variable>> {
        let guard = self.caches.lock();
        if let Some(var) = guard.borrow().variables.get(&entry).cloned() {
            return Some(var);
        }

        let die = self.die(entry)?;
        let variable = match die.load() {
            Ok(data) => self.build_variable(&die, &data, function_entry),
            Err(e) => {
                warn!("{}", e);
                Variable {
                    uid: entry.uid(),
                    name: None,
                    qualified_name: None,
                    ty: None,
                    scope: VariableScope::Local,
                    location: VariableLocation::OptimizedOut,
                    function_entry,
                    decl_line: None,
                    artificial: false,
                }
            }
        };

        let variable = Arc::new(variable);
        guard.borrow_mut().variables.insert(entry, variable.clone());
        Some(variable)
    }

    fn build_variable(&self, die: &Die, data: &DieData, function_entry: Option<u64>) -> Variable {
        let origin = die
            .declaration_origin(data)
            .and_then(|origin| origin.load().ok());
        let pick = |at: gimli::DwAt| -> Option<EntryRef> {
            data.reference(at)
                .or_else(|| origin.as_ref().and_then(|o| o.reference(at)))
        };

        let name = data
            .name()
            .or_else(|| origin.as_ref().and_then(|o| o.name()))
            .map(str::to_string);

        let parent_tag = die.parent().and_then(|p| p.tag());
        let at_file_scope = parent_tag.map_or(false, is_scope_tag);
        let external = data.flag(gimli::DW_AT_external)
            || origin.as_ref().map_or(false, |o| o.flag(gimli::DW_AT_external));
        let scope = if data.tag == gimli::DW_TAG_formal_parameter {
            VariableScope::Parameter
        } else if at_file_scope && external {
            VariableScope::Global
        } else if at_file_scope {
            VariableScope::Static
        } else {
            VariableScope::Local
        };

        let function_entry = if at_file_scope {
            None
        } else {
            function_entry.or_else(|| self.enclosing_function_entry(die))
        };

        let location = self.variable_location(die, data, function_entry);

        Variable {
            uid: die.uid(),
            qualified_name: if at_file_scope { die.qualified_name() } else { name.clone() },
            name,
            ty: self.type_link(pick(gimli::DW_AT_type)),
            scope,
            location,
            function_entry,
            decl_line: data
                .unsigned(gimli::DW_AT_decl_line)
                .or_else(|| origin.as_ref().and_then(|o| o.unsigned(gimli::DW_AT_decl_line))),
            artificial: data.flag(gimli::DW_AT_artificial),
        }
    }

    fn variable_location(
        &self,
        die: &Die,
        data: &DieData,
        function_entry: Option<u64>,
    ) -> VariableLocation {
        let unit = die.unit();
        match data.attr(gimli::DW_AT_location) {
            Some(AttrValue::Expression(bytes)) | Some(AttrValue::Block(bytes)) => {
                classify_expression(bytes, unit.unit().encoding(), die.file().endian())
            }
            Some(AttrValue::LocationList(offset)) => {
                let Some(dwarf) = die.file().dwarf() else {
                    return VariableLocation::OptimizedOut;
                };
                let entries = read_location_list(
                    dwarf,
                    unit.unit(),
                    unit.base_address(),
                    *offset,
                    function_entry,
                );
                match entries {
                    Ok(entries) if entries.is_empty() => VariableLocation::OptimizedOut,
                    Ok(entries) => VariableLocation::List(entries),
                    Err(e) => {
                        warn!("{}", DwarfError::malformed(die.entry_ref().to_string(), e));
                        VariableLocation::OptimizedOut
                    }
                }
            }
            _ => match data.attr(gimli::DW_AT_const_value) {
                Some(AttrValue::Block(bytes)) => VariableLocation::Expression(bytes.clone()),
                Some(value) => value
                    .as_signed()
                    .map_or(VariableLocation::OptimizedOut, VariableLocation::Constant),
                None => VariableLocation::OptimizedOut,
            },
        }
    }

    /// 外側の関数の入口アドレス
    fn enclosing_function_entry(&self, die: &Die) -> Option<u64> {
        let mut current = die.parent();
        while let Some(parent) = current {
            match parent.tag()? {
                gimli::DW_TAG_subprogram => return parent.load().ok()?.entry_pc(),
                tag if is_scope_tag(tag) => return None,
                _ => current = parent.parent(),
            }
        }
        None
    }

    /// 関数を解決する
    pub fn resolve_function(&self, entry: EntryRef) -> Option<Arc<Function>> {
        let guard = self.caches.lock();
        if let Some(function) = guard.borrow().functions.get(&entry).cloned() {
            return Some(function);
        }

        let die = self.die(entry)?;
        let data = match die.load() {
            Ok(data) => data,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        if data.tag != gimli::DW_TAG_subprogram {
            return None;
        }

        let origin = die
            .declaration_origin(&data)
            .and_then(|origin| origin.load().ok());
        let name = data
            .name()
            .or_else(|| origin.as_ref().and_then(|o| o.name()))
            .map(str::to_string);
        let linkage_name = data
            .linkage_name()
            .or_else(|| origin.as_ref().and_then(|o| o.linkage_name()))
            .map(str::to_string);
        let demangled_name = linkage_name.as_deref().and_then(demangle_symbol);
        let return_type = data
            .reference(gimli::DW_AT_type)
            .or_else(|| origin.as_ref().and_then(|o| o.reference(gimli::DW_AT_type)));

        let function = Arc::new(Function {
            uid: entry.uid(),
            qualified_name: die.qualified_name(),
            name,
            linkage_name,
            demangled_name,
            entry_pc: data.entry_pc(),
            ranges: data.ranges.clone(),
            return_type: self.type_link(return_type),
            decl_file: data
                .unsigned(gimli::DW_AT_decl_file)
                .or_else(|| origin.as_ref().and_then(|o| o.unsigned(gimli::DW_AT_decl_file))),
            decl_line: data
                .unsigned(gimli::DW_AT_decl_line)
                .or_else(|| origin.as_ref().and_then(|o| o.unsigned(gimli::DW_AT_decl_line))),
            is_external: data.flag(gimli::DW_AT_external)
                || origin.as_ref().map_or(false, |o| o.flag(gimli::DW_AT_external)),
        });

        guard.borrow_mut().functions.insert(entry, function.clone());
        Some(function)
    }

    /// 関数本体のブロック木（関数DIE自身が根）
    pub fn function_root_block(&self, function: &Function) -> Option<Arc<Block>> {
        let entry = self.decode(function.uid).ok()?;
        let _guard = self.caches.lock();
        self.build_block(entry, function.entry_pc, 0)
    }

    /// 関数の引数とローカル変数（ネストしたブロックも含む）
    pub fn function_variables(&self, function: &Function) -> Vec<Arc<Variable>> {
        fn collect(block: &Block, out: &mut Vec<Arc<Variable>>) {
            out.extend(block.variables.iter().cloned());
            for child in &block.children {
                collect(child, out);
            }
        }

        let mut variables = Vec::new();
        if let Some(root) = self.function_root_block(function) {
            collect(&root, &mut variables);
        }
        variables
    }

    /// レキシカルブロックまたはインライン展開を解決する
    pub fn resolve_block(&self, entry: EntryRef) -> Option<Arc<Block>> {
        let _guard = self.caches.lock();
        let die = self.die(entry)?;
        let function_entry = self.enclosing_function_entry(&die);
        self.build_block(entry, function_entry, 0)
    }

    fn build_block(
        &self,
        entry: EntryRef,
        function_entry: Option<u64>,
        depth: usize,
    ) -> Option<Arc<Block>> {
        let guard = self.caches.lock();
        if let Some(block) = guard.borrow().blocks.get(&entry).cloned() {
            return Some(block);
        }

        let die = self.die(entry)?;
        let data = die.load().ok();
        let tag = data.as_ref().map(|d| d.tag);

        let mut children = Vec::new();
        let mut variables = Vec::new();
        if depth >= self.config.max_block_depth {
            warn!(uid = %entry.uid(), "block nesting deeper than {}; truncated", self.config.max_block_depth);
        } else {
            for child in die.children() {
                match child.tag() {
                    Some(gimli::DW_TAG_lexical_block) | Some(gimli::DW_TAG_inlined_subroutine) => {
                        if let Some(block) = self.build_block(child.entry_ref(), function_entry, depth + 1) {
                            children.push(block);
                        }
                    }
                    Some(gimli::DW_TAG_variable) | Some(gimli::DW_TAG_formal_parameter) => {
                        if let Some(var) = self.resolve_variable(child.entry_ref(), function_entry) {
                            variables.push(var);
                        }
                    }
                    _ => {}
                }
            }
        }

        let inlined = match (tag, data.as_ref()) {
            (Some(gimli::DW_TAG_inlined_subroutine), Some(data)) => Some(InlinedCall {
                name: die.qualified_name(),
                call_file: data.unsigned(gimli::DW_AT_call_file),
                call_line: data.unsigned(gimli::DW_AT_call_line),
            }),
            _ => None,
        };

        let block = Arc::new(Block {
            uid: entry.uid(),
            ranges: data.map(|d| d.ranges).unwrap_or_default(),
            children,
            variables,
            inlined,
        });
        guard.borrow_mut().blocks.insert(entry, block.clone());
        Some(block)
    }

    /// 名前空間を解決する
    pub fn resolve_namespace(&self, entry: EntryRef) -> Option<Arc<Namespace>> {
        let guard = self.caches.lock();
        if let Some(ns) = guard.borrow().namespaces.get(&entry).cloned() {
            return Some(ns);
        }

        let die = self.die(entry)?;
        let data = die.load().ok()?;
        if data.tag != gimli::DW_TAG_namespace {
            return None;
        }
        let name = data.name().map(str::to_string);
        let mut parts = die.decl_context_names();
        parts.push(name.clone().unwrap_or_else(|| "(anonymous namespace)".to_string()));

        let namespace = Arc::new(Namespace {
            uid: entry.uid(),
            name,
            qualified_name: parts.join("::"),
        });
        guard.borrow_mut().namespaces.insert(entry, namespace.clone());
        Some(namespace)
    }
}
