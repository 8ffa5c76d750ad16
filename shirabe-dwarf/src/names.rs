//! 名前索引
//!
//! 全ユニットを一度だけ走査し、関数・グローバル変数・型・名前空間の名前を
//! 参照の一覧に対応付けます。基本名と完全修飾名の両方で引けます。

use crate::die::Die;
use crate::uid::EntryRef;
use std::collections::HashMap;
use tracing::trace;

const ANONYMOUS_NAMESPACE: &str = "(anonymous namespace)";

/// 名前 -> 参照
#[derive(Debug, Default)]
pub struct NameIndex {
    functions: HashMap<String, Vec<EntryRef>>,
    variables: HashMap<String, Vec<EntryRef>>,
    types: HashMap<String, Vec<EntryRef>>,
    namespaces: HashMap<String, Vec<EntryRef>>,
}

fn insert(map: &mut HashMap<String, Vec<EntryRef>>, name: &str, entry: EntryRef) {
    let refs = map.entry(name.to_string()).or_default();
    if !refs.contains(&entry) {
        refs.push(entry);
    }
}

fn qualify(context: &[String], name: &str) -> String {
    if context.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", context.join("::"), name)
    }
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// ユニットのルートDIEから索引に追加する
    pub fn index_unit(&mut self, root: &Die) {
        let mut context = Vec::new();
        self.walk(root, &mut context);
    }

    fn walk(&mut self, parent: &Die, context: &mut Vec<String>) {
        for child in parent.children() {
            let data = match child.load() {
                Ok(data) => data,
                Err(e) => {
                    trace!("skipping entry while indexing: {}", e);
                    continue;
                }
            };
            let entry = child.entry_ref();

            match data.tag {
                gimli::DW_TAG_namespace => {
                    let name = data.name().unwrap_or(ANONYMOUS_NAMESPACE).to_string();
                    insert(&mut self.namespaces, &qualify(context, &name), entry);
                    context.push(name);
                    self.walk(&child, context);
                    context.pop();
                }
                gimli::DW_TAG_subprogram => {
                    if data.is_declaration() || (data.ranges.is_empty() && data.entry_pc().is_none()) {
                        continue;
                    }
                    if let Some(linkage) = data.linkage_name() {
                        insert(&mut self.functions, linkage, entry);
                    }
                    match data.name() {
                        Some(name) => {
                            insert(&mut self.functions, name, entry);
                            insert(&mut self.functions, &qualify(context, name), entry);
                        }
                        // クラス外定義は宣言側の名前を使う
                        None => {
                            if let Some(qualified) = child.qualified_name() {
                                let base = qualified.rsplit("::").next().unwrap_or(&qualified).to_string();
                                insert(&mut self.functions, &base, entry);
                                insert(&mut self.functions, &qualified, entry);
                            }
                        }
                    }
                }
                gimli::DW_TAG_variable => {
                    if data.is_declaration() {
                        continue;
                    }
                    let name = match data.name() {
                        Some(name) => name.to_string(),
                        None => match child.qualified_name() {
                            Some(q) => q,
                            None => continue,
                        },
                    };
                    let base = name.rsplit("::").next().unwrap_or(&name).to_string();
                    insert(&mut self.variables, &base, entry);
                    if data.name().is_some() {
                        insert(&mut self.variables, &qualify(context, &name), entry);
                    } else {
                        insert(&mut self.variables, &name, entry);
                    }
                }
                gimli::DW_TAG_structure_type
                | gimli::DW_TAG_class_type
                | gimli::DW_TAG_union_type
                | gimli::DW_TAG_enumeration_type => {
                    if let Some(name) = data.name() {
                        let name = name.to_string();
                        insert(&mut self.types, &name, entry);
                        insert(&mut self.types, &qualify(context, &name), entry);
                        context.push(name);
                        self.walk(&child, context);
                        context.pop();
                    }
                }
                gimli::DW_TAG_typedef | gimli::DW_TAG_base_type | gimli::DW_TAG_unspecified_type => {
                    if let Some(name) = data.name() {
                        insert(&mut self.types, name, entry);
                        insert(&mut self.types, &qualify(context, name), entry);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn functions(&self, name: &str) -> &[EntryRef] {
        self.functions.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn variables(&self, name: &str) -> &[EntryRef] {
        self.variables.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn types(&self, name: &str) -> &[EntryRef] {
        self.types.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn namespaces(&self, name: &str) -> &[EntryRef] {
        self.namespaces.get(name).map_or(&[], Vec::as_slice)
    }

    /// 索引された名前の総数
    pub fn len(&self) -> usize {
        self.functions.len() + self.variables.len() + self.types.len() + self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
