//! 名前付きレコード・列挙型の重複排除
//!
//! 複数のコンパイルユニットに現れる同名の型を、1つの正規型にまとめます。

use crate::entity::{Type, TypeKind};
use std::collections::HashMap;
use std::sync::Arc;

/// 重複排除のキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueTypeKey {
    pub qualified_name: String,
    pub language: Option<gimli::DwLang>,
    pub kind: TypeKind,
}

struct UniqueEntry {
    ty: Arc<Type>,
    byte_size: Option<u64>,
    is_definition: bool,
}

/// `canonicalize` の結果
#[derive(Debug)]
pub enum Canonical {
    /// 登録済みの正規型をそのまま使う
    Existing(Arc<Type>),
    /// 前方宣言だった正規型を定義に格上げする（呼び出し側が中身を埋める）
    Upgraded(Arc<Type>),
    /// 候補を新たに登録した
    Registered(Arc<Type>),
    /// 定義同士でサイズが異なる（候補は登録されない）
    Conflict(Arc<Type>),
}

/// キー -> 正規型
#[derive(Default)]
pub struct UniqueTypeMap {
    entries: HashMap<UniqueTypeKey, UniqueEntry>,
}

impl UniqueTypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 正規型を取得する
    pub fn get(&self, key: &UniqueTypeKey) -> Option<Arc<Type>> {
        self.entries.get(key).map(|e| e.ty.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 候補を正規化する
    ///
    /// 未登録なら `make` で作った型を登録します。登録済みで、候補が定義かつ
    /// 登録側が前方宣言なら登録側を格上げします（同一性は変わりません）。
    pub fn canonicalize(
        &mut self,
        key: UniqueTypeKey,
        byte_size: Option<u64>,
        is_definition: bool,
        make: impl FnOnce() -> Arc<Type>,
    ) -> Canonical {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if !is_definition {
                    return Canonical::Existing(entry.ty.clone());
                }
                if !entry.is_definition {
                    entry.is_definition = true;
                    entry.byte_size = byte_size;
                    return Canonical::Upgraded(entry.ty.clone());
                }
                match (entry.byte_size, byte_size) {
                    (Some(a), Some(b)) if a != b => Canonical::Conflict(entry.ty.clone()),
                    _ => Canonical::Existing(entry.ty.clone()),
                }
            }
            None => {
                let ty = make();
                self.entries.insert(
                    key,
                    UniqueEntry {
                        ty: ty.clone(),
                        byte_size,
                        is_definition,
                    },
                );
                Canonical::Registered(ty)
            }
        }
    }
}
