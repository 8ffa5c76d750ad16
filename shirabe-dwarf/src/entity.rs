//! 解決済みのエンティティ（型・変数・関数・ブロック・名前空間）
//!
//! エンティティはエンジンのキャッシュが `Arc` で所有し、エンティティ同士は
//! `TypeLink`（識別子 + `Weak`）で参照し合います。自己参照型でも `Arc` の
//! 循環は生じません。

use crate::location::VariableLocation;
use crate::uid::Uid;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// 型の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Base,
    Pointer,
    Reference,
    RvalueReference,
    Const,
    Volatile,
    Restrict,
    Atomic,
    Typedef,
    Array,
    Structure,
    Class,
    Union,
    Enumeration,
    Subroutine,
    Unspecified,
    Unknown,
}

impl TypeKind {
    /// DWARFタグから種類を得る（型でないタグは `None`）
    pub fn from_tag(tag: gimli::DwTag) -> Option<Self> {
        let kind = match tag {
            gimli::DW_TAG_base_type => TypeKind::Base,
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_ptr_to_member_type => TypeKind::Pointer,
            gimli::DW_TAG_reference_type => TypeKind::Reference,
            gimli::DW_TAG_rvalue_reference_type => TypeKind::RvalueReference,
            gimli::DW_TAG_const_type => TypeKind::Const,
            gimli::DW_TAG_volatile_type => TypeKind::Volatile,
            gimli::DW_TAG_restrict_type => TypeKind::Restrict,
            gimli::DW_TAG_atomic_type => TypeKind::Atomic,
            gimli::DW_TAG_typedef => TypeKind::Typedef,
            gimli::DW_TAG_array_type => TypeKind::Array,
            gimli::DW_TAG_structure_type => TypeKind::Structure,
            gimli::DW_TAG_class_type => TypeKind::Class,
            gimli::DW_TAG_union_type => TypeKind::Union,
            gimli::DW_TAG_enumeration_type => TypeKind::Enumeration,
            gimli::DW_TAG_subroutine_type => TypeKind::Subroutine,
            gimli::DW_TAG_unspecified_type => TypeKind::Unspecified,
            _ => return None,
        };
        Some(kind)
    }

    /// 構造体・クラス・共用体
    pub fn is_record(self) -> bool {
        matches!(self, TypeKind::Structure | TypeKind::Class | TypeKind::Union)
    }

    /// 重複排除の対象になる種類
    pub fn is_unique_candidate(self) -> bool {
        self.is_record() || self == TypeKind::Enumeration
    }

    /// 修飾子（対象の型をそのまま包む）
    pub fn is_modifier(self) -> bool {
        matches!(
            self,
            TypeKind::Const
                | TypeKind::Volatile
                | TypeKind::Restrict
                | TypeKind::Atomic
                | TypeKind::Typedef
        )
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TypeKind::Base => "base",
            TypeKind::Pointer => "pointer",
            TypeKind::Reference => "reference",
            TypeKind::RvalueReference => "rvalue reference",
            TypeKind::Const => "const",
            TypeKind::Volatile => "volatile",
            TypeKind::Restrict => "restrict",
            TypeKind::Atomic => "atomic",
            TypeKind::Typedef => "typedef",
            TypeKind::Array => "array",
            TypeKind::Structure => "struct",
            TypeKind::Class => "class",
            TypeKind::Union => "union",
            TypeKind::Enumeration => "enum",
            TypeKind::Subroutine => "subroutine",
            TypeKind::Unspecified => "unspecified",
            TypeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// 他の型への弱参照
#[derive(Clone)]
pub struct TypeLink {
    uid: Uid,
    target: Weak<Type>,
}

impl TypeLink {
    pub(crate) fn new(target: &Arc<Type>) -> Self {
        Self {
            uid: target.uid(),
            target: Arc::downgrade(target),
        }
    }

    /// 参照先の識別子
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// 参照先の型（エンジンが生きている間は常に `Some`）
    pub fn get(&self) -> Option<Arc<Type>> {
        self.target.upgrade()
    }
}

impl fmt::Debug for TypeLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TypeLink({})", self.uid)
    }
}

/// レコードのメンバ
#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub ty: Option<TypeLink>,
    pub byte_offset: Option<u64>,
    pub bit_size: Option<u64>,
    pub bit_offset: Option<u64>,
    pub artificial: bool,
}

/// 基底クラス（DW_TAG_inheritance）
#[derive(Debug, Clone)]
pub struct BaseClass {
    pub ty: Option<TypeLink>,
    pub byte_offset: Option<u64>,
    pub is_virtual: bool,
}

/// 列挙子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator {
    pub name: String,
    pub value: i64,
}

/// 型の中身（プレースホルダ作成後に埋められる）
#[derive(Debug, Clone, Default)]
pub struct TypeBody {
    pub byte_size: Option<u64>,
    pub encoding: Option<gimli::DwAte>,
    /// ポインタの指す先、配列の要素、typedefの元、関数の戻り値
    pub target: Option<TypeLink>,
    pub members: Vec<Member>,
    pub base_classes: Vec<BaseClass>,
    pub enumerators: Vec<Enumerator>,
    /// 配列の各次元の要素数（不明なら `None`）
    pub dimensions: Vec<Option<u64>>,
    pub parameters: Vec<Option<TypeLink>>,
    pub declaration: bool,
}

/// 解決済みの型
pub struct Type {
    uid: Uid,
    name: Option<String>,
    qualified_name: Option<String>,
    kind: TypeKind,
    language: Option<gimli::DwLang>,
    body: RwLock<TypeBody>,
    complete: AtomicBool,
}

impl Type {
    pub(crate) fn placeholder(
        uid: Uid,
        name: Option<String>,
        qualified_name: Option<String>,
        kind: TypeKind,
        language: Option<gimli::DwLang>,
    ) -> Self {
        Self {
            uid,
            name,
            qualified_name,
            kind,
            language,
            body: RwLock::new(TypeBody::default()),
            complete: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn qualified_name(&self) -> Option<&str> {
        self.qualified_name.as_deref().or(self.name.as_deref())
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn language(&self) -> Option<gimli::DwLang> {
        self.language
    }

    /// 定義まで解決済みか
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// 中身への読み取りアクセス
    pub fn body(&self) -> RwLockReadGuard<'_, TypeBody> {
        self.body.read()
    }

    pub fn byte_size(&self) -> Option<u64> {
        self.body.read().byte_size
    }

    pub fn members(&self) -> Vec<Member> {
        self.body.read().members.clone()
    }

    pub fn enumerators(&self) -> Vec<Enumerator> {
        self.body.read().enumerators.clone()
    }

    /// ポインタ先・要素・元の型
    pub fn target(&self) -> Option<Arc<Type>> {
        self.body.read().target.as_ref()?.get()
    }

    pub(crate) fn set_body(&self, body: TypeBody) {
        *self.body.write() = body;
    }

    /// 完了フラグを立てる（最初の1回だけ `true`）
    pub(crate) fn mark_complete(&self) -> bool {
        self.complete
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 表示用の型名
    pub fn display_name(&self) -> String {
        self.display_name_depth(0)
    }

    // ポインタの連鎖が自分に戻る場合のための深さ制限付き版
    fn display_name_depth(&self, depth: usize) -> String {
        if let Some(name) = self.qualified_name() {
            return name.to_string();
        }
        if depth > 8 {
            return "...".to_string();
        }
        let inner = self
            .target()
            .map(|t| t.display_name_depth(depth + 1))
            .unwrap_or_else(|| "void".to_string());
        match self.kind {
            TypeKind::Pointer => format!("{} *", inner),
            TypeKind::Reference => format!("{} &", inner),
            TypeKind::RvalueReference => format!("{} &&", inner),
            TypeKind::Const => format!("const {}", inner),
            TypeKind::Volatile => format!("volatile {}", inner),
            TypeKind::Array => format!("{}[]", inner),
            kind => format!("<anonymous {}>", kind),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Type")
            .field("uid", &self.uid)
            .field("name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// 変数の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    Global,
    Static,
    Local,
    Parameter,
}

/// 解決済みの変数
#[derive(Debug)]
pub struct Variable {
    pub uid: Uid,
    pub name: Option<String>,
    pub qualified_name: Option<String>,
    pub ty: Option<TypeLink>,
    pub scope: VariableScope,
    pub location: VariableLocation,
    /// 属する関数の入口アドレス（ロケーションリストの基底）
    pub function_entry: Option<u64>,
    pub decl_line: Option<u64>,
    pub artificial: bool,
}

impl Variable {
    pub fn ty(&self) -> Option<Arc<Type>> {
        self.ty.as_ref()?.get()
    }
}

/// 解決済みの関数
#[derive(Debug)]
pub struct Function {
    pub uid: Uid,
    pub name: Option<String>,
    pub qualified_name: Option<String>,
    pub linkage_name: Option<String>,
    pub demangled_name: Option<String>,
    pub ranges: Vec<Range<u64>>,
    pub entry_pc: Option<u64>,
    pub return_type: Option<TypeLink>,
    pub decl_file: Option<u64>,
    pub decl_line: Option<u64>,
    pub is_external: bool,
}

impl Function {
    /// 表示名（修飾名 → 名前 → デマングル名の順）
    pub fn display_name(&self) -> String {
        self.qualified_name
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.demangled_name.clone())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    pub fn contains(&self, address: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&address))
    }
}

/// インライン展開の情報
#[derive(Debug, Clone)]
pub struct InlinedCall {
    pub name: Option<String>,
    pub call_file: Option<u64>,
    pub call_line: Option<u64>,
}

/// レキシカルブロック（関数本体も1つのブロック）
#[derive(Debug)]
pub struct Block {
    pub uid: Uid,
    pub ranges: Vec<Range<u64>>,
    pub children: Vec<Arc<Block>>,
    pub variables: Vec<Arc<Variable>>,
    pub inlined: Option<InlinedCall>,
}

impl Block {
    pub fn contains(&self, address: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&address))
    }

    /// アドレスを含む最も内側のブロック
    pub fn innermost(self: &Arc<Self>, address: u64) -> Option<Arc<Block>> {
        if !self.ranges.is_empty() && !self.contains(address) {
            return None;
        }
        for child in &self.children {
            if let Some(found) = child.innermost(address) {
                return Some(found);
            }
        }
        Some(self.clone())
    }
}

/// 名前空間
#[derive(Debug)]
pub struct Namespace {
    pub uid: Uid,
    pub name: Option<String>,
    pub qualified_name: String,
}

/// 識別子から解決されたエンティティ
#[derive(Debug, Clone)]
pub enum ResolvedEntity {
    Type(Arc<Type>),
    Variable(Arc<Variable>),
    Function(Arc<Function>),
    Block(Arc<Block>),
    Namespace(Arc<Namespace>),
}

impl ResolvedEntity {
    pub fn uid(&self) -> Uid {
        match self {
            ResolvedEntity::Type(t) => t.uid(),
            ResolvedEntity::Variable(v) => v.uid,
            ResolvedEntity::Function(f) => f.uid,
            ResolvedEntity::Block(b) => b.uid,
            ResolvedEntity::Namespace(n) => n.uid,
        }
    }

    /// 種類名
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResolvedEntity::Type(_) => "type",
            ResolvedEntity::Variable(_) => "variable",
            ResolvedEntity::Function(_) => "function",
            ResolvedEntity::Block(_) => "block",
            ResolvedEntity::Namespace(_) => "namespace",
        }
    }
}
