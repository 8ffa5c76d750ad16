//! 型・変数・関数の解決とキャッシュのテスト

mod common;

use common::{assemble, cpp_unit, die, int_type, sample_program, Value};
use shirabe_dwarf::{
    DwarfEngine, DwarfError, EngineConfig, FileTag, ResolvedEntity, Type, TypeKind, Uid,
    VariableLocation, VariableScope,
};
use std::sync::Arc;

fn engine() -> (DwarfEngine, common::Assembled) {
    let program = sample_program();
    let engine = DwarfEngine::new(Arc::new(program.source("app")), EngineConfig::default());
    (engine, program)
}

#[test]
fn test_resolve_type_is_idempotent() {
    let (engine, program) = engine();

    let first = engine
        .resolve_type(program.entry("node_a"))
        .expect("Node should resolve");
    let second = engine
        .resolve_type(program.entry("node_a"))
        .expect("Node should resolve again");

    println!("{:?}", first);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.kind(), TypeKind::Structure);
    assert_eq!(first.byte_size(), Some(16));
}

#[test]
fn test_self_referential_struct() {
    let (engine, program) = engine();

    let node = engine
        .resolve_type(program.entry("node_a"))
        .expect("Node should resolve");
    assert!(node.is_complete());

    let members = node.members();
    for m in &members {
        println!("  {:?} @ {:?}", m.name, m.byte_offset);
    }
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name.as_deref(), Some("value"));
    assert_eq!(members[1].byte_offset, Some(8));

    // next: Node * -> Node（同じArcに戻る）
    let next = members[1]
        .ty
        .as_ref()
        .and_then(|link| link.get())
        .expect("next should have a type");
    assert_eq!(next.kind(), TypeKind::Pointer);
    assert_eq!(next.display_name(), "Node *");
    let pointee = next.target().expect("pointer should have a target");
    assert!(Arc::ptr_eq(&pointee, &node));
}

#[test]
fn test_same_type_in_two_units_is_deduplicated() {
    let (engine, program) = engine();

    let from_b = engine
        .resolve_type(program.entry("node_b"))
        .expect("Node in b.cpp should resolve");
    let from_a = engine
        .resolve_type(program.entry("node_a"))
        .expect("Node in a.cpp should resolve");
    assert!(Arc::ptr_eq(&from_a, &from_b));

    // 名前空間内の型も修飾名で一致する
    let inner_a = engine
        .resolve_type(program.entry("inner_a"))
        .expect("ns::Inner should resolve");
    let inner_b = engine
        .resolve_type(program.entry("inner_b"))
        .expect("ns::Inner should resolve");
    assert_eq!(inner_a.qualified_name(), Some("ns::Inner"));
    assert!(Arc::ptr_eq(&inner_a, &inner_b));

    // 基本型は重複排除の対象外
    let int_a = engine.resolve_type(program.entry("int_a")).expect("int");
    let int_b = engine.resolve_type(program.entry("int_b")).expect("int");
    assert!(!Arc::ptr_eq(&int_a, &int_b));
}

#[test]
fn test_forward_declaration_is_upgraded_once() {
    let (engine, program) = engine();

    let decl = engine
        .resolve_type(program.entry("fwd_decl"))
        .expect("declaration should resolve");
    assert!(!decl.is_complete());
    assert!(decl.members().is_empty());

    let ptr = engine
        .resolve_type(program.entry("fwd_ptr"))
        .expect("Fwd * should resolve");

    let def = engine
        .resolve_type(program.entry("fwd_def"))
        .expect("definition should resolve");
    assert!(Arc::ptr_eq(&decl, &def));
    assert!(decl.is_complete());
    assert_eq!(decl.byte_size(), Some(8));
    assert_eq!(decl.members().len(), 1);

    // 宣言を指していたポインタからも定義が見える
    let target = ptr.target().expect("pointer target");
    assert!(target.is_complete());

    // もう一度解決しても同じ型のまま
    let again = engine.resolve_type(program.entry("fwd_decl")).expect("Fwd");
    assert!(Arc::ptr_eq(&again, &def));
}

#[test]
fn test_definition_before_declaration() {
    let (engine, program) = engine();

    let def = engine.resolve_type(program.entry("fwd_def")).expect("definition");
    let decl = engine.resolve_type(program.entry("fwd_decl")).expect("declaration");
    assert!(Arc::ptr_eq(&def, &decl));
    assert!(decl.is_complete());
}

#[test]
fn test_conflicting_sizes_stay_separate() {
    let (engine, program) = engine();

    let a = engine.resolve_type(program.entry("mismatch_a")).expect("Mismatch (4)");
    let b = engine.resolve_type(program.entry("mismatch_b")).expect("Mismatch (8)");
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.byte_size(), Some(4));
    assert_eq!(b.byte_size(), Some(8));

    // 正規型は最初に登録された方のまま
    let found = engine.find_types("Mismatch");
    assert!(found.iter().any(|t| Arc::ptr_eq(t, &a)));
    assert!(found.iter().any(|t| Arc::ptr_eq(t, &b)));
    assert_eq!(found.len(), 2);
}

#[test]
fn test_find_types_collapses_duplicates() {
    let (engine, _program) = engine();

    let nodes = engine.find_types("Node");
    println!("Found {} types named Node", nodes.len());
    assert_eq!(nodes.len(), 1);

    let inner = engine.find_types("ns::Inner");
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].qualified_name(), Some("ns::Inner"));

    assert!(engine.find_types("NoSuchType").is_empty());
}

#[test]
fn test_malformed_entry_resolves_to_unknown() {
    let (engine, program) = engine();

    let bad = engine
        .resolve_type(program.entry("bad_struct"))
        .expect("Bad should still resolve");
    let members = bad.members();
    assert_eq!(members.len(), 1);

    let broken = members[0]
        .ty
        .as_ref()
        .and_then(|link| link.get())
        .expect("broken member should have a placeholder type");
    println!("broken member type: {:?}", broken);
    assert_eq!(broken.kind(), TypeKind::Unknown);
    assert!(!broken.is_complete());

    // 同じ壊れた参照は同じプレースホルダになる
    let again = engine.resolve_type(program.entry("bogus")).expect("Unknown type");
    assert!(Arc::ptr_eq(&broken, &again));

    // 壊れたDIEの前にある兄弟は影響を受けない
    let main = engine.resolve_function(program.entry("main")).expect("main");
    assert_eq!(main.name.as_deref(), Some("main"));
    let counter = engine.find_global_variables("counter");
    assert_eq!(counter.len(), 1);
}

#[test]
fn test_compile_units_are_parsed_on_demand() {
    let (engine, program) = engine();

    assert_eq!(engine.num_compile_units(), 2);
    assert_eq!(engine.parse_count(), 0);

    let first = engine.unit_at(1).expect("second unit");
    let second = engine.unit_at(1).expect("second unit again");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.parse_count(), 1);
    assert_eq!(first.name(), Some("b.cpp"));
    assert_eq!(first.language(), Some(gimli::DW_LANG_C_plus_plus));

    // b.cpp の型だけを解決しても a.cpp は解析されない
    engine.resolve_type(program.entry("node_b")).expect("Node");
    assert_eq!(engine.parse_count(), 1);

    assert!(engine.unit_at(2).is_none());
}

#[test]
fn test_uid_round_trip() {
    let (engine, program) = engine();

    for label in ["node_a", "node_ptr_a", "main", "argc", "block", "counter", "helper", "answer"] {
        let entry = program.entry(label);
        let uid = engine.encode(entry);
        let decoded = engine.decode(uid).expect("uid should decode");
        println!("{} -> {} -> {}", label, uid, decoded);
        assert_eq!(decoded, entry);
    }
}

#[test]
fn test_invalid_uids_are_rejected() {
    let (engine, program) = engine();

    // DIEの途中を指すオフセット
    let mut inside = program.entry("node_a");
    inside.offset += 1;
    let err = engine.decode(engine.encode(inside)).unwrap_err();
    println!("{}", err);
    assert!(matches!(err, DwarfError::InvalidIdentifier(_)));

    // 存在しない分割ユニット・補助ファイル
    let mut split = program.entry("node_a");
    split.file = FileTag::Split(5);
    assert!(engine.decode(engine.encode(split)).is_err());
    assert!(engine.decode(Uid(u64::MAX)).is_err());

    // 壊れたDIEの位置も識別子としては無効
    assert!(engine.decode(engine.encode(program.entry("bogus"))).is_err());
    assert!(engine.resolve(Uid(u64::MAX)).is_none());
}

#[test]
fn test_resolve_dispatches_by_tag() {
    let (engine, program) = engine();

    let cases = [
        ("node_a", "type"),
        ("main", "function"),
        ("counter", "variable"),
        ("block", "block"),
        ("ns_a", "namespace"),
    ];
    for (label, kind) in cases {
        let uid = program.entry(label).uid();
        let entity = engine.resolve(uid).expect("entity should resolve");
        println!("{} -> {} {}", label, entity.kind_name(), entity.uid());
        assert_eq!(entity.kind_name(), kind);
        assert_eq!(entity.uid(), uid);
    }

    match engine.resolve(program.entry("ns_a").uid()) {
        Some(ResolvedEntity::Namespace(ns)) => assert_eq!(ns.qualified_name, "ns"),
        other => panic!("expected namespace, got {:?}", other),
    }
}

#[test]
fn test_function_and_variables() {
    let (engine, program) = engine();

    let functions = engine.find_functions("main");
    assert_eq!(functions.len(), 1);
    let main = &functions[0];
    assert_eq!(main.entry_pc, Some(0x1000));
    assert_eq!(main.ranges, vec![0x1000..0x1100]);
    assert!(main.is_external);
    assert_eq!(
        main.return_type.as_ref().and_then(|t| t.get()).map(|t| t.display_name()),
        Some("int".to_string())
    );

    let variables = engine.function_variables(main);
    for v in &variables {
        println!("  {:?} {:?} {:?}", v.name, v.scope, v.location);
    }
    assert_eq!(variables.len(), 2);
    assert_eq!(variables[0].name.as_deref(), Some("argc"));
    assert_eq!(variables[0].scope, VariableScope::Parameter);
    assert_eq!(variables[0].location, VariableLocation::FrameOffset(-20));
    assert_eq!(variables[1].name.as_deref(), Some("tmp"));
    assert_eq!(variables[1].scope, VariableScope::Local);
    assert_eq!(variables[1].location, VariableLocation::FrameOffset(-24));
    assert_eq!(variables[1].function_entry, Some(0x1000));

    let root = engine.function_root_block(main).expect("root block");
    assert_eq!(root.uid, main.uid);
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].uid, program.entry("block").uid());

    // ブロックも同一性を保つ
    let block = engine.resolve_block(program.entry("block")).expect("block");
    assert!(Arc::ptr_eq(&block, &root.children[0]));
}

#[test]
fn test_global_and_constant_variables() {
    let (engine, program) = engine();

    let counter = engine.find_global_variables("counter");
    assert_eq!(counter.len(), 1);
    assert_eq!(counter[0].scope, VariableScope::Global);
    assert_eq!(counter[0].location, VariableLocation::Address(0x4000));
    assert_eq!(counter[0].ty().map(|t| t.display_name()), Some("int".to_string()));

    let answer = engine
        .resolve_variable(program.entry("answer"), None)
        .expect("answer");
    assert_eq!(answer.location, VariableLocation::Constant(42));
    assert_eq!(answer.function_entry, Some(0x2000));
}

#[test]
fn test_linkage_name_is_demangled() {
    let (engine, _program) = engine();

    let by_linkage = engine.find_functions("_ZN4core3fmt5write17h0123456789abcdefE");
    assert_eq!(by_linkage.len(), 1);
    let helper = &by_linkage[0];
    assert_eq!(helper.name.as_deref(), Some("helper"));
    assert_eq!(helper.demangled_name.as_deref(), Some("core::fmt::write"));

    let by_name = engine.find_functions("helper");
    assert!(Arc::ptr_eq(&by_name[0], helper));
}

#[test]
fn test_concurrent_resolution_shares_identity() {
    let (engine, program) = engine();
    let labels = ["node_b", "fwd_decl", "node_a", "fwd_def", "inner_b", "inner_a", "bad_struct"];

    let results: Vec<Vec<(&str, Arc<Type>)>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &engine;
                let program = &program;
                s.spawn(move || {
                    // スレッドごとに最初に解決する型を変える
                    let mut order = labels.to_vec();
                    order.rotate_left(i % labels.len());
                    let mut types = Vec::new();
                    for label in order {
                        let ty = engine
                            .resolve_type(program.entry(label))
                            .expect("type should resolve");
                        // 返ってくるのは中身が埋まった型だけ
                        if label.starts_with("node_") {
                            assert_eq!(ty.members().len(), 2);
                        }
                        types.push((label, ty));
                    }
                    types
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect()
    });

    for types in &results {
        for (label, ty) in types {
            let reference = engine.resolve_type(program.entry(label)).expect("type");
            assert!(Arc::ptr_eq(ty, &reference), "{} differs between threads", label);
        }
    }

    let node_a = engine.resolve_type(program.entry("node_a")).expect("Node");
    let node_b = engine.resolve_type(program.entry("node_b")).expect("Node");
    assert!(Arc::ptr_eq(&node_a, &node_b));
    let fwd = engine.resolve_type(program.entry("fwd_decl")).expect("Fwd");
    assert!(fwd.is_complete());

    let stats = engine.cache_stats();
    println!("{:?}", stats);
    assert_eq!(stats.unique_types, 4);
}

#[test]
fn test_cyclic_specification_does_not_recurse_forever() {
    // a と b が DW_AT_specification で互いを指している壊れたデータ
    let program = assemble(&[cpp_unit("cycle.cpp").children([
        die(gimli::DW_TAG_subprogram)
            .label("a")
            .name("fa")
            .attr(gimli::DW_AT_specification, Value::Ref("b".to_string()))
            .pc_range(0x100, 0x200),
        die(gimli::DW_TAG_subprogram)
            .label("b")
            .attr(gimli::DW_AT_specification, Value::Ref("a".to_string())),
    ])]);
    let engine = DwarfEngine::new(Arc::new(program.source("cycle")), EngineConfig::default());

    let a = engine
        .resolve_function(program.entry("a"))
        .expect("function a should resolve");
    println!("{:?}", a);
    assert_eq!(a.name.as_deref(), Some("fa"));
    assert_eq!(a.qualified_name.as_deref(), Some("fa"));

    let b = engine
        .resolve_function(program.entry("b"))
        .expect("function b should resolve");
    assert_eq!(b.name.as_deref(), Some("fa"));

    // 名前索引の構築も止まらない
    assert!(!engine.find_functions("fa").is_empty());
}

#[test]
fn test_enumerator_values_follow_underlying_sign() {
    let enumerator = |name: &str, value: u8| {
        die(gimli::DW_TAG_enumerator)
            .name(name)
            .attr(gimli::DW_AT_const_value, Value::Data1(value))
    };
    let program = assemble(&[cpp_unit("enum.cpp").children([
        int_type("int"),
        die(gimli::DW_TAG_base_type)
            .label("uchar")
            .name("unsigned char")
            .byte_size(1)
            .attr(gimli::DW_AT_encoding, Value::Data1(gimli::DW_ATE_unsigned_char.0)),
        die(gimli::DW_TAG_enumeration_type)
            .label("signed_enum")
            .name("Signed")
            .byte_size(4)
            .type_ref("int")
            .children([enumerator("minus_one", 0xff), enumerator("one", 1)]),
        die(gimli::DW_TAG_enumeration_type)
            .label("unsigned_enum")
            .name("Unsigned")
            .byte_size(1)
            .type_ref("uchar")
            .child(enumerator("max", 0xff)),
    ])]);
    let engine = DwarfEngine::new(Arc::new(program.source("enum")), EngineConfig::default());

    let signed = engine
        .resolve_type(program.entry("signed_enum"))
        .expect("Signed enum");
    let values: Vec<i64> = signed.enumerators().iter().map(|e| e.value).collect();
    println!("Signed: {:?}", signed.enumerators());
    assert_eq!(values, vec![-1, 1]);

    let unsigned = engine
        .resolve_type(program.entry("unsigned_enum"))
        .expect("Unsigned enum");
    assert_eq!(unsigned.enumerators()[0].value, 255);
}

#[test]
fn test_bitfield_offsets() {
    let bitfield = |name: &str, bit_size: u8, at: gimli::DwAt, offset: u8| {
        die(gimli::DW_TAG_member)
            .name(name)
            .type_ref("int")
            .byte_size(4)
            .attr(gimli::DW_AT_data_member_location, Value::Data1(0))
            .attr(gimli::DW_AT_bit_size, Value::Data1(bit_size))
            .attr(at, Value::Data1(offset))
    };
    let program = assemble(&[cpp_unit("bits.cpp").children([
        int_type("int"),
        die(gimli::DW_TAG_structure_type)
            .label("flags")
            .name("Flags")
            .byte_size(4)
            .children([
                // DWARF 2/3 形式（格納単位の最上位ビットから数える）
                bitfield("low", 3, gimli::DW_AT_bit_offset, 29),
                bitfield("mid", 5, gimli::DW_AT_bit_offset, 24),
                // DWARF 4 形式
                bitfield("high", 4, gimli::DW_AT_data_bit_offset, 8),
            ]),
    ])]);
    let engine = DwarfEngine::new(Arc::new(program.source("bits")), EngineConfig::default());

    let flags = engine.resolve_type(program.entry("flags")).expect("Flags");
    let members = flags.members();
    for m in &members {
        println!("  {:?} bits={:?} at={:?}", m.name, m.bit_size, m.bit_offset);
    }
    let offsets: Vec<Option<u64>> = members.iter().map(|m| m.bit_offset).collect();
    assert_eq!(offsets, vec![Some(0), Some(3), Some(8)]);
}
