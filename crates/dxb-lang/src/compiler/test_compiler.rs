//! Byte-level tests for the script compiler.
use rstest::rstest;

use crate::binary::{ActionType, BinaryCode};
use crate::config::CompileOptions;
use crate::error::{CompileError, InnerError, SyntaxError};
use crate::value::{Value, ValueGraph, ValueId};
use crate::{Compiler, Error};

fn compile(code: &str) -> Result<Vec<u8>, InnerError> {
    compile_with(code, &ValueGraph::new(), Vec::new())
}

fn compile_with(code: &str, graph: &ValueGraph, values: Vec<ValueId>) -> Result<Vec<u8>, InnerError> {
    let options = CompileOptions {
        inserted_values: values,
        ..CompileOptions::body_only()
    };
    Compiler::default()
        .compile(code, &options, graph)
        .and_then(|output| output.into_blocks())
        .map(|blocks| blocks.concat())
        .map_err(|e: Error| e.cause)
}

#[rstest]
#[case::int8("5", vec![0xc1, 0x05, 0x01])]
#[case::int16("300", vec![0xc2, 0x2c, 0x01, 0x01])]
#[case::two_statements("1;2", vec![0xc1, 0x01, 0x01, 0xc1, 0x02, 0x01])]
#[case::trailing_semicolon("5;", vec![0xc1, 0x05, 0x01])]
#[case::short_text("'ab'", vec![0xce, 0x02, 0x61, 0x62, 0x01])]
#[case::add_without_spaces("1+2", vec![0xc1, 0x01, 0x92, 0xc1, 0x02, 0x01])]
#[case::add("1 + 2", vec![0xc1, 0x01, 0x92, 0xc1, 0x02, 0x01])]
#[case::null("null", vec![0xc8, 0x01])]
#[case::true_("true", vec![0xc6, 0x01])]
#[case::empty(";", vec![0x01])]
#[case::array("[1,2]", vec![0xe0, 0xea, 0xc1, 0x01, 0xea, 0xc1, 0x02, 0xe1, 0x01])]
#[case::small_ints_repeat("[1,2,1]", vec![0xe0, 0xea, 0xc1, 0x01, 0xea, 0xc1, 0x02, 0xea, 0xc1, 0x01, 0xe1, 0x01])]
#[case::array_trailing_comma("[1,]", vec![0xe0, 0xea, 0xc1, 0x01, 0xe1, 0x01])]
#[case::tuple("(1,2)", vec![0xe4, 0xea, 0xc1, 0x01, 0xea, 0xc1, 0x02, 0xe5, 0x01])]
#[case::object("{a: 1}", vec![0xe2, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe3, 0x01])]
#[case::top_level_record("a: 1", vec![0xe4, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe5, 0x01])]
fn test_compile_script(#[case] code: &str, #[case] expected: Vec<u8>) {
    assert_eq!(compile(code), Ok(expected));
}

#[rstest]
#[case::redeclared("var x = 1; var x = 2", CompileError::Redeclared { kind: "var", name: "x".into() }.into())]
#[case::undeclared("y", CompileError::UndeclaredVariable("y".into()).into())]
#[case::const_assignment("const c = 1; c = 2", CompileError::ConstReadonly("c".into()).into())]
#[case::missing_bracket("(1", SyntaxError::MissingClosingBracket.into())]
#[case::invalid_bracket("1)", SyntaxError::InvalidClosingBracket.into())]
#[case::missing_array_bracket("[1", SyntaxError::MissingClosingArrayBracket.into())]
#[case::unresolved_label("jmp nowhere", SyntaxError::UnresolvedLabels("nowhere".to_string()).into())]
#[case::duplicate_label("lbl a; lbl a", SyntaxError::DuplicateLabel("a".into()).into())]
#[case::else_without_if("else (1)", SyntaxError::ElseWithoutIf.into())]
#[case::skip_outside_loop("skip", SyntaxError::InvalidSkip.into())]
#[case::unclosed_tuple("(1, 2", SyntaxError::MissingClosingBracket.into())]
#[case::unclosed_record("(a: 1", SyntaxError::MissingClosingBracket.into())]
#[case::tuple_closed_by_array_bracket("(1, 2]", SyntaxError::MissingClosingBracket.into())]
#[case::if_without_body("if (true)", SyntaxError::MissingStatementBody("if").into())]
#[case::while_without_body("while (true)", SyntaxError::MissingStatementBody("while").into())]
#[case::iterate_without_body("iterate [1,2]", SyntaxError::MissingStatementBody("iterate").into())]
#[case::iterate_without_value("iterate", SyntaxError::MissingStatementBody("iterate").into())]
fn test_compile_errors(#[case] code: &str, #[case] expected: InnerError) {
    assert_eq!(compile(code), Err(expected));
}

#[test]
fn test_variable_declaration_and_read() {
    let set = BinaryCode::InternalVar.with_action(ActionType::SetReference);
    let get = BinaryCode::InternalVar.with_action(ActionType::Get);
    assert_eq!(
        compile("var x = 1; x"),
        Ok(vec![set, 0x00, 0x00, 0x01, 0xc1, 0x01, 0x01, get, 0x00, 0x00, 0x01, 0x01])
    );
}

#[test]
fn test_if_else_jump_targets() {
    let body = compile("if (true) (1) else (2)").unwrap();
    assert_eq!(
        body,
        vec![
            0x02, // if chain
            0x58, 0x12, 0x00, 0x00, 0x00, // jfa -> else branch
            0x02, 0xc6, 0x03, // condition
            0x02, 0xc1, 0x01, 0x03, // then
            0x56, 0x16, 0x00, 0x00, 0x00, // jmp -> end of chain
            0x02, 0xc1, 0x02, 0x03, // else
            0x03, 0x01,
        ]
    );
    assert_eq!(body[0x12], BinaryCode::SubscopeStart.byte());
    assert_eq!(body[0x16], BinaryCode::SubscopeEnd.byte());
}

#[rstest]
#[case::backward("lbl start; jmp start", vec![0x04, 0x01, 0x56, 0x00, 0x00, 0x00, 0x00, 0x01])]
#[case::forward(
    "jmp end; 1; lbl end",
    vec![0x56, 0x09, 0x00, 0x00, 0x00, 0x01, 0xc1, 0x01, 0x01, 0x04, 0x01]
)]
#[case::forward_to_wrapped_tuple(
    "jmp a; lbl a 1, 2",
    vec![0x56, 0x06, 0x00, 0x00, 0x00, 0x01, 0xe4, 0xea, 0x04, 0xc1, 0x01, 0xea, 0xc1, 0x02, 0xe5, 0x01]
)]
#[case::backward_to_wrapped_tuple(
    "1; lbl a 2, 3; jmp a",
    vec![0xc1, 0x01, 0x01, 0xe4, 0xea, 0x04, 0xc1, 0x02, 0xea, 0xc1, 0x03, 0xe5, 0x01, 0x56, 0x03, 0x00, 0x00, 0x00, 0x01]
)]
fn test_labels(#[case] code: &str, #[case] expected: Vec<u8>) {
    assert_eq!(compile(code), Ok(expected));
}

fn shared_object(graph: &mut ValueGraph) -> ValueId {
    let one = graph.add(Value::Int(1));
    graph.object([("a", one)])
}

#[test]
fn test_inserted_value_is_deduplicated() {
    let mut graph = ValueGraph::new();
    let object = shared_object(&mut graph);
    let body = compile_with("[?, ?]", &graph, vec![object, object]).unwrap();
    assert_eq!(
        body,
        vec![
            0xe0, 0xea, 0x35, 0xa5, 0x00, 0x00, 0x00, 0xe2, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe3, 0xea, 0xa4, 0x00, 0x00,
            0x00, 0xe1, 0x01,
        ]
    );
}

#[test]
fn test_distinct_values_are_not_deduplicated() {
    let mut graph = ValueGraph::new();
    let first = shared_object(&mut graph);
    let second = shared_object(&mut graph);
    let body = compile_with("[?, ?]", &graph, vec![first, second]).unwrap();
    assert!(!body.contains(&BinaryCode::SetVarSubResult.byte()));
}

#[test]
fn test_value_inserted_three_times_is_written_once() {
    let mut graph = ValueGraph::new();
    let object = shared_object(&mut graph);
    let body = compile_with("[?, ?, ?]", &graph, vec![object, object, object]).unwrap();
    assert_eq!(
        body,
        vec![
            0xe0, 0xea, 0x35, 0xa5, 0x00, 0x00, 0x00, // #0 =
            0xe2, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe3, // {a: 1}
            0xea, 0xa4, 0x00, 0x00, 0x00, // #0
            0xea, 0xa4, 0x00, 0x00, 0x00, // #0
            0xe1, 0x01,
        ]
    );

    let copies = [shared_object(&mut graph), shared_object(&mut graph), shared_object(&mut graph)];
    let deep = compile_with("[?, ?, ?]", &graph, copies.to_vec()).unwrap();
    assert!(body.len() < deep.len());
}

#[test]
fn test_jump_targets_follow_splice() {
    let mut graph = ValueGraph::new();
    let object = shared_object(&mut graph);
    let body = compile_with("[?, if (true) (1), ?]", &graph, vec![object, object]).unwrap();
    assert_eq!(
        body,
        vec![
            0xe0, 0xea, 0x35, 0xa5, 0x00, 0x00, 0x00, // #0 =
            0xe2, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe3, // {a: 1}
            0xea, 0x02, 0x58, 0x21, 0x00, 0x00, 0x00, // jfa, moved by the splice
            0x02, 0xc6, 0x03, 0x02, 0xc1, 0x01, 0x03, //
            0x56, 0x21, 0x00, 0x00, 0x00, 0x03, // jmp, moved by the splice
            0xea, 0xa4, 0x00, 0x00, 0x00, 0xe1, 0x01,
        ]
    );
    assert_eq!(body[0x21], BinaryCode::SubscopeEnd.byte());
}

#[test]
fn test_jump_targets_around_cycle_patch() {
    let mut graph = ValueGraph::new();
    let cyclic = graph.array([]);
    graph.push(cyclic, cyclic);
    let body = compile_with("if (true) (?) else (2)", &graph, vec![cyclic]).unwrap();
    assert_eq!(
        body,
        vec![
            0x02, 0x58, 0x27, 0x00, 0x00, 0x00, // jfa -> else branch
            0x02, 0xc6, 0x03, 0x02, // condition, then
            0x02, 0x35, 0xa5, 0x00, 0x00, 0x00, 0xe0, 0xea, 0xc9, 0xe1, 0x01, // ( #0 = [void];
            0xa4, 0x00, 0x00, 0x00, 0xb3, 0xc1, 0x00, 0xa4, 0x00, 0x00, 0x00, 0x03, // #0.0 = #0 )
            0x03, 0x56, 0x2b, 0x00, 0x00, 0x00, // jmp -> end of chain
            0x02, 0xc1, 0x02, 0x03, // else
            0x03, 0x01,
        ]
    );
    assert_eq!(body[0x27], BinaryCode::SubscopeStart.byte());
    assert_eq!(body[0x2b], BinaryCode::SubscopeEnd.byte());
}

#[test]
fn test_jump_targets_follow_splice_with_cycle() {
    let mut graph = ValueGraph::new();
    let object = shared_object(&mut graph);
    let cyclic = graph.array([]);
    graph.push(cyclic, object);
    graph.push(cyclic, cyclic);
    let body = compile_with("[?, if (true) (1), ?]", &graph, vec![object, cyclic]).unwrap();
    assert_eq!(
        body,
        vec![
            0xe0, 0xea, 0x35, 0xa5, 0x00, 0x00, 0x00, // #0 =
            0xe2, 0xe6, 0x01, 0x61, 0xc1, 0x01, 0xe3, // {a: 1}
            0xea, 0x02, 0x58, 0x21, 0x00, 0x00, 0x00, // jfa, moved by the splice
            0x02, 0xc6, 0x03, 0x02, 0xc1, 0x01, 0x03, //
            0x56, 0x21, 0x00, 0x00, 0x00, 0x03, // jmp, moved by the splice
            0xea, 0x02, 0x35, 0xa5, 0x00, 0x01, 0x00, // ( #1 =
            0xe0, 0xea, 0xa4, 0x00, 0x00, 0x00, 0xea, 0xc9, 0xe1, 0x01, // [#0, void];
            0xa4, 0x00, 0x01, 0x00, 0xb3, 0xc1, 0x01, 0xa4, 0x00, 0x01, 0x00, 0x03, // #1.1 = #1 )
            0xe1, 0x01,
        ]
    );
    assert_eq!(body[0x21], BinaryCode::SubscopeEnd.byte());
}

#[test]
fn test_missing_placeholder_is_void() {
    assert_eq!(compile("?"), Ok(vec![0xc9, 0x01]));
}

#[test]
fn test_self_referencing_array() {
    let mut graph = ValueGraph::new();
    let array = graph.array([]);
    graph.push(array, array);
    let output = Compiler::default()
        .compile_value(&graph, array, &CompileOptions::body_only())
        .unwrap();
    assert_eq!(
        output.block(),
        Some(
            &[
                0x02, 0x35, 0xa5, 0x00, 0x00, 0x00, // ( #0 =
                0xe0, 0xea, 0xc9, 0xe1, 0x01, // [void];
                0xa4, 0x00, 0x00, 0x00, 0xb3, 0xc1, 0x00, 0xa4, 0x00, 0x00, 0x00, // #0.0 = #0
                0x03, 0x01,
            ][..]
        )
    );
}

#[test]
fn test_value_hash_follows_structure() {
    use sha2::{Digest, Sha256};

    let mut graph = ValueGraph::new();
    let one = graph.add(Value::Int(1));
    let two = graph.add(Value::Int(2));
    let first = graph.array([one, two]);
    let second = graph.array([one, two]);
    let reversed = graph.array([two, one]);

    let compiler = Compiler::default();
    let hash = compiler.value_hash(&graph, first).unwrap();
    assert_eq!(hash, compiler.value_hash(&graph, second).unwrap());
    assert_ne!(hash, compiler.value_hash(&graph, reversed).unwrap());

    let body = [0xe0, 0xea, 0xc1, 0x01, 0xea, 0xc1, 0x02, 0xe1, 0x01];
    let expected: [u8; 32] = Sha256::digest(body).into();
    assert_eq!(hash, expected);
}

#[test]
fn test_unique_value_identifier() {
    use base64::prelude::*;

    let mut graph = ValueGraph::new();
    let pointer = graph.add(Value::Pointer(crate::value::PointerRef::new(vec![0x0a, 0xff])));
    let text = graph.text("key");

    let compiler = Compiler::default();
    assert_eq!(compiler.unique_value_identifier(&graph, pointer).unwrap(), "$0AFF");
    let identifier = compiler.unique_value_identifier(&graph, text).unwrap();
    assert_eq!(identifier, compiler.value_hash_string(&graph, text).unwrap());
    assert_eq!(BASE64_STANDARD.decode(identifier).unwrap().len(), 32);
}

#[test]
fn test_stream_is_cut_into_blocks() {
    let mut graph = ValueGraph::new();
    let head = graph.add(Value::Int(1));
    let stream = graph.add(Value::Stream(vec![vec![1, 2], vec![3]]));
    let blocks = Compiler::default()
        .compile(
            "? << ?",
            &CompileOptions {
                inserted_values: vec![head, stream],
                ..CompileOptions::body_only()
            },
            &graph,
        )
        .and_then(|output| output.into_blocks())
        .unwrap();
    assert_eq!(
        blocks,
        vec![
            vec![0xc1, 0x01, 0xf2],
            vec![0xca, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02],
            vec![0xca, 0x01, 0x00, 0x00, 0x00, 0x03],
            vec![0x01],
        ]
    );
}

#[test]
fn test_framed_block() {
    let output = Compiler::default()
        .compile("1", &CompileOptions::default(), &ValueGraph::new())
        .unwrap();
    let block = output.block().unwrap();
    let layout = crate::BlockLayout::parse(block).unwrap();
    assert_eq!(layout.size as usize, block.len());
    assert_eq!(layout.body(block), &[0xc1, 0x01, 0x01]);
    assert!(layout.end_of_scope(block));
}

#[test]
fn test_split_by_max_block_size() {
    let code = "[1, 2, 3, 4, 5, 6, 7, 8]";
    let whole = compile(code).unwrap();
    let options = CompileOptions {
        max_block_size: Some(8),
        ..CompileOptions::body_only()
    };
    let blocks = Compiler::default()
        .compile(code, &options, &ValueGraph::new())
        .and_then(|output| output.into_blocks())
        .unwrap();
    assert!(blocks.len() > 1);
    assert!(blocks.iter().all(|b| b.len() <= 8));
    assert_eq!(blocks.concat(), whole);
}

#[test]
fn test_split_framed_blocks_mark_only_last_as_end_of_scope() {
    let options = CompileOptions {
        max_block_size: Some(120),
        ..Default::default()
    };
    let code = format!("'{}'", "x".repeat(300));
    let blocks = Compiler::default()
        .compile(&code, &options, &ValueGraph::new())
        .and_then(|output| output.into_blocks())
        .unwrap();
    assert!(blocks.len() > 1);
    let flags: Vec<bool> = blocks
        .iter()
        .map(|b| crate::BlockLayout::parse(b).unwrap().end_of_scope(b))
        .collect();
    let (last, rest) = flags.split_last().unwrap();
    assert!(*last);
    assert!(rest.iter().all(|eos| !eos));
}

#[rstest]
#[case::exactly_max(3, true)]
#[case::below_max(4, false)]
fn test_split_starts_at_max_block_size(#[case] max: usize, #[case] split: bool) {
    let options = CompileOptions {
        max_block_size: Some(max),
        ..CompileOptions::body_only()
    };
    let output = Compiler::default().compile("5", &options, &ValueGraph::new()).unwrap();
    assert_eq!(output.block().is_none(), split);
    assert_eq!(output.into_blocks().unwrap().concat(), vec![0xc1, 0x05, 0x01]);
}

#[derive(Debug)]
struct PaddingCrypto;

impl crate::CryptoProvider for PaddingCrypto {
    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, crate::FrameError> {
        Ok(Vec::new())
    }

    fn encrypt(&self, data: &[u8], _key: &[u8], _iv: &[u8; 16]) -> Result<Vec<u8>, crate::FrameError> {
        // pad to the next multiple of 16, always adding at least one byte
        let mut out = data.to_vec();
        out.resize((data.len() / 16 + 1) * 16, 0);
        Ok(out)
    }

    fn encrypted_len(&self, plain: usize) -> usize {
        (plain / 16 + 1) * 16
    }

    fn generate_iv(&self) -> Result<[u8; 16], crate::FrameError> {
        Ok([0; 16])
    }
}

#[test]
fn test_encrypted_blocks_stay_within_max_block_size() {
    let mut compiler = Compiler::default();
    compiler.set_crypto(std::sync::Arc::new(PaddingCrypto));
    let options = CompileOptions {
        encrypt: true,
        symmetric_key: Some(vec![1]),
        max_block_size: Some(120),
        ..Default::default()
    };
    let code = format!("'{}'", "x".repeat(300));
    let blocks = compiler
        .compile(&code, &options, &ValueGraph::new())
        .and_then(|output| output.into_blocks())
        .unwrap();
    assert!(blocks.len() > 1);
    assert!(blocks.iter().all(|b| b.len() <= 120));
}

#[test]
fn test_error_points_at_line() {
    let err = Compiler::default()
        .compile("1;\n2;\nundeclared", &CompileOptions::body_only(), &ValueGraph::new())
        .unwrap_err();
    assert_eq!(err.line(), 3);
}
