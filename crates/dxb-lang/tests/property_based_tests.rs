//! Property-based tests for the compiler's public API.
use dxb_lang::{BlockLayout, CompileOptions, Compiler, ValueGraph};
use proptest::prelude::*;

mod strategies {
    use super::*;

    /// JSON documents of bounded depth, with keys that are valid short names
    pub fn json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::Bool),
            any::<i64>().prop_map(|n| serde_json::json!(n)),
            "[a-z ]{0,12}".prop_map(serde_json::Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
    }
}

fn narrowest_int(n: i64) -> Vec<u8> {
    if let Ok(v) = i8::try_from(n) {
        vec![0xc1, v as u8]
    } else if let Ok(v) = i16::try_from(n) {
        [&[0xc2][..], &v.to_le_bytes()].concat()
    } else if let Ok(v) = i32::try_from(n) {
        [&[0xc3][..], &v.to_le_bytes()].concat()
    } else {
        [&[0xc4][..], &n.to_le_bytes()].concat()
    }
}

proptest! {
    #[test]
    fn integers_use_the_narrowest_opcode(n in (i64::MIN + 1)..=i64::MAX) {
        let body = dxb_lang::compile_body(&n.to_string()).unwrap();
        let mut expected = narrowest_int(n);
        expected.push(0x01);
        prop_assert_eq!(body, expected);
    }

    #[test]
    fn short_text_keeps_its_bytes(text in "[a-zA-Z0-9 ]{0,200}") {
        let body = dxb_lang::compile_body(&format!("'{text}'")).unwrap();
        prop_assert_eq!(body[0], 0xce);
        prop_assert_eq!(body[1] as usize, text.len());
        prop_assert_eq!(&body[2..2 + text.len()], text.as_bytes());
    }

    #[test]
    fn json_values_compile(json in strategies::json()) {
        let mut graph = ValueGraph::new();
        let id = graph.from_json(&json);
        let output = Compiler::default().compile_value(&graph, id, &CompileOptions::body_only());
        prop_assert!(output.is_ok());
    }

    #[test]
    fn split_blocks_reassemble(json in strategies::json(), max in 1usize..64) {
        let mut graph = ValueGraph::new();
        let id = graph.from_json(&json);
        let compiler = Compiler::default();
        let whole = compiler
            .compile_value(&graph, id, &CompileOptions::body_only())
            .and_then(|output| output.into_blocks())
            .unwrap()
            .concat();
        let options = CompileOptions {
            max_block_size: Some(max),
            ..CompileOptions::body_only()
        };
        let blocks = compiler
            .compile_value(&graph, id, &options)
            .and_then(|output| output.into_blocks())
            .unwrap();
        prop_assert!(blocks.iter().all(|b| b.len() <= max));
        prop_assert_eq!(blocks.concat(), whole);
    }

    #[test]
    fn framed_blocks_carry_their_size(n in any::<i32>()) {
        let output = Compiler::default()
            .compile(&n.to_string(), &CompileOptions::default(), &ValueGraph::new())
            .unwrap();
        let block = output.block().unwrap();
        let layout = BlockLayout::parse(block).unwrap();
        prop_assert_eq!(layout.size as usize, block.len());
        prop_assert_eq!(*layout.body(block).last().unwrap(), 0x01);
    }
}
