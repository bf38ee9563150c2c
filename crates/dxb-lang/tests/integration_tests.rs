use std::sync::Arc;

use dxb_lang::{
    BlockLayout, CompileError, CompileOptions, Compiler, Config, InnerError, PointerRef, ProtocolDataType,
    ResourceResolver, SyntaxError, Target, Value, ValueGraph, ValueId,
};
use rstest::{fixture, rstest};

#[fixture]
fn compiler() -> Compiler {
    Compiler::new(Config::default())
}

fn body_of(output: dxb_lang::Output) -> Vec<u8> {
    output.into_blocks().unwrap().concat()
}

#[rstest]
#[case::arithmetic("1 + 2 * 3")]
#[case::variables("var a = 10; ref b = a; b")]
#[case::structures("{list: [1, 2, 3], flag: true, name: 'dxb'}")]
#[case::while_loop("var i = 0; while (i < 10) (i += 1)")]
#[case::iterate("iterate [1, 2, 3] (#it)")]
#[case::if_chain("var x = 3; if (x == 1) (1) else if (x == 2) (2) else (3)")]
#[case::function("function add(a, b) (a + b); add(1, 2)")]
#[case::template("'sum: (1 + 2)'")]
#[case::comments("1; # comment\n2 /* block */")]
fn test_scripts_compile(compiler: Compiler, #[case] code: &str) {
    let output = compiler
        .compile(code, &CompileOptions::body_only(), &ValueGraph::new())
        .unwrap();
    let body = body_of(output);
    assert_eq!(body.last(), Some(&0x01), "{code} did not close its body");
}

#[rstest]
#[case::unclosed_object("{a: 1", SyntaxError::MissingClosingObjectBracket)]
#[case::stray_array_end("1]", SyntaxError::InvalidClosingArrayBracket)]
#[case::leading_comma(", 1", SyntaxError::InvalidLeadingComma)]
#[case::key_in_array("['a': 1]", SyntaxError::InvalidKeyInArray)]
fn test_syntax_errors(compiler: Compiler, #[case] code: &str, #[case] expected: SyntaxError) {
    let err = compiler
        .compile(code, &CompileOptions::body_only(), &ValueGraph::new())
        .unwrap_err();
    assert_eq!(err.cause, InnerError::Syntax(expected));
}

#[rstest]
fn test_compile_body_matches_compiler(compiler: Compiler) {
    let code = "[1, 'two', 3.5]";
    let direct = body_of(
        compiler
            .compile(code, &CompileOptions::body_only(), &ValueGraph::new())
            .unwrap(),
    );
    assert_eq!(dxb_lang::compile_body(code).unwrap(), direct);
}

#[rstest]
fn test_compile_value_from_json(compiler: Compiler) {
    let json = serde_json::json!({"name": "dxb", "tags": ["a", "b"], "n": 3});
    let mut graph = ValueGraph::new();
    let id = graph.from_json(&json);
    let body = body_of(compiler.compile_value(&graph, id, &CompileOptions::body_only()).unwrap());

    assert_eq!(body.first(), Some(&0xe2));
    assert_eq!(body.last(), Some(&0x01));
    assert_eq!(body[body.len() - 2], 0xe3);
}

#[rstest]
fn test_repeated_text_is_shared_unless_disabled(compiler: Compiler) {
    let mut graph = ValueGraph::new();
    let a = graph.text("repeated");
    let b = graph.text("repeated");
    let list = graph.array([a, b]);

    let shared = body_of(compiler.compile_value(&graph, list, &CompileOptions::body_only()).unwrap());
    let options = CompileOptions {
        no_duplicate_value_optimization: true,
        ..CompileOptions::body_only()
    };
    let copied = body_of(compiler.compile_value(&graph, list, &options).unwrap());

    assert!(shared.contains(&0x35));
    assert!(!copied.contains(&0x35));
    assert_eq!(copied.windows(8).filter(|w| w == b"repeated").count(), 2);
}

#[rstest]
fn test_mutual_cycle(compiler: Compiler) {
    let mut graph = ValueGraph::new();
    let parent = graph.add(Value::Object(Vec::new()));
    let child = graph.add(Value::Object(Vec::new()));
    graph.insert(parent, "child", child);
    graph.insert(child, "parent", parent);

    let body = body_of(compiler.compile_value(&graph, parent, &CompileOptions::body_only()).unwrap());
    // ( #0 = {child: {}}; #0.child.parent = #0 ) style
    assert_eq!(body.first(), Some(&0x02));
    assert!(body.contains(&0xb3));
    assert_eq!(&body[body.len() - 2..], &[0x03, 0x01]);
}

#[rstest]
fn test_pointer_value(compiler: Compiler) {
    let mut graph = ValueGraph::new();
    let pointer = graph.add(Value::Pointer(PointerRef::new(vec![0xaa; 21])));
    let body = body_of(
        compiler
            .compile_value(&graph, pointer, &CompileOptions::body_only())
            .unwrap(),
    );
    assert!(body.windows(21).any(|w| w == [0xaa; 21]));
}

#[rstest]
fn test_native_value_is_rejected(compiler: Compiler) {
    let mut graph = ValueGraph::new();
    let native = graph.add(Value::Native("HostHandle".into()));
    let err = compiler
        .compile_value(&graph, native, &CompileOptions::body_only())
        .unwrap_err();
    assert!(err.to_string().contains("HostHandle"));
}

#[rstest]
#[case::request(ProtocolDataType::Request)]
#[case::response(ProtocolDataType::Response)]
#[case::data(ProtocolDataType::Data)]
fn test_framed_data_type(compiler: Compiler, #[case] data_type: ProtocolDataType) {
    let options = CompileOptions::default().with_type(data_type);
    let output = compiler.compile("42", &options, &ValueGraph::new()).unwrap();
    let block = output.block().unwrap();
    let layout = BlockLayout::parse(block).unwrap();
    assert_eq!(layout.data_type(block), data_type as u8);
    assert_eq!(layout.body(block), &[0xc1, 42, 0x01]);
}

#[rstest]
fn test_sid_counters_advance(compiler: Compiler) {
    let options = CompileOptions {
        sid: Some(7),
        end_of_scope: false,
        ..Default::default()
    };
    let graph = ValueGraph::new();
    let first = compiler.compile("1", &options, &graph).unwrap();
    let second = compiler.compile("2", &options, &graph).unwrap();
    let (first, second) = (first.block().unwrap(), second.block().unwrap());
    let (l1, l2) = (BlockLayout::parse(first).unwrap(), BlockLayout::parse(second).unwrap());

    assert_eq!(l1.sid(first), 7);
    assert_eq!(l2.sid(second), 7);
    assert_ne!(l1.inc(first), l2.inc(second));
}

#[rstest]
fn test_receivers_in_routing_prefix(compiler: Compiler) {
    let options = CompileOptions {
        sender: Some(Target::person("alice")),
        receivers: vec![Target::person("bob").into()],
        ..Default::default()
    };
    let output = compiler.compile("1", &options, &ValueGraph::new()).unwrap();
    let block = output.block().unwrap();
    assert!(block.windows(5).any(|w| w == b"alice"));
    assert!(block.windows(3).any(|w| w == b"bob"));
    assert_eq!(BlockLayout::parse(block).unwrap().body(block), &[0xc1, 0x01, 0x01]);
}

#[rstest]
fn test_required_plugin(compiler: Compiler) {
    let options = CompileOptions {
        required_plugins: vec!["log".into()],
        ..CompileOptions::body_only()
    };
    let graph = ValueGraph::new();
    let err = compiler.compile("1", &options, &graph).unwrap_err();
    assert_eq!(err.cause, InnerError::Compile(CompileError::MissingPlugin("log".to_string())));

    assert!(compiler.compile("plugin log (1)", &options, &graph).is_ok());
}

struct Fixed(i64);

impl ResourceResolver for Fixed {
    fn evaluate(&self, _command: &str, _body: &[u8]) -> Result<(ValueGraph, ValueId), CompileError> {
        let mut graph = ValueGraph::new();
        let id = graph.add(Value::Int(self.0));
        Ok((graph, id))
    }
}

#[rstest]
fn test_compile_time_insert(mut compiler: Compiler) {
    let graph = ValueGraph::new();
    let err = compiler
        .compile("insert (1 + 1)", &CompileOptions::body_only(), &graph)
        .unwrap_err();
    assert!(matches!(err.cause, InnerError::Compile(CompileError::Unsupported(_))));

    compiler.set_resolver(Arc::new(Fixed(9)));
    let body = body_of(
        compiler
            .compile("insert (1 + 1)", &CompileOptions::body_only(), &graph)
            .unwrap(),
    );
    assert_eq!(body, vec![0xc1, 0x09, 0x01]);
}

#[rstest]
fn test_shared_registry_across_threads() {
    let compiler = Compiler::default();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let compiler = compiler.clone();
            std::thread::spawn(move || {
                let options = CompileOptions {
                    end_of_scope: false,
                    ..Default::default()
                };
                let output = compiler.compile("1", &options, &ValueGraph::new()).unwrap();
                let block = output.block().unwrap().to_vec();
                BlockLayout::parse(&block).unwrap().sid(&block)
            })
        })
        .collect();
    let mut sids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    sids.sort_unstable();
    sids.dedup();
    assert_eq!(sids.len(), 4);
    assert_eq!(compiler.registry().len(), 4);
}
