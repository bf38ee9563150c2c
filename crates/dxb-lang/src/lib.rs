//! `dxb-lang` compiles DATEX script text and in-memory values into the DATEX
//! binary format, and frames the result into routable blocks.
//!
//! ## Examples
//!
//! ```rs
//! use dxb_lang::{CompileOptions, Compiler, Value, ValueGraph};
//!
//! // A bare body, without routing or signed header
//! let body = dxb_lang::compile_body("var x = 10; x + 1").unwrap();
//! assert_eq!(body.last(), Some(&0x01));
//!
//! // Placeholders are filled from a value graph
//! let mut graph = ValueGraph::new();
//! let name = graph.text("world");
//! let options = CompileOptions {
//!     inserted_values: vec![name],
//!     ..CompileOptions::body_only()
//! };
//! let output = Compiler::default().compile("'hello ' + ?", &options, &graph).unwrap();
//! assert!(output.block().is_some());
//!
//! // Full blocks carry a routing prefix and a signed header
//! let output = Compiler::default()
//!     .compile("1", &CompileOptions::default(), &ValueGraph::new())
//!     .unwrap();
//! let block = output.block().unwrap();
//! let layout = dxb_lang::BlockLayout::parse(block).unwrap();
//! assert_eq!(layout.body(block), &[0xc1, 0x01, 0x01]);
//! ```
mod arena;
mod bigint;
mod binary;
mod buffer;
mod compiler;
mod config;
mod dynamic_index;
mod error;
mod framer;
mod lexer;
mod quantity;
mod sid;
mod value;

pub use arena::{Arena, ArenaId};
pub use bigint::BigInt;
pub use binary::{ActionType, BinaryCode, ProtocolDataType, RECEIVER_KEY_SIZE};
pub use compiler::{Compiler, NoRuntime, ResourceResolver};
pub use config::{CompileOptions, Config, Receiver};
pub use error::{CompileError, Error, FrameError, InnerError, SyntaxError, ValueError};
pub use framer::{
    BlockLayout, BlockStream, CryptoProvider, Output, extract_header_sender, set_header_ttl, update_header_receivers,
};
pub use lexer::error::LexerError;
pub use lexer::token::{Token, TokenKind};
pub use lexer::{LexState, next_token};
pub use quantity::{Quantity, SiUnits, UnitSystem};
pub use sid::ScopeIdRegistry;
pub use value::{
    Identity, PointerRef, PropertyKey, ScopeBlock, Target, TargetKind, TupleKey, TypeRef, Value, ValueGraph, ValueId,
};

/// Compiles `code` into a bare body with the default configuration.
#[allow(clippy::result_large_err)]
pub fn compile_body(code: &str) -> Result<Vec<u8>, Error> {
    let output = Compiler::default().compile(code, &CompileOptions::body_only(), &ValueGraph::new())?;
    Ok(output.into_blocks()?.concat())
}
