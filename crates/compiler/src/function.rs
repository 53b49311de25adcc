//! Per-function state
//!
//! A function holds its signature, its parsed tree, and the basic blocks
//! the code generator produces from it. Functions are created when a
//! definition is parsed and dropped as soon as they have been emitted.

use std::rc::Rc;

use crate::block::Block;
use crate::node::Node;
use crate::token::TokenRef;
use crate::types::FunctionRef;

#[derive(Debug)]
pub struct Function {
    pub ty: FunctionRef,
    pub name: TokenRef,
    pub asm_name: Rc<str>,
    pub root: Node,
    pub blocks: Vec<Block>,

    /// Frame offset of the first variadic argument slot; -1 until computed.
    pub variadic_offset: i32,

    /// String label index of the `__func__` literal; -1 until first use.
    pub name_label: i32,

    /// Bytes reserved by the prologue, filled in after generation.
    pub frame_size: u32,

    /// True when the return type does not fit a word and the caller passes
    /// a hidden pointer to the return slot as the first argument.
    pub returns_large: bool,
}

impl Function {
    pub fn new(ty: FunctionRef, name: TokenRef, asm_name: Rc<str>, root: Node) -> Function {
        let returns_large = !ty.ret.is_void() && ty.ret.size().map(|s| s > 4).unwrap_or(false);
        Function {
            ty,
            name,
            asm_name,
            root,
            blocks: Vec::new(),
            variadic_offset: -1,
            name_label: -1,
            frame_size: 0,
            returns_large,
        }
    }

    pub fn add_block(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }
}
