//! Code generation
//!
//! Lowers a function's tree into basic blocks of instructions. Register
//! allocation is single-pass and tree-shaped: each node is generated into
//! a target register, operators that need both operands use the next
//! register up, and when the register file runs out the allocator spills
//! around the recursive calls.
//!
//! Calling convention: the first four arguments travel in r0..r3, the
//! rest are pushed rightmost-first and the caller cleans up. All variadic
//! arguments go on the stack so `va_arg` can walk them. A function whose
//! return value does not fit a word receives a hidden pointer to the
//! return slot as its first argument.
//!
//! Values of `long long` and `double` type (and records) are represented
//! in registers by the address of their storage; the word-sized scratch
//! registers ra and rb stage operands around runtime helper calls.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::block::{
    imm, label, reg, Block, BlockLabel, LabelName, Opcode, Operand, Reg, R0, R1, R2, R8, R9, RA,
    RB, RFP, RPP, RSP,
};
use crate::errors::{err, CompileError, ErrorKind, Result};
use crate::function::Function;
use crate::node::{Builtin, Node, NodeKind, UnaryOp};
use crate::symbol::{SymbolKind, SymbolRef};
use crate::token::TokenRef;
use crate::types::{Type, TypeKind, TypeRef};
use crate::Compiler;

fn round_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// True for types whose register representation is the address of their
/// storage rather than the value itself.
pub fn is_by_address(ty: &TypeRef) -> bool {
    if ty.is_record() || ty.is_array() || ty.is_function() {
        return true;
    }
    ty.size().map(|s| s > 4).unwrap_or(false)
}

pub struct CodeGen<'a> {
    pub ctx: &'a mut Compiler,
    pub func: &'a mut Function,
    current: usize,
    locals_cursor: u32,
    locals_max: u32,
    break_labels: Vec<u32>,
    continue_labels: Vec<u32>,
    /// Pending case/default labels of the switches being generated,
    /// innermost last, in source order.
    case_queues: Vec<VecDeque<u32>>,
}

impl<'a> CodeGen<'a> {
    pub fn add(&mut self, token: &TokenRef, op: Opcode, operands: Vec<Operand>) {
        self.func.blocks[self.current].add(token.clone(), op, operands);
    }

    pub fn new_block(&mut self, label_index: u32) {
        self.current = self.func.add_block(Block::new(BlockLabel::Jump(label_index)));
    }

    fn new_user_block(&mut self, name: Rc<str>) {
        let func = self.func.name.value.clone();
        self.current = self
            .func
            .add_block(Block::new(BlockLabel::User { func, name }));
    }

    fn jump_target(&self, index: u32) -> Operand {
        label('&', LabelName::Jump(index))
    }

    fn user_target(&self, name: &Rc<str>) -> Operand {
        label(
            '&',
            LabelName::User {
                func: self.func.name.value.clone(),
                name: name.clone(),
            },
        )
    }

    /// Reserves local storage, returning its frame offset.
    pub fn alloc_local(&mut self, size: u32, alignment: u32) -> i32 {
        let cursor = round_up(self.locals_cursor, alignment.max(1)) + size;
        self.locals_cursor = cursor;
        if cursor > self.locals_max {
            self.locals_max = cursor;
        }
        -(cursor as i32)
    }

    /// Computes `rfp + offset` into the given register.
    pub fn frame_address(&mut self, token: &TokenRef, r: Reg, offset: i32) {
        if (-0x70..0x80).contains(&offset) {
            self.add(token, Opcode::Add, vec![reg(r), reg(RFP), imm(offset)]);
        } else {
            self.add(token, Opcode::Imw, vec![reg(r), imm(offset)]);
            self.add(token, Opcode::Add, vec![reg(r), reg(RFP), reg(r)]);
        }
    }

    /// Adds a byte offset to the address in a register.
    pub fn add_offset(&mut self, token: &TokenRef, r: Reg, offset: u32) {
        if offset == 0 {
            return;
        }
        let offset = offset as i32;
        if (-0x70..0x80).contains(&offset) {
            self.add(token, Opcode::Add, vec![reg(r), reg(r), imm(offset)]);
        } else {
            self.add(token, Opcode::Imw, vec![reg(RA), imm(offset)]);
            self.add(token, Opcode::Add, vec![reg(r), reg(r), reg(RA)]);
        }
    }

    /*
     * Register discipline. Expressions evaluate into a target register;
     * registers below the target hold live outer temporaries. When the
     * target is r9 there is no register above it for the second operand,
     * so r8 is saved on the stack and the pair (r8, r9) is used instead.
     */

    /// Claims a register pair for a binary operation at the given target.
    /// Returns (left, right, spilled).
    pub fn claim_pair(&mut self, token: &TokenRef, r: Reg) -> (Reg, Reg, bool) {
        if r < R9 {
            (r, r + 1, false)
        } else {
            self.add(token, Opcode::Push, vec![reg(R8)]);
            (R8, R9, true)
        }
    }

    /// Moves the pair result into the target and restores a spilled
    /// register.
    pub fn finish_pair(&mut self, token: &TokenRef, target: Reg, result: Reg, spilled: bool) {
        if spilled {
            if result != target {
                self.add(token, Opcode::Mov, vec![reg(target), reg(result)]);
            }
            self.add(token, Opcode::Pop, vec![reg(R8)]);
        } else if result != target {
            self.add(token, Opcode::Mov, vec![reg(target), reg(result)]);
        }
    }

    /// Saves the live registers below the target around a call.
    pub fn save_below(&mut self, token: &TokenRef, r: Reg) {
        for i in 0..r.min(10) {
            self.add(token, Opcode::Push, vec![reg(i)]);
        }
    }

    pub fn restore_below(&mut self, token: &TokenRef, r: Reg) {
        for i in (0..r.min(10)).rev() {
            self.add(token, Opcode::Pop, vec![reg(i)]);
        }
    }

    /// Loads the scalar at the address in `r` into `r`, using the load
    /// width for the type. Sign extension is deferred to conversions.
    pub fn load_scalar(&mut self, token: &TokenRef, r: Reg, ty: &TypeRef) -> Result<()> {
        let op = match ty.size()? {
            1 => Opcode::Ldb,
            2 => Opcode::Lds,
            4 => Opcode::Ldw,
            _ => return Err(CompileError::internal("Cannot load a value of this size.")),
        };
        self.add(token, op, vec![reg(r), reg(r), imm(0)]);
        Ok(())
    }

    /// The store opcode for a scalar of the given size.
    pub fn store_op(size: u32) -> Result<Opcode> {
        match size {
            1 => Ok(Opcode::Stb),
            2 => Ok(Opcode::Sts),
            4 => Ok(Opcode::Stw),
            _ => Err(CompileError::internal("Cannot store a value of this size.")),
        }
    }

    /*
     * Locations
     */

    fn symbol_address(&mut self, token: &TokenRef, symbol: &SymbolRef, r: Reg) -> Result<()> {
        let (offset, asm_name, kind) = {
            let s = symbol.borrow();
            (s.frame_offset, s.asm_name.clone(), s.kind)
        };
        if kind == SymbolKind::Constant {
            return Err(CompileError::internal(
                "An enum constant has no storage location.",
            ));
        }
        match offset {
            Some(offset) => self.frame_address(token, r, offset),
            None => {
                self.add(
                    token,
                    Opcode::Imw,
                    vec![reg(r), label('^', LabelName::Sym(asm_name))],
                );
                self.add(token, Opcode::Add, vec![reg(r), reg(RPP), reg(r)]);
            }
        }
        Ok(())
    }

    /// Generates the address of a storage location into `r`.
    pub fn location(&mut self, node: &Node, r: Reg) -> Result<()> {
        match &node.kind {
            NodeKind::Access(symbol) => self.symbol_address(&node.token, &symbol.clone(), r),
            NodeKind::Unary(UnaryOp::Deref) => self.expression(&node.children[0], r),
            NodeKind::Member { offset, .. } => {
                let offset = *offset;
                let base = &node.children[0];
                if base.is_location() {
                    self.location(base, r)?;
                } else {
                    // A struct rvalue (a call result) is already an
                    // address.
                    self.expression(base, r)?;
                }
                self.add_offset(&node.token, r, offset);
                Ok(())
            }
            NodeKind::StringLit { .. } => self.expression(node, r),
            _ => err(
                ErrorKind::NonAddressable,
                &node.token,
                "This expression has no storage location.",
            ),
        }
    }

    /*
     * Expressions
     */

    /// Generates the value of an expression into the target register.
    /// Wide and aggregate values are represented by their address.
    pub fn expression(&mut self, node: &Node, r: Reg) -> Result<()> {
        match &node.kind {
            NodeKind::Number(value) => self.gen_number(node, *value, r),
            NodeKind::Character(byte) => {
                self.add(&node.token, Opcode::Imw, vec![reg(r), imm(i32::from(*byte))]);
                Ok(())
            }
            NodeKind::StringLit { label: index, .. } => {
                self.add(
                    &node.token,
                    Opcode::Imw,
                    vec![reg(r), label('^', LabelName::Str(*index))],
                );
                self.add(&node.token, Opcode::Add, vec![reg(r), reg(RPP), reg(r)]);
                Ok(())
            }
            NodeKind::Access(symbol) => {
                let symbol = symbol.clone();
                let (kind, value, ty) = {
                    let s = symbol.borrow();
                    (s.kind, s.value, s.ty.clone())
                };
                if kind == SymbolKind::Constant {
                    self.add(&node.token, Opcode::Imw, vec![reg(r), imm(value as i32)]);
                    return Ok(());
                }
                self.symbol_address(&node.token, &symbol, r)?;
                if !is_by_address(&ty) {
                    self.load_scalar(&node.token, r, &ty)?;
                }
                Ok(())
            }
            NodeKind::Unary(op) => self.gen_unary(node, *op, r),
            NodeKind::Binary(op) => self.gen_binary(node, *op, r),
            NodeKind::Assign(op) => self.gen_assign(node, *op, r),
            NodeKind::Cast => {
                self.expression(&node.children[0], r)?;
                self.gen_cast(&node.token, &node.children[0].ty, &node.ty, r)
            }
            NodeKind::Conditional => self.gen_conditional(node, r),
            NodeKind::Sequence => {
                // Statement expressions mix statements with expressions;
                // the last value-producing child supplies the result.
                let count = node.children.len();
                for (index, child) in node.children.iter().enumerate() {
                    if child.is_statement() {
                        self.statement(child)?;
                        if index + 1 == count {
                            self.add(&node.token, Opcode::Zero, vec![reg(r)]);
                        }
                    } else {
                        self.expression(child, r)?;
                    }
                }
                if count == 0 {
                    self.add(&node.token, Opcode::Zero, vec![reg(r)]);
                }
                Ok(())
            }
            NodeKind::Member { offset, .. } => {
                let offset = *offset;
                let base = &node.children[0];
                if base.is_location() {
                    self.location(base, r)?;
                } else {
                    self.expression(base, r)?;
                }
                self.add_offset(&node.token, r, offset);
                if !is_by_address(&node.ty) {
                    self.load_scalar(&node.token, r, &node.ty)?;
                }
                Ok(())
            }
            NodeKind::Call => self.gen_call(node, r),
            NodeKind::Builtin(builtin) => self.gen_builtin(node, *builtin, r),
            NodeKind::Empty => {
                self.add(&node.token, Opcode::Zero, vec![reg(r)]);
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "Unexpected node in expression position: {:?}",
                node.kind
            ))),
        }
    }

    fn gen_number(&mut self, node: &Node, value: u64, r: Reg) -> Result<()> {
        if node.ty.size()? <= 4 {
            self.add(
                &node.token,
                Opcode::Imw,
                vec![reg(r), imm(value as u32 as i32)],
            );
            return Ok(());
        }

        // A 64-bit constant materialises into a stack slot; the register
        // carries the slot's address.
        let slot = self.alloc_local(8, 4);
        self.frame_address(&node.token, r, slot);
        self.add(
            &node.token,
            Opcode::Imw,
            vec![reg(RA), imm(value as u32 as i32)],
        );
        self.add(&node.token, Opcode::Stw, vec![reg(RA), reg(r), imm(0)]);
        self.add(
            &node.token,
            Opcode::Imw,
            vec![reg(RA), imm((value >> 32) as u32 as i32)],
        );
        self.add(&node.token, Opcode::Stw, vec![reg(RA), reg(r), imm(4)]);
        Ok(())
    }

    fn gen_conditional(&mut self, node: &Node, r: Reg) -> Result<()> {
        let else_label = self.ctx.alloc_label();
        let end_label = self.ctx.alloc_label();

        self.expression(&node.children[0], r)?;
        let target = self.jump_target(else_label);
        self.add(&node.token, Opcode::Jz, vec![reg(r), target]);
        self.expression(&node.children[1], r)?;
        let target = self.jump_target(end_label);
        self.add(&node.token, Opcode::Jmp, vec![target]);
        self.new_block(else_label);
        self.expression(&node.children[2], r)?;
        self.new_block(end_label);
        Ok(())
    }

    /*
     * Calls
     */

    /// Stages a runtime helper call. Operand values must already be in
    /// ra/rb (or set up by `setup`); live registers below `live_below`
    /// are saved around the call. When `result_to` is given, r0 is moved
    /// there before the saved registers come back.
    pub fn helper_call<F>(
        &mut self,
        token: &TokenRef,
        name: &str,
        live_below: Reg,
        setup: F,
        result_to: Option<Reg>,
    ) where
        F: FnOnce(&mut Self),
    {
        self.save_below(token, live_below);
        setup(self);
        let sym = self.ctx.lexer.interner.intern(name);
        self.add(token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
        if let Some(result) = result_to {
            if result != R0 {
                self.add(token, Opcode::Mov, vec![reg(result), reg(R0)]);
            }
        }
        self.restore_below(token, live_below);
    }

    fn gen_call(&mut self, node: &Node, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let callee = &node.children[0];
        let args = &node.children[1..];

        let signature = callee
            .ty
            .as_function()
            .cloned()
            .ok_or_else(|| CompileError::internal("Call target has no function type."))?;
        let named_count = signature.params.len();

        let ret_size = if node.ty.is_void() { 0 } else { node.ty.size()? };
        let hidden_slot = if ret_size > 4 {
            Some(self.alloc_local(ret_size, 4))
        } else {
            None
        };

        // A call through a function pointer evaluates the pointer and
        // issues the call on a register.
        let direct: Option<Rc<str>> = match &callee.kind {
            NodeKind::Access(symbol) if symbol.borrow().kind == SymbolKind::Function => {
                Some(symbol.borrow().asm_name.clone())
            }
            _ => None,
        };

        self.save_below(&token, r);

        // Effective argument list: the hidden return pointer occupies
        // position zero when present. Only named arguments ride in
        // registers; every variadic argument goes on the stack where the
        // callee's va_arg expects it.
        let hidden = usize::from(hidden_slot.is_some());
        let total = args.len() + hidden;
        let reg_count = (named_count + hidden).min(4).min(total);

        // Stack portion, rightmost first. All variadic arguments go on
        // the stack; 64-bit variadic values are pushed by value so the
        // callee's va_arg can walk them.
        let mut stack_words: u32 = 0;
        for index in (reg_count..total).rev() {
            let arg = &args[index - hidden];
            let arg_index = index - hidden;
            let variadic_wide =
                arg_index >= named_count && arg.ty.size().map(|s| s > 4).unwrap_or(false);
            self.expression(arg, R0)?;
            if variadic_wide {
                self.add(&token, Opcode::Ldw, vec![reg(RA), reg(R0), imm(4)]);
                self.add(&token, Opcode::Push, vec![reg(RA)]);
                self.add(&token, Opcode::Ldw, vec![reg(RA), reg(R0), imm(0)]);
                self.add(&token, Opcode::Push, vec![reg(RA)]);
                stack_words += 2;
            } else {
                self.add(&token, Opcode::Push, vec![reg(R0)]);
                stack_words += 1;
            }
        }

        // Register portion, pushed rightmost-first then popped into
        // r0..r3 so argument evaluation can use the whole register file.
        for index in (0..reg_count).rev() {
            if index == 0 && hidden_slot.is_some() {
                let slot = hidden_slot.expect("checked");
                self.frame_address(&token, R0, slot);
            } else {
                self.expression(&args[index - hidden], R0)?;
            }
            self.add(&token, Opcode::Push, vec![reg(R0)]);
        }
        if direct.is_none() {
            self.expression(callee, R0)?;
            self.add(&token, Opcode::Push, vec![reg(R0)]);
            self.add(&token, Opcode::Pop, vec![reg(RB)]);
        }
        for index in 0..reg_count {
            self.add(&token, Opcode::Pop, vec![reg(index as Reg)]);
        }

        match direct {
            Some(name) => {
                self.add(&token, Opcode::Call, vec![label('^', LabelName::Sym(name))]);
            }
            None => {
                self.add(&token, Opcode::Call, vec![reg(RB)]);
            }
        }

        if stack_words > 0 {
            self.add(
                &token,
                Opcode::Add,
                vec![reg(RSP), reg(RSP), imm((stack_words * 4) as i32)],
            );
        }
        if ret_size > 0 && r != R0 {
            self.add(&token, Opcode::Mov, vec![reg(r), reg(R0)]);
        }

        self.restore_below(&token, r);
        Ok(())
    }

    /*
     * Builtins
     */

    fn gen_builtin(&mut self, node: &Node, builtin: Builtin, r: Reg) -> Result<()> {
        let token = node.token.clone();
        match builtin {
            Builtin::VaStart => {
                if self.func.variadic_offset < 0 {
                    return err(
                        ErrorKind::KindMismatch,
                        &token,
                        "va_start used in a non-variadic function.",
                    );
                }
                let offset = self.func.variadic_offset;
                self.location(&node.children[0], r)?;
                self.add(&token, Opcode::Imw, vec![reg(RA), imm(offset)]);
                self.add(&token, Opcode::Add, vec![reg(RA), reg(RFP), reg(RA)]);
                self.add(&token, Opcode::Stw, vec![reg(RA), reg(r), imm(0)]);
                Ok(())
            }
            Builtin::VaArg => {
                let size = node.ty.size()?;
                let step = if size > 4 { 8 } else { 4 };
                self.location(&node.children[0], r)?;
                self.add(&token, Opcode::Ldw, vec![reg(RA), reg(r), imm(0)]);
                self.add(&token, Opcode::Add, vec![reg(RB), reg(RA), imm(step)]);
                self.add(&token, Opcode::Stw, vec![reg(RB), reg(r), imm(0)]);
                if size > 4 {
                    // The slot itself is the value's address.
                    self.add(&token, Opcode::Mov, vec![reg(r), reg(RA)]);
                } else {
                    // Stack slots are words; narrow types truncate after
                    // the load.
                    self.add(&token, Opcode::Ldw, vec![reg(r), reg(RA), imm(0)]);
                    let int = Type::base(crate::types::BaseType::SignedInt);
                    self.gen_cast(&token, &int, &node.ty.clone(), r)?;
                }
                Ok(())
            }
            Builtin::VaEnd => {
                // va_end releases nothing in this ABI.
                Ok(())
            }
            Builtin::VaCopy => {
                let (src, dest) = (&node.children[1], &node.children[0]);
                self.location(src, r)?;
                self.add(&token, Opcode::Ldw, vec![reg(RA), reg(r), imm(0)]);
                self.location(dest, r)?;
                self.add(&token, Opcode::Stw, vec![reg(RA), reg(r), imm(0)]);
                Ok(())
            }
            Builtin::FuncName => {
                if self.func.name_label < 0 {
                    let index = self.ctx.alloc_string();
                    let name = self.func.name.value.clone();
                    self.ctx.emitter.string_def_begin(index);
                    self.ctx.emitter.string_def_part(name.as_bytes());
                    self.ctx.emitter.string_def_end();
                    self.func.name_label = index as i32;
                }
                let index = self.func.name_label as u32;
                self.add(
                    &token,
                    Opcode::Imw,
                    vec![reg(r), label('^', LabelName::Str(index))],
                );
                self.add(&token, Opcode::Add, vec![reg(r), reg(RPP), reg(r)]);
                Ok(())
            }
        }
    }

    /*
     * Statements
     */

    fn statement(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Block => {
                // Locals of a block reuse their storage once the block
                // ends; the high-water mark keeps the frame large enough.
                let saved = self.locals_cursor;
                for child in &node.children {
                    self.statement(child)?;
                }
                self.locals_cursor = saved;
                Ok(())
            }
            NodeKind::Empty => Ok(()),
            NodeKind::Variable(symbol) => self.gen_variable(node, &symbol.clone()),
            NodeKind::If => self.gen_if(node),
            NodeKind::While => self.gen_while(node),
            NodeKind::DoWhile => self.gen_do_while(node),
            NodeKind::For => self.gen_for(node),
            NodeKind::Switch => self.gen_switch(node),
            NodeKind::Case(_) | NodeKind::Default => {
                let label_index = self
                    .case_queues
                    .last_mut()
                    .and_then(|queue| queue.pop_front())
                    .ok_or_else(|| {
                        CompileError::internal("Case label outside of a switch.")
                    })?;
                self.new_block(label_index);
                Ok(())
            }
            NodeKind::Return => self.gen_return(node),
            NodeKind::Goto(name) => {
                let target = self.user_target(name);
                self.add(&node.token, Opcode::Jmp, vec![target]);
                Ok(())
            }
            NodeKind::Label(name) => {
                self.new_user_block(name.clone());
                Ok(())
            }
            NodeKind::Break => {
                let Some(&label_index) = self.break_labels.last() else {
                    return err(
                        ErrorKind::ExpectedToken,
                        &node.token,
                        "`break` outside of a loop or switch.",
                    );
                };
                let target = self.jump_target(label_index);
                self.add(&node.token, Opcode::Jmp, vec![target]);
                Ok(())
            }
            NodeKind::Continue => {
                let Some(&label_index) = self.continue_labels.last() else {
                    return err(
                        ErrorKind::ExpectedToken,
                        &node.token,
                        "`continue` outside of a loop.",
                    );
                };
                let target = self.jump_target(label_index);
                self.add(&node.token, Opcode::Jmp, vec![target]);
                Ok(())
            }
            _ => self.expression(node, R0),
        }
    }

    fn gen_if(&mut self, node: &Node) -> Result<()> {
        let else_label = self.ctx.alloc_label();
        self.expression(&node.children[0], R0)?;
        let target = self.jump_target(else_label);
        self.add(&node.token, Opcode::Jz, vec![reg(R0), target]);

        self.statement(&node.children[1])?;

        if node.children.len() > 2 {
            let end_label = self.ctx.alloc_label();
            let target = self.jump_target(end_label);
            self.add(&node.token, Opcode::Jmp, vec![target]);
            self.new_block(else_label);
            self.statement(&node.children[2])?;
            self.new_block(end_label);
        } else {
            self.new_block(else_label);
        }
        Ok(())
    }

    fn gen_while(&mut self, node: &Node) -> Result<()> {
        let start = self.ctx.alloc_label();
        let end = self.ctx.alloc_label();

        self.new_block(start);
        self.expression(&node.children[0], R0)?;
        let target = self.jump_target(end);
        self.add(&node.token, Opcode::Jz, vec![reg(R0), target]);

        self.break_labels.push(end);
        self.continue_labels.push(start);
        self.statement(&node.children[1])?;
        self.break_labels.pop();
        self.continue_labels.pop();

        let target = self.jump_target(start);
        self.add(&node.token, Opcode::Jmp, vec![target]);
        self.new_block(end);
        Ok(())
    }

    fn gen_do_while(&mut self, node: &Node) -> Result<()> {
        let start = self.ctx.alloc_label();
        let cond = self.ctx.alloc_label();
        let end = self.ctx.alloc_label();

        self.new_block(start);
        self.break_labels.push(end);
        self.continue_labels.push(cond);
        self.statement(&node.children[0])?;
        self.break_labels.pop();
        self.continue_labels.pop();

        self.new_block(cond);
        self.expression(&node.children[1], R0)?;
        let target = self.jump_target(start);
        self.add(&node.token, Opcode::Jnz, vec![reg(R0), target]);
        self.new_block(end);
        Ok(())
    }

    fn gen_for(&mut self, node: &Node) -> Result<()> {
        let start = self.ctx.alloc_label();
        let step = self.ctx.alloc_label();
        let end = self.ctx.alloc_label();

        let saved = self.locals_cursor;
        self.statement(&node.children[0])?;

        self.new_block(start);
        if !matches!(node.children[1].kind, NodeKind::Empty) {
            self.expression(&node.children[1], R0)?;
            let target = self.jump_target(end);
            self.add(&node.token, Opcode::Jz, vec![reg(R0), target]);
        }

        self.break_labels.push(end);
        self.continue_labels.push(step);
        self.statement(&node.children[3])?;
        self.break_labels.pop();
        self.continue_labels.pop();

        self.new_block(step);
        if !matches!(node.children[2].kind, NodeKind::Empty) {
            self.expression(&node.children[2], R0)?;
        }
        let target = self.jump_target(start);
        self.add(&node.token, Opcode::Jmp, vec![target]);
        self.new_block(end);
        self.locals_cursor = saved;
        Ok(())
    }

    /// Collects the case values of a switch body in generation order,
    /// skipping nested switches.
    fn collect_cases(node: &Node, out: &mut Vec<Option<u64>>) {
        match &node.kind {
            NodeKind::Case(value) => out.push(Some(*value)),
            NodeKind::Default => out.push(None),
            NodeKind::Switch => {}
            _ => {
                for child in &node.children {
                    Self::collect_cases(child, out);
                }
            }
        }
    }

    fn gen_switch(&mut self, node: &Node) -> Result<()> {
        let token = node.token.clone();
        let end = self.ctx.alloc_label();

        let mut cases = Vec::new();
        Self::collect_cases(&node.children[1], &mut cases);
        let labels: Vec<u32> = cases.iter().map(|_| self.ctx.alloc_label()).collect();

        self.expression(&node.children[0], R0)?;

        // Compare-and-branch chain, then default or end.
        let mut default_label = None;
        for (case, &label_index) in cases.iter().zip(&labels) {
            match case {
                Some(value) => {
                    self.add(
                        &token,
                        Opcode::Imw,
                        vec![reg(RA), imm(*value as u32 as i32)],
                    );
                    self.add(&token, Opcode::Sub, vec![reg(RA), reg(RA), reg(R0)]);
                    let target = self.jump_target(label_index);
                    self.add(&token, Opcode::Jz, vec![reg(RA), target]);
                }
                None => default_label = Some(label_index),
            }
        }
        let fallback = default_label.unwrap_or(end);
        let target = self.jump_target(fallback);
        self.add(&token, Opcode::Jmp, vec![target]);

        self.break_labels.push(end);
        self.case_queues.push(labels.into_iter().collect());
        self.statement(&node.children[1])?;
        self.case_queues.pop();
        self.break_labels.pop();

        self.new_block(end);
        Ok(())
    }

    fn gen_return(&mut self, node: &Node) -> Result<()> {
        let token = node.token.clone();
        if let Some(value) = node.children.first() {
            if self.func.returns_large {
                // Copy into the caller's return slot through the hidden
                // pointer; the pointer is also the return value.
                let size = value.ty.size()?;
                self.expression(value, R0)?;
                self.add(&token, Opcode::Mov, vec![reg(RA), reg(R0)]);
                self.add(&token, Opcode::Ldw, vec![reg(R0), reg(RFP), imm(-4)]);
                self.add(&token, Opcode::Mov, vec![reg(R1), reg(RA)]);
                self.add(&token, Opcode::Imw, vec![reg(R2), imm(size as i32)]);
                let sym = self.ctx.lexer.interner.intern("memcpy");
                self.add(&token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
            } else {
                self.expression(value, R0)?;
            }
        }
        self.add(&token, Opcode::Leave, vec![]);
        self.add(&token, Opcode::Ret, vec![]);
        Ok(())
    }

    /*
     * Local variables
     */

    fn gen_variable(&mut self, node: &Node, symbol: &SymbolRef) -> Result<()> {
        let ty = symbol.borrow().ty.clone();
        if !ty.is_complete() {
            return err(
                ErrorKind::IncompleteType,
                &node.token,
                "Cannot declare a variable of incomplete type.",
            );
        }
        let size = ty.size()?;
        let alignment = ty.alignment()?;
        let offset = self.alloc_local(size.max(1), alignment.max(1));
        symbol.borrow_mut().frame_offset = Some(offset);

        if let Some(init) = node.children.first() {
            self.gen_local_init(&node.token, offset, &ty, init)?;
        }
        Ok(())
    }

    fn zero_region(&mut self, token: &TokenRef, offset: i32, size: u32) {
        if size <= 16 && size % 4 == 0 {
            self.add(token, Opcode::Zero, vec![reg(RA)]);
            for word in 0..size / 4 {
                self.frame_address(token, RB, offset + (word * 4) as i32);
                self.add(token, Opcode::Stw, vec![reg(RA), reg(RB), imm(0)]);
            }
            return;
        }
        self.save_below(token, R0);
        self.frame_address(token, R0, offset);
        self.add(token, Opcode::Zero, vec![reg(R1)]);
        self.add(token, Opcode::Imw, vec![reg(R2), imm(size as i32)]);
        let sym = self.ctx.lexer.interner.intern("memset");
        self.add(token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
        self.restore_below(token, R0);
    }

    fn gen_local_init(
        &mut self,
        token: &TokenRef,
        offset: i32,
        ty: &TypeRef,
        init: &Node,
    ) -> Result<()> {
        match &init.kind {
            NodeKind::Empty => {
                self.zero_region(token, offset, ty.size()?);
                Ok(())
            }
            NodeKind::InitList => match &ty.kind {
                TypeKind::Array { element, count } => {
                    let element = element.clone();
                    let esize = element.size()?;
                    for index in 0..*count {
                        let elem_offset = offset + (index * esize) as i32;
                        match init.children.get(index as usize) {
                            Some(child) => {
                                self.gen_local_init(token, elem_offset, &element, child)?
                            }
                            None => self.zero_region(token, elem_offset, esize),
                        }
                    }
                    Ok(())
                }
                TypeKind::Record(record) => {
                    let record = record.clone();
                    let members: Vec<(TypeRef, u32)> = record
                        .borrow()
                        .members
                        .iter()
                        .map(|m| (m.ty.clone(), m.offset))
                        .collect();
                    for (index, (member_ty, member_offset)) in members.iter().enumerate() {
                        let dest = offset + *member_offset as i32;
                        match init.children.get(index) {
                            Some(child) => self.gen_local_init(token, dest, member_ty, child)?,
                            None => self.zero_region(token, dest, member_ty.size()?),
                        }
                    }
                    Ok(())
                }
                _ => Err(CompileError::internal("Initializer list for a scalar.")),
            },
            NodeKind::StringLit { .. } if ty.is_array() => {
                // Copy the literal (with its terminator) and zero the
                // rest of the array.
                let total = ty.size()?;
                let copy = init.ty.size()?.min(total);
                self.save_below(token, R0);
                self.expression(init, R1)?;
                self.frame_address(token, R0, offset);
                self.add(token, Opcode::Imw, vec![reg(R2), imm(copy as i32)]);
                let sym = self.ctx.lexer.interner.intern("memcpy");
                self.add(token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
                self.restore_below(token, R0);
                if total > copy {
                    self.zero_region(token, offset + copy as i32, total - copy);
                }
                Ok(())
            }
            _ => {
                // A scalar or aggregate expression.
                self.expression(init, R0)?;
                let size = ty.size()?;
                if is_by_address(ty) {
                    if size == 8 && !ty.is_record() {
                        self.frame_address(token, RB, offset);
                        self.add(token, Opcode::Ldw, vec![reg(RA), reg(R0), imm(0)]);
                        self.add(token, Opcode::Stw, vec![reg(RA), reg(RB), imm(0)]);
                        self.add(token, Opcode::Ldw, vec![reg(RA), reg(R0), imm(4)]);
                        self.add(token, Opcode::Stw, vec![reg(RA), reg(RB), imm(4)]);
                    } else {
                        self.save_below(token, R0);
                        self.add(token, Opcode::Mov, vec![reg(R1), reg(R0)]);
                        self.frame_address(token, R0, offset);
                        self.add(token, Opcode::Imw, vec![reg(R2), imm(size as i32)]);
                        let sym = self.ctx.lexer.interner.intern("memcpy");
                        self.add(token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
                        self.restore_below(token, R0);
                    }
                } else {
                    self.frame_address(token, RA, offset);
                    let op = Self::store_op(size)?;
                    self.add(token, op, vec![reg(R0), reg(RA), imm(0)]);
                }
                Ok(())
            }
        }
    }
}

/// Lowers a parsed function into blocks, leaving the frame size in the
/// function for the emitter.
pub fn generate_function(ctx: &mut Compiler, func: &mut Function) -> Result<()> {
    let root = std::mem::replace(
        &mut func.root,
        Node::new(
            NodeKind::Empty,
            func.name.clone(),
            Type::base(crate::types::BaseType::Void),
        ),
    );
    let token = func.name.clone();

    let mut cg = CodeGen {
        ctx,
        func,
        current: 0,
        locals_cursor: 0,
        locals_max: 0,
        break_labels: Vec::new(),
        continue_labels: Vec::new(),
        case_queues: Vec::new(),
    };

    let entry = cg.ctx.alloc_label();
    cg.current = cg.func.add_block(Block::new(BlockLabel::Jump(entry)));

    // Parameter slots in order: the hidden return pointer first when
    // present, then one word per parameter (aggregates hold the address
    // of the caller's storage until copied below).
    let hidden = usize::from(cg.func.returns_large);
    if hidden == 1 {
        cg.alloc_local(4, 4);
    }

    let params: Vec<(Option<SymbolRef>, TypeRef)> = root
        .children
        .iter()
        .filter_map(|child| match &child.kind {
            NodeKind::Parameter(symbol) => Some((symbol.clone(), child.ty.clone())),
            _ => None,
        })
        .collect();

    let mut word_offsets = Vec::with_capacity(params.len());
    for _ in &params {
        word_offsets.push(cg.alloc_local(4, 4));
    }
    if hidden == 1 {
        // frame slot -4 belongs to the hidden pointer
        debug_assert_eq!(word_offsets.first().copied().unwrap_or(-8), -8);
    }

    // Copy incoming arguments into the frame.
    let total = params.len() + hidden;
    for index in 0..total {
        let offset = if index == 0 && hidden == 1 {
            -4
        } else {
            word_offsets[index - hidden]
        };
        if index < 4 {
            cg.add(
                &token,
                Opcode::Stw,
                vec![reg(index as Reg), reg(RFP), imm(offset)],
            );
        } else {
            cg.add(
                &token,
                Opcode::Ldw,
                vec![reg(R9), reg(RFP), imm(((index - 2) * 4) as i32)],
            );
            cg.add(&token, Opcode::Stw, vec![reg(R9), reg(RFP), imm(offset)]);
        }
    }

    // Aggregate and 64-bit parameters arrive as addresses; copy the
    // values into this frame so the function owns its copy.
    for (index, (symbol, ty)) in params.iter().enumerate() {
        let word_offset = word_offsets[index];
        let Some(symbol) = symbol else { continue };
        if !is_by_address(ty) || ty.is_function() {
            symbol.borrow_mut().frame_offset = Some(word_offset);
            continue;
        }
        let size = ty.size()?;
        let slot = cg.alloc_local(size, ty.alignment()?);
        if size == 8 && !ty.is_record() {
            cg.add(&token, Opcode::Ldw, vec![reg(RB), reg(RFP), imm(word_offset)]);
            cg.frame_address(&token, RA, slot);
            cg.add(&token, Opcode::Ldw, vec![reg(R9), reg(RB), imm(0)]);
            cg.add(&token, Opcode::Stw, vec![reg(R9), reg(RA), imm(0)]);
            cg.add(&token, Opcode::Ldw, vec![reg(R9), reg(RB), imm(4)]);
            cg.add(&token, Opcode::Stw, vec![reg(R9), reg(RA), imm(4)]);
        } else {
            cg.frame_address(&token, R0, slot);
            cg.add(&token, Opcode::Ldw, vec![reg(R1), reg(RFP), imm(word_offset)]);
            cg.add(&token, Opcode::Imw, vec![reg(R2), imm(size as i32)]);
            let sym = cg.ctx.lexer.interner.intern("memcpy");
            cg.add(&token, Opcode::Call, vec![label('^', LabelName::Sym(sym))]);
        }
        symbol.borrow_mut().frame_offset = Some(slot);
    }

    if cg.func.ty.variadic {
        cg.func.variadic_offset = ((total.max(4) - 2) * 4) as i32;
    }

    for child in &root.children {
        if matches!(child.kind, NodeKind::Parameter(_)) {
            continue;
        }
        cg.statement(child)?;
    }

    // A function that falls off the end returns zero.
    cg.add(&token, Opcode::Zero, vec![reg(R0)]);
    cg.add(&token, Opcode::Leave, vec![]);
    cg.add(&token, Opcode::Ret, vec![]);

    let frame = round_up(cg.locals_max, 4);
    cg.func.frame_size = frame;
    Ok(())
}

/*
 * Static data
 */

/// Emits the data of a defined file-scope or block-scope static variable.
pub fn generate_static_variable(
    ctx: &mut Compiler,
    symbol: &SymbolRef,
    initializer: Option<&Node>,
) -> Result<()> {
    let (asm_name, ty) = {
        let s = symbol.borrow();
        (s.asm_name.clone(), s.ty.clone())
    };
    if !ty.is_complete() {
        return err(
            ErrorKind::IncompleteType,
            &symbol.borrow().token,
            "Cannot define a variable of incomplete type.",
        );
    }

    ctx.emitter.global_def(&asm_name);
    emit_static_data(ctx, &ty, initializer)?;
    ctx.emitter.newline();
    ctx.emitter.global_divider();
    Ok(())
}

/// Peels conversion wrappers off an initializer expression to reach the
/// underlying constant.
fn unwrap_casts(node: &Node) -> &Node {
    match &node.kind {
        NodeKind::Cast => unwrap_casts(&node.children[0]),
        _ => node,
    }
}

fn emit_static_data(ctx: &mut Compiler, ty: &TypeRef, init: Option<&Node>) -> Result<()> {
    let size = ty.size()?;
    let Some(init) = init else {
        ctx.emitter.zero_fill(size);
        return Ok(());
    };

    if matches!(init.kind, NodeKind::Empty) {
        ctx.emitter.zero_fill(size);
        return Ok(());
    }

    let bare = unwrap_casts(init);

    // A string literal initialises a char array with its bytes or a
    // pointer with its label.
    if let NodeKind::StringLit { label: index, value } = &bare.kind {
        if ty.is_array() {
            let bytes: Vec<u8> = value.bytes().collect();
            let used = (bytes.len() as u32 + 1).min(size);
            ctx.emitter.data_bytes(&bytes[..(used as usize - 1).min(bytes.len())]);
            ctx.emitter.data_byte(0);
            if size > used {
                ctx.emitter.zero_fill(size - used);
            }
            return Ok(());
        }
        if ty.is_pointer() {
            ctx.emitter.data_word_label(&LabelName::Str(*index));
            return Ok(());
        }
    }

    // The address of a global object or function.
    if ty.is_pointer() {
        if let NodeKind::Unary(UnaryOp::AddrOf) = &bare.kind {
            if let NodeKind::Access(symbol) = &bare.children[0].kind {
                let asm_name = symbol.borrow().asm_name.clone();
                ctx.emitter.data_word_label(&LabelName::Sym(asm_name));
                return Ok(());
            }
        }
        if let NodeKind::Access(symbol) = &bare.kind {
            let s = symbol.borrow();
            if s.kind == SymbolKind::Function || s.ty.is_array() {
                let asm_name = s.asm_name.clone();
                drop(s);
                ctx.emitter.data_word_label(&LabelName::Sym(asm_name));
                return Ok(());
            }
        }
    }

    match &init.kind {
        NodeKind::InitList => match &ty.kind {
            TypeKind::Array { element, count } => {
                for index in 0..*count {
                    match init.children.get(index as usize) {
                        Some(child) => emit_static_data(ctx, element, Some(child))?,
                        None => ctx.emitter.zero_fill(element.size()?),
                    }
                }
                Ok(())
            }
            TypeKind::Record(record) => {
                let record = record.clone();
                let is_struct = record.borrow().is_struct;
                let members: Vec<(TypeRef, u32)> = record
                    .borrow()
                    .members
                    .iter()
                    .map(|m| (m.ty.clone(), m.offset))
                    .collect();
                let mut position = 0u32;
                let limit = if is_struct { members.len() } else { 1 };
                for (index, (member_ty, offset)) in members.iter().take(limit).enumerate() {
                    if *offset > position {
                        ctx.emitter.zero_fill(*offset - position);
                    }
                    match init.children.get(index) {
                        Some(child) => emit_static_data(ctx, member_ty, Some(child))?,
                        None => ctx.emitter.zero_fill(member_ty.size()?),
                    }
                    position = *offset + member_ty.size()?;
                }
                if size > position {
                    ctx.emitter.zero_fill(size - position);
                }
                Ok(())
            }
            _ => err(
                ErrorKind::InvalidInitializer,
                &init.token,
                "Initializer list for a scalar.",
            ),
        },
        _ => {
            // A constant scalar.
            let value = init.eval().map_err(|_| {
                CompileError::at(
                    ErrorKind::InvalidInitializer,
                    &init.token,
                    "A static initializer must be a constant expression.",
                )
            })?;
            match size {
                1 => ctx.emitter.data_byte(value as u8),
                2 => ctx.emitter.data_short(value as u16),
                4 => ctx.emitter.data_word(value as u32 as i32),
                8 => {
                    ctx.emitter.data_word(value as u32 as i32);
                    ctx.emitter.data_word((value >> 32) as u32 as i32);
                }
                _ => {
                    return err(
                        ErrorKind::InvalidInitializer,
                        &init.token,
                        "Unsupported static initializer size.",
                    );
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::options::Options;
    use crate::compile_source;

    fn compile(source: &str) -> crate::Result<String> {
        compile_source(source, "test.i", &Options::default())
    }

    #[test]
    fn test_prologue_copies_register_args() {
        let asm = compile("int add(int a, int b) { return a + b; }").unwrap();
        assert!(asm.contains("stw r0 rfp -4"));
        assert!(asm.contains("stw r1 rfp -8"));
    }

    #[test]
    fn test_stack_args_copied_down() {
        let asm = compile(
            "int six(int a, int b, int c, int d, int e, int f) { return f; }\n\
             int main(void) { return six(0, 0, 0, 0, 0, 6) - 6; }",
        )
        .unwrap();
        // The fifth and sixth arguments come from the caller's stack.
        assert!(asm.contains("ldw r9 rfp 8"));
        assert!(asm.contains("ldw r9 rfp 12"));
    }

    #[test]
    fn test_frame_reserved_word_aligned() {
        let asm = compile("int f(void) { char c; c = 1; return c; }").unwrap();
        // One char local still reserves a full word.
        assert!(asm.contains("sub rsp rsp 4"));
    }

    #[test]
    fn test_fallthrough_returns_zero() {
        let asm = compile("int f(void) { }").unwrap();
        let body = asm.split("@_F_f").nth(1).unwrap();
        assert!(body.contains("zero r0"));
        assert!(body.contains("leave"));
        assert!(body.contains("ret"));
    }

    #[test]
    fn test_pointer_scaling_power_of_two() {
        let asm = compile(
            "int a[4]; int main(void) { int* p; p = a; return *(p + 2); }",
        )
        .unwrap();
        // int pointer arithmetic scales by shifting left 2.
        assert!(asm.contains("shl"));
    }

    #[test]
    fn test_pointer_difference_scales_down() {
        let asm = compile(
            "int a[4]; int main(void) { return (int)(&a[3] - &a[0]); }",
        )
        .unwrap();
        assert!(asm.contains("shrs"));
    }

    #[test]
    fn test_short_circuit_branches() {
        let asm = compile(
            "int main(void) { int x; x = 1; return (x == 1 && x != 2) ? 0 : 1; }",
        )
        .unwrap();
        assert!(asm.contains("jz"));
    }

    #[test]
    fn test_goto_label_encoding() {
        let asm = compile(
            "int main(void) { goto done; return 1; done: return 0; }",
        )
        .unwrap();
        assert!(asm.contains(":ULABEL4_main_done"));
        assert!(asm.contains("jmp &ULABEL4_main_done"));
    }

    #[test]
    fn test_switch_compare_chain() {
        let asm = compile(
            "int main(void) { int x; x = 2;\n\
             switch (x) { case 1: return 1; case 2: return 0; default: return 2; } }",
        )
        .unwrap();
        assert!(asm.contains("jz"));
    }

    #[test]
    fn test_llong_arithmetic_calls_runtime() {
        let asm = compile(
            "int main(void) { long long a; long long b; a = 1; b = 2;\n\
             return (int)(a + b) - 3; }",
        )
        .unwrap();
        assert!(asm.contains("call ^__llong_add"));
    }

    #[test]
    fn test_llong_division_signed_and_unsigned() {
        let asm = compile(
            "int main(void) { long long a; unsigned long long b; a = 6; b = 6;\n\
             a = a / 2; b = b / 2; return (int)a - (int)b; }",
        )
        .unwrap();
        assert!(asm.contains("call ^__llong_divs"));
        assert!(asm.contains("call ^__llong_divu"));
    }

    #[test]
    fn test_va_builtins() {
        let asm = compile(
            "typedef char* va_list;\n\
             int sum(int n, ...) {\n\
             va_list ap; int total; int i; total = 0;\n\
             __builtin_va_start(ap, n);\n\
             for (i = 0; i < n; i = i + 1) total = total + __builtin_va_arg(ap, int);\n\
             __builtin_va_end(ap);\n\
             return total; }\n\
             int main(void) { return sum(3, 1, 2, 3) - 6; }",
        );
        assert!(asm.is_ok(), "{:?}", asm.err());
    }

    #[test]
    fn test_static_global_data() {
        let asm = compile("int x = 42; int main(void) { return x - 42; }").unwrap();
        assert!(asm.contains("@x"));
        assert!(asm.contains("42"));
    }

    #[test]
    fn test_string_pointer_global() {
        let asm = compile(
            "const char* greeting = \"hi\"; int main(void) { return 0; }",
        )
        .unwrap();
        assert!(asm.contains("@greeting"));
        assert!(asm.contains(&format!("^{}0", crate::emit::STRING_LABEL_PREFIX)));
    }

    #[test]
    fn test_char_array_global() {
        let asm = compile("char buf[8] = \"hi\"; int main(void) { return 0; }").unwrap();
        assert!(asm.contains("@buf"));
        assert!(asm.contains("\"hi\""));
    }

    #[test]
    fn test_struct_initializer_with_padding() {
        let asm = compile(
            "struct s { char c; int i; };\n\
             struct s v = { 1, 2 };\n\
             int main(void) { return 0; }",
        );
        assert!(asm.is_ok());
    }
}
