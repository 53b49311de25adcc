//! Operator lowering
//!
//! Arithmetic, comparison, assignment and conversion lowering. Word-sized
//! operations map directly to opcodes; `long long` and floating-point
//! operations dispatch to the runtime helpers, with 64-bit operands passed
//! by the address of an 8-byte stack slot and `float` values passed in
//! registers.
//!
//! Ordering comparisons produce -1/0/1 and derive their boolean with a
//! compare-against-constant sequence; equality always compares unsigned.

use crate::block::{imm, label, reg, LabelName, Opcode, Reg, R0, R1, R2, RA, RB};
use crate::errors::{CompileError, Result};
use crate::node::{BinaryOp, Node, UnaryOp};
use crate::generate::{is_by_address, CodeGen};
use crate::token::TokenRef;
use crate::types::{BaseType, TypeKind, TypeRef};

/// Base equivalence classes for conversions. Pointers and arrays convert
/// like unsigned int; enums like int; bool like unsigned char.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CastBase {
    SignedChar,
    UnsignedChar,
    SignedShort,
    UnsignedShort,
    Word,
    Float,
}

fn cast_base(ty: &TypeRef) -> CastBase {
    match &ty.kind {
        TypeKind::Pointer { .. }
        | TypeKind::Array { .. }
        | TypeKind::Indeterminate { .. }
        | TypeKind::Function(_)
        | TypeKind::Enum(_) => CastBase::Word,
        TypeKind::Base(base) => match base {
            BaseType::Char | BaseType::SignedChar => CastBase::SignedChar,
            BaseType::UnsignedChar | BaseType::Bool => CastBase::UnsignedChar,
            BaseType::SignedShort => CastBase::SignedShort,
            BaseType::UnsignedShort => CastBase::UnsignedShort,
            BaseType::Float => CastBase::Float,
            _ => CastBase::Word,
        },
        TypeKind::Record(_) => CastBase::Word,
    }
}

impl CodeGen<'_> {
    /*
     * Binary operations
     */

    pub(crate) fn gen_binary(&mut self, node: &Node, op: BinaryOp, r: Reg) -> Result<()> {
        use BinaryOp::*;
        match op {
            Add => {
                if node.ty.is_pointer() {
                    return self.gen_pointer_add_sub(node, Opcode::Add, r);
                }
                self.gen_simple_arithmetic(node, Opcode::Add, "__llong_add", "__float_add", "__double_add", r)
            }
            Sub => {
                if node.ty.is_pointer() {
                    return self.gen_pointer_add_sub(node, Opcode::Sub, r);
                }
                if node.children[0].ty.is_pointer() {
                    return self.gen_pointers_sub(node, r);
                }
                self.gen_simple_arithmetic(node, Opcode::Sub, "__llong_sub", "__float_sub", "__double_sub", r)
            }
            Mul => self.gen_simple_arithmetic(node, Opcode::Mul, "__llong_mul", "__float_mul", "__double_mul", r),
            Div => {
                if node.ty.is_signed() && node.ty.is_integer() {
                    self.gen_simple_arithmetic(node, Opcode::Divs, "__llong_divs", "", "", r)
                } else {
                    self.gen_simple_arithmetic(node, Opcode::Divu, "__llong_divu", "__float_div", "__double_div", r)
                }
            }
            Mod => {
                if node.ty.is_signed() && node.ty.is_integer() {
                    self.gen_simple_arithmetic(node, Opcode::Mods, "__llong_mods", "", "", r)
                } else {
                    self.gen_simple_arithmetic(node, Opcode::Modu, "__llong_modu", "__float_mod", "__double_mod", r)
                }
            }
            Shl => self.gen_shift(node, Opcode::Shl, "__llong_shl", r),
            Shr => {
                if node.ty.is_signed() {
                    self.gen_shift(node, Opcode::Shrs, "__llong_shrs", r)
                } else {
                    self.gen_shift(node, Opcode::Shru, "__llong_shru", r)
                }
            }
            BitAnd => self.gen_simple_arithmetic(node, Opcode::And, "__llong_and", "", "", r),
            BitOr => self.gen_simple_arithmetic(node, Opcode::Or, "__llong_or", "", "", r),
            BitXor => self.gen_simple_arithmetic(node, Opcode::Xor, "__llong_xor", "", "", r),
            Lt => {
                self.gen_ordering(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(-1)]);
                self.add(&node.token, Opcode::Add, vec![reg(r), reg(r), imm(1)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            Gt => {
                self.gen_ordering(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(1)]);
                self.add(&node.token, Opcode::Add, vec![reg(r), reg(r), imm(1)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            Le => {
                self.gen_ordering(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(1)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            Ge => {
                self.gen_ordering(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(-1)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            Eq => {
                self.gen_equality(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(0)]);
                self.add(&node.token, Opcode::Add, vec![reg(r), reg(r), imm(1)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            Ne => {
                self.gen_equality(node, r)?;
                self.add(&node.token, Opcode::Cmpu, vec![reg(r), reg(r), imm(0)]);
                self.add(&node.token, Opcode::And, vec![reg(r), reg(r), imm(1)]);
                Ok(())
            }
            LogAnd => self.gen_logical_and(node, r),
            LogOr => self.gen_logical_or(node, r),
        }
    }

    /// A binary operation through a 64-bit runtime helper taking
    /// `(dest*, lhs*, rhs*)`. The result register receives the address of
    /// a fresh stack slot.
    fn gen_wide_binary(&mut self, node: &Node, name: &str, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let slot = self.alloc_local(8, 4);
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, Opcode::Mov, vec![reg(RA), reg(lr)]);
        self.add(&token, Opcode::Mov, vec![reg(RB), reg(rr)]);
        self.helper_call(
            &token,
            name,
            lr,
            |cg| {
                cg.frame_address(&token, R0, slot);
                cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RA)]);
                cg.add(&token, Opcode::Mov, vec![reg(R2), reg(RB)]);
            },
            None,
        );
        self.frame_address(&token, lr, slot);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// A comparison helper taking `(lhs*, rhs*)` (or two float values)
    /// and returning its result in r0.
    fn gen_compare_call(&mut self, node: &Node, name: &str, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, Opcode::Mov, vec![reg(RA), reg(lr)]);
        self.add(&token, Opcode::Mov, vec![reg(RB), reg(rr)]);
        self.helper_call(
            &token,
            name,
            lr,
            |cg| {
                cg.add(&token, Opcode::Mov, vec![reg(R0), reg(RA)]);
                cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RB)]);
            },
            Some(lr),
        );
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// A float binary operation: values in registers, result in r0.
    fn gen_float_binary(&mut self, node: &Node, name: &str, r: Reg) -> Result<()> {
        if name.is_empty() {
            return Err(CompileError::internal(
                "No runtime helper for this float operation.",
            ));
        }
        self.gen_compare_call(node, name, r)
    }

    fn gen_simple_arithmetic(
        &mut self,
        node: &Node,
        opcode: Opcode,
        llong_name: &str,
        float_name: &str,
        double_name: &str,
        r: Reg,
    ) -> Result<()> {
        let ty = &node.ty;
        if ty.is_long_long() {
            return self.gen_wide_binary(node, llong_name, r);
        }
        if ty.matches_base(BaseType::Float) {
            return self.gen_float_binary(node, float_name, r);
        }
        if ty.matches_base(BaseType::Double) {
            if double_name.is_empty() {
                return Err(CompileError::internal(
                    "No runtime helper for this double operation.",
                ));
            }
            return self.gen_wide_binary(node, double_name, r);
        }

        let token = node.token.clone();
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, opcode, vec![reg(lr), reg(lr), reg(rr)]);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// Shifts keep the value side in its representation and take the
    /// count as a word.
    fn gen_shift(&mut self, node: &Node, opcode: Opcode, llong_name: &str, r: Reg) -> Result<()> {
        let token = node.token.clone();
        if !node.ty.is_long_long() {
            let (lr, rr, spilled) = self.claim_pair(&token, r);
            self.expression(&node.children[0], lr)?;
            self.expression(&node.children[1], rr)?;
            if node.children[1].ty.size()? > 4 {
                self.add(&token, Opcode::Ldw, vec![reg(rr), reg(rr), imm(0)]);
            }
            self.add(&token, opcode, vec![reg(lr), reg(lr), reg(rr)]);
            self.finish_pair(&token, r, lr, spilled);
            return Ok(());
        }

        let slot = self.alloc_local(8, 4);
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        if node.children[1].ty.size()? > 4 {
            self.add(&token, Opcode::Ldw, vec![reg(rr), reg(rr), imm(0)]);
        }
        self.add(&token, Opcode::Mov, vec![reg(RA), reg(lr)]);
        self.add(&token, Opcode::Mov, vec![reg(RB), reg(rr)]);
        self.helper_call(
            &token,
            llong_name,
            lr,
            |cg| {
                cg.frame_address(&token, R0, slot);
                cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RA)]);
                cg.add(&token, Opcode::Mov, vec![reg(R2), reg(RB)]);
            },
            None,
        );
        self.frame_address(&token, lr, slot);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// Scales the value in a register by the size of a pointed-to type,
    /// shifting when the size is a power of two.
    pub(crate) fn scale_register(
        &mut self,
        token: &TokenRef,
        target: Reg,
        size: u32,
        multiply: bool,
    ) {
        if size <= 1 {
            return;
        }
        if size.is_power_of_two() {
            let shift = size.trailing_zeros() as i32;
            let op = if multiply { Opcode::Shl } else { Opcode::Shrs };
            self.add(token, op, vec![reg(target), reg(target), imm(shift)]);
        } else if size < 0x80 {
            let op = if multiply { Opcode::Mul } else { Opcode::Divs };
            self.add(token, op, vec![reg(target), reg(target), imm(size as i32)]);
        } else {
            let op = if multiply { Opcode::Mul } else { Opcode::Divs };
            self.add(token, Opcode::Imw, vec![reg(RA), imm(size as i32)]);
            self.add(token, op, vec![reg(target), reg(target), reg(RA)]);
        }
    }

    /// Pointer plus or minus an integer: the offset is scaled by the
    /// pointee size. The parser puts the pointer in the first child.
    fn gen_pointer_add_sub(&mut self, node: &Node, opcode: Opcode, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let pointee_size = node
            .ty
            .pointee()
            .ok_or_else(|| CompileError::internal("Pointer arithmetic on a non-pointer."))?
            .size()?;

        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.scale_register(&token, rr, pointee_size, true);
        self.add(&token, opcode, vec![reg(lr), reg(lr), reg(rr)]);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// Pointer difference: subtract, then divide by the pointee size.
    fn gen_pointers_sub(&mut self, node: &Node, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let pointee_size = node.children[0]
            .ty
            .pointee()
            .ok_or_else(|| CompileError::internal("Pointer difference on a non-pointer."))?
            .size()?;

        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, Opcode::Sub, vec![reg(lr), reg(lr), reg(rr)]);
        self.scale_register(&token, lr, pointee_size, false);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// An ordering comparison producing -1/0/1 in the target register.
    fn gen_ordering(&mut self, node: &Node, r: Reg) -> Result<()> {
        let operand_ty = node.children[0].ty.clone();
        if operand_ty.matches_base(BaseType::SignedLongLong) {
            return self.gen_compare_call(node, "__llong_cmps", r);
        }
        if operand_ty.matches_base(BaseType::UnsignedLongLong) {
            return self.gen_compare_call(node, "__llong_cmpu", r);
        }
        if operand_ty.matches_base(BaseType::Float) {
            return self.gen_compare_call(node, "__float_cmp", r);
        }
        if operand_ty.matches_base(BaseType::Double) {
            return self.gen_compare_call(node, "__double_cmp", r);
        }

        // Signed compare only for signed integers; unsigned covers both
        // unsigned integers and pointers.
        let token = node.token.clone();
        let opcode = if operand_ty.is_signed() && operand_ty.is_integer() {
            Opcode::Cmps
        } else {
            Opcode::Cmpu
        };
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, opcode, vec![reg(lr), reg(lr), reg(rr)]);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// Equality pre-step: zero in the target register means equal. The
    /// word-sized path subtracts; wide types use the runtime inequality
    /// helpers.
    fn gen_equality(&mut self, node: &Node, r: Reg) -> Result<()> {
        let operand_ty = node.children[0].ty.clone();
        if operand_ty.is_long_long() {
            return self.gen_compare_call(node, "__llong_neq", r);
        }
        if operand_ty.matches_base(BaseType::Double) {
            return self.gen_compare_call(node, "__double_neq", r);
        }
        if operand_ty.matches_base(BaseType::Float) {
            return self.gen_compare_call(node, "__float_neq", r);
        }

        let token = node.token.clone();
        let (lr, rr, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[0], lr)?;
        self.expression(&node.children[1], rr)?;
        self.add(&token, Opcode::Sub, vec![reg(lr), reg(lr), reg(rr)]);
        self.finish_pair(&token, r, lr, spilled);
        Ok(())
    }

    /// Short-circuit `&&`: a chain of conditional jumps materialising
    /// zero or one.
    fn gen_logical_and(&mut self, node: &Node, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let false_label = self.ctx.alloc_label();
        let end_label = self.ctx.alloc_label();

        self.expression(&node.children[0], r)?;
        let target = label('&', LabelName::Jump(false_label));
        self.add(&token, Opcode::Jz, vec![reg(r), target]);
        self.expression(&node.children[1], r)?;
        self.add(&token, Opcode::Bool, vec![reg(r), reg(r)]);
        let target = label('&', LabelName::Jump(end_label));
        self.add(&token, Opcode::Jmp, vec![target]);
        self.new_block(false_label);
        self.add(&token, Opcode::Zero, vec![reg(r)]);
        self.new_block(end_label);
        Ok(())
    }

    fn gen_logical_or(&mut self, node: &Node, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let true_label = self.ctx.alloc_label();
        let end_label = self.ctx.alloc_label();

        self.expression(&node.children[0], r)?;
        let target = label('&', LabelName::Jump(true_label));
        self.add(&token, Opcode::Jnz, vec![reg(r), target]);
        self.expression(&node.children[1], r)?;
        self.add(&token, Opcode::Bool, vec![reg(r), reg(r)]);
        let target = label('&', LabelName::Jump(end_label));
        self.add(&token, Opcode::Jmp, vec![target]);
        self.new_block(true_label);
        self.add(&token, Opcode::Imw, vec![reg(r), imm(1)]);
        self.new_block(end_label);
        Ok(())
    }

    /*
     * Unary operations
     */

    pub(crate) fn gen_unary(&mut self, node: &Node, op: UnaryOp, r: Reg) -> Result<()> {
        let token = node.token.clone();
        match op {
            UnaryOp::Plus => self.expression(&node.children[0], r),
            UnaryOp::Minus => {
                self.expression(&node.children[0], r)?;
                if node.ty.matches_base(BaseType::Float) {
                    self.add(&token, Opcode::Mov, vec![reg(RB), reg(r)]);
                    self.helper_call(
                        &token,
                        "__float_sub",
                        r,
                        |cg| {
                            cg.add(&token, Opcode::Zero, vec![reg(R0)]);
                            cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RB)]);
                        },
                        Some(r),
                    );
                    return Ok(());
                }
                self.add(&token, Opcode::Sub, vec![reg(r), imm(0), reg(r)]);
                Ok(())
            }
            UnaryOp::BitNot => {
                if node.ty.is_long_long() {
                    let slot = self.alloc_local(8, 4);
                    self.expression(&node.children[0], r)?;
                    self.add(&token, Opcode::Mov, vec![reg(RA), reg(r)]);
                    self.helper_call(
                        &token,
                        "__llong_bit_not",
                        r,
                        |cg| {
                            cg.frame_address(&token, R0, slot);
                            cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RA)]);
                        },
                        None,
                    );
                    self.frame_address(&token, r, slot);
                    return Ok(());
                }
                self.expression(&node.children[0], r)?;
                self.add(&token, Opcode::Not, vec![reg(r), reg(r)]);
                Ok(())
            }
            UnaryOp::LogNot => {
                self.expression(&node.children[0], r)?;
                self.add(&token, Opcode::Isz, vec![reg(r), reg(r)]);
                Ok(())
            }
            UnaryOp::Deref => {
                self.expression(&node.children[0], r)?;
                if !is_by_address(&node.ty) {
                    self.load_scalar(&token, r, &node.ty)?;
                }
                Ok(())
            }
            UnaryOp::AddrOf => self.location(&node.children[0], r),
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                self.gen_inc_dec(node, op, r)
            }
        }
    }

    /// Increment and decrement load through the location, adjust by the
    /// arithmetic factor (the pointee size for pointers) and store back.
    fn gen_inc_dec(&mut self, node: &Node, op: UnaryOp, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let child = &node.children[0];
        let size = child.ty.size()?;
        let delta = match child.ty.pointee() {
            Some(pointee) => pointee.size()?,
            None => 1,
        };
        let is_post = matches!(op, UnaryOp::PostInc | UnaryOp::PostDec);
        let is_inc = matches!(op, UnaryOp::PreInc | UnaryOp::PostInc);
        let opcode = if is_inc { Opcode::Add } else { Opcode::Sub };

        self.location(child, r)?;
        let load = match size {
            1 => Opcode::Ldb,
            2 => Opcode::Lds,
            _ => Opcode::Ldw,
        };
        self.add(&token, load, vec![reg(RA), reg(r), imm(0)]);
        if is_post {
            self.add(&token, Opcode::Mov, vec![reg(RB), reg(RA)]);
        }

        if delta < 0x80 {
            self.add(&token, opcode, vec![reg(RA), reg(RA), imm(delta as i32)]);
        } else if is_post {
            self.add(&token, Opcode::Push, vec![reg(RB)]);
            self.add(&token, Opcode::Imw, vec![reg(RB), imm(delta as i32)]);
            self.add(&token, opcode, vec![reg(RA), reg(RA), reg(RB)]);
            self.add(&token, Opcode::Pop, vec![reg(RB)]);
        } else {
            self.add(&token, Opcode::Imw, vec![reg(RB), imm(delta as i32)]);
            self.add(&token, opcode, vec![reg(RA), reg(RA), reg(RB)]);
        }

        let store = Self::store_op(size)?;
        self.add(&token, store, vec![reg(RA), reg(r), imm(0)]);
        let result = if is_post { RB } else { RA };
        self.add(&token, Opcode::Mov, vec![reg(r), reg(result)]);
        Ok(())
    }

    /*
     * Assignment
     */

    pub(crate) fn gen_assign(
        &mut self,
        node: &Node,
        op: Option<BinaryOp>,
        r: Reg,
    ) -> Result<()> {
        match op {
            None => self.gen_simple_assign(node, r),
            Some(op) => self.gen_compound_assign(node, op, r),
        }
    }

    /// The value lands in the target register, the location one above,
    /// then a size-selected store writes through. Wide values copy word
    /// pairs; records copy through memcpy.
    fn gen_simple_assign(&mut self, node: &Node, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let size = node.ty.size()?;

        let (vr, ar, spilled) = self.claim_pair(&token, r);
        self.expression(&node.children[1], vr)?;
        self.location(&node.children[0], ar)?;

        let result = if size <= 4 && !node.ty.is_record() {
            let store = Self::store_op(size)?;
            self.add(&token, store, vec![reg(vr), reg(ar), imm(0)]);
            vr
        } else if size == 8 && !node.ty.is_record() {
            self.add(&token, Opcode::Ldw, vec![reg(RA), reg(vr), imm(0)]);
            self.add(&token, Opcode::Stw, vec![reg(RA), reg(ar), imm(0)]);
            self.add(&token, Opcode::Ldw, vec![reg(RA), reg(vr), imm(4)]);
            self.add(&token, Opcode::Stw, vec![reg(RA), reg(ar), imm(4)]);
            ar
        } else {
            self.add(&token, Opcode::Mov, vec![reg(RA), reg(vr)]);
            self.add(&token, Opcode::Mov, vec![reg(RB), reg(ar)]);
            self.helper_call(
                &token,
                "memcpy",
                vr,
                |cg| {
                    cg.add(&token, Opcode::Mov, vec![reg(R0), reg(RB)]);
                    cg.add(&token, Opcode::Mov, vec![reg(R1), reg(RA)]);
                    cg.add(&token, Opcode::Imw, vec![reg(R2), imm(size as i32)]);
                },
                Some(vr),
            );
            vr
        };

        self.finish_pair(&token, r, result, spilled);
        Ok(())
    }

    /// Compound assignment on word-sized values: evaluate the right side,
    /// compute the location once, load-modify-store.
    fn gen_compound_assign(&mut self, node: &Node, op: BinaryOp, r: Reg) -> Result<()> {
        let token = node.token.clone();
        let lhs = &node.children[0];
        let size = lhs.ty.size()?;

        self.expression(&node.children[1], r)?;
        self.add(&token, Opcode::Push, vec![reg(r)]);
        self.location(lhs, r)?;

        let load = match size {
            1 => Opcode::Ldb,
            2 => Opcode::Lds,
            _ => Opcode::Ldw,
        };
        self.add(&token, load, vec![reg(RA), reg(r), imm(0)]);
        // Narrow signed values extend before the arithmetic; the store
        // truncates on the way back.
        if size < 4 && lhs.ty.is_signed() {
            let extend = if size == 1 { Opcode::Sxb } else { Opcode::Sxs };
            self.add(&token, extend, vec![reg(RA), reg(RA)]);
        }
        self.add(&token, Opcode::Pop, vec![reg(RB)]);

        if lhs.ty.is_pointer() {
            let pointee_size = lhs
                .ty
                .pointee()
                .ok_or_else(|| CompileError::internal("Pointer compound assign."))?
                .size()?;
            self.scale_register(&token, RB, pointee_size, true);
        }

        let signed = lhs.ty.is_signed();
        let opcode = match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => {
                if signed {
                    Opcode::Divs
                } else {
                    Opcode::Divu
                }
            }
            BinaryOp::Mod => {
                if signed {
                    Opcode::Mods
                } else {
                    Opcode::Modu
                }
            }
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => {
                if signed {
                    Opcode::Shrs
                } else {
                    Opcode::Shru
                }
            }
            BinaryOp::BitAnd => Opcode::And,
            BinaryOp::BitOr => Opcode::Or,
            BinaryOp::BitXor => Opcode::Xor,
            _ => return Err(CompileError::internal("Invalid compound assignment.")),
        };
        self.add(&token, opcode, vec![reg(RA), reg(RA), reg(RB)]);

        let store = Self::store_op(size)?;
        self.add(&token, store, vec![reg(RA), reg(r), imm(0)]);
        self.add(&token, Opcode::Mov, vec![reg(r), reg(RA)]);
        Ok(())
    }

    /*
     * Conversions
     */

    /// Emits the instructions converting the value in `r` from one type
    /// to another. Wide values are addresses; conversions through them
    /// load or allocate storage as needed.
    pub(crate) fn gen_cast(
        &mut self,
        token: &TokenRef,
        from: &TypeRef,
        to: &TypeRef,
        r: Reg,
    ) -> Result<()> {
        if to.is_void() {
            return Ok(());
        }

        // Only long long and double have a wide value representation;
        // arrays and functions are address-valued and their decay to a
        // pointer emits nothing.
        let value_wide =
            |t: &TypeRef| t.is_long_long() || t.matches_base(BaseType::Double);
        let from_wide = value_wide(from);
        let to_wide = value_wide(to);

        if from_wide && to_wide {
            // Same representation; sign reinterpretation has no code.
            return Ok(());
        }

        if from_wide {
            if to.is_bool() {
                self.add(token, Opcode::Ldw, vec![reg(RA), reg(r), imm(0)]);
                self.add(token, Opcode::Ldw, vec![reg(RB), reg(r), imm(4)]);
                self.add(token, Opcode::Or, vec![reg(r), reg(RA), reg(RB)]);
                self.add(token, Opcode::Bool, vec![reg(r), reg(r)]);
                return Ok(());
            }
            // Truncation keeps the low word, then narrows further if the
            // target is smaller than a word.
            self.add(token, Opcode::Ldw, vec![reg(r), reg(r), imm(0)]);
            let word = crate::types::Type::base(BaseType::SignedInt);
            return self.gen_word_cast(token, &word, to, r);
        }

        if to_wide {
            // Widen to int first, then build the 8-byte slot with a sign
            // or zero extended high word.
            let word = crate::types::Type::base(if from.is_signed() {
                BaseType::SignedInt
            } else {
                BaseType::UnsignedInt
            });
            self.gen_word_cast(token, from, &word, r)?;
            let slot = self.alloc_local(8, 4);
            self.frame_address(token, RA, slot);
            self.add(token, Opcode::Stw, vec![reg(r), reg(RA), imm(0)]);
            if from.is_signed() {
                self.add(token, Opcode::Mov, vec![reg(RB), reg(r)]);
                self.add(token, Opcode::Shrs, vec![reg(RB), reg(RB), imm(31)]);
            } else {
                self.add(token, Opcode::Zero, vec![reg(RB)]);
            }
            self.add(token, Opcode::Stw, vec![reg(RB), reg(RA), imm(4)]);
            self.add(token, Opcode::Mov, vec![reg(r), reg(RA)]);
            return Ok(());
        }

        self.gen_word_cast(token, from, to, r)
    }

    /// Word-to-word conversions: the sign extension and truncation ladder
    /// between the character, short and word classes.
    fn gen_word_cast(&mut self, token: &TokenRef, from: &TypeRef, to: &TypeRef, r: Reg) -> Result<()> {
        if to.is_bool() {
            self.add(token, Opcode::Bool, vec![reg(r), reg(r)]);
            return Ok(());
        }

        let fb = cast_base(from);
        let tb = cast_base(to);
        if fb == tb {
            return Ok(());
        }

        let mut emit = |cg: &mut Self, op: Opcode| {
            cg.add(token, op, vec![reg(r), reg(r)]);
        };

        match tb {
            CastBase::SignedChar => emit(self, Opcode::Sxb),
            CastBase::UnsignedChar => emit(self, Opcode::Trb),
            CastBase::SignedShort => match fb {
                CastBase::SignedChar => emit(self, Opcode::Sxb),
                CastBase::UnsignedChar => {}
                _ => emit(self, Opcode::Sxs),
            },
            CastBase::UnsignedShort => match fb {
                CastBase::SignedChar => {
                    emit(self, Opcode::Sxb);
                    emit(self, Opcode::Trs);
                }
                CastBase::UnsignedChar | CastBase::UnsignedShort => {}
                _ => emit(self, Opcode::Trs),
            },
            CastBase::Word | CastBase::Float => match fb {
                CastBase::SignedChar => emit(self, Opcode::Sxb),
                CastBase::SignedShort => emit(self, Opcode::Sxs),
                _ => {}
            },
        }
        Ok(())
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
    fn test_signed_char_cast_sign_extends() {
        let asm = compile(
            "int main(void) { return ((signed char)0x123 != 0x23) ? 1 : 0; }",
        )
        .unwrap();
        assert!(asm.contains("sxb"));
    }

    #[test]
    fn test_unsigned_char_cast_truncates() {
        let asm = compile("int main(void) { return (unsigned char)0x1FF; }").unwrap();
        assert!(asm.contains("trb"));
    }

    #[test]
    fn test_schar_to_ushort_double_conversion() {
        let asm = compile(
            "int main(void) { signed char c; c = -1; return (unsigned short)c == 0xFFFF ? 0 : 1; }",
        )
        .unwrap();
        // signed char to unsigned short requires sxb then trs
        assert!(asm.contains("sxb"));
        assert!(asm.contains("trs"));
    }

    #[test]
    fn test_equality_compares_unsigned() {
        let asm = compile("int main(void) { int a; a = 1; return a == 1 ? 0 : 1; }").unwrap();
        assert!(asm.contains("cmpu"));
        assert!(!asm.contains("cmps"));
    }

    #[test]
    fn test_signed_ordering_compares_signed() {
        let asm = compile("int main(void) { int a; a = 1; return a < 2 ? 0 : 1; }").unwrap();
        assert!(asm.contains("cmps"));
    }

    #[test]
    fn test_unsigned_ordering_compares_unsigned() {
        let asm =
            compile("int main(void) { unsigned a; a = 1; return a < 2u ? 0 : 1; }").unwrap();
        assert!(asm.contains("cmpu"));
    }

    #[test]
    fn test_division_selects_signedness() {
        let asm = compile(
            "int main(void) { int a; unsigned b; a = 6; b = 6;\n\
             return (a / 2) - (int)(b / 3u) - 1; }",
        )
        .unwrap();
        assert!(asm.contains("divs"));
        assert!(asm.contains("divu"));
    }

    #[test]
    fn test_shift_right_selects_signedness() {
        let asm = compile(
            "int main(void) { int a; unsigned b; a = -8; b = 8;\n\
             return (a >> 1) + (int)(b >> 1); }",
        )
        .unwrap();
        assert!(asm.contains("shrs"));
        assert!(asm.contains("shru"));
    }

    #[test]
    fn test_boolean_not_uses_isz() {
        let asm = compile("int main(void) { return !!1 - 1; }").unwrap();
        assert!(asm.contains("isz"));
    }

    #[test]
    fn test_compound_assign_loads_once() {
        let asm = compile("int main(void) { int x; x = 4; x += 3; return x - 7; }").unwrap();
        assert!(asm.contains("add"));
    }

    #[test]
    fn test_pointer_compound_assign_scales() {
        let asm = compile(
            "int a[4]; int main(void) { int* p; p = a; p += 2; return (int)(p - a) - 2; }",
        )
        .unwrap();
        assert!(asm.contains("shl"));
    }

    #[test]
    fn test_inc_dec_pointer_steps_by_size() {
        let asm = compile(
            "int a[2]; int main(void) { int* p; p = a; ++p; return (int)(p - a) - 1; }",
        )
        .unwrap();
        // int pointer increments by 4
        assert!(asm.contains("add ra ra 4"));
    }
}
