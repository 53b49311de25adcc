//! Assembly emitter
//!
//! Serialises instructions and data as OVM assembly text. The emitter is a
//! small state machine: it tracks whether it is at the start of a line (so
//! mnemonics get their indent exactly once) and the last source location it
//! reported (so it can emit `#line` directives only on change, with a lone
//! `#` for a single-line advance).
//!
//! Label prefixes: `^` references an external symbol, `&` references a
//! block-local jump label, `:` defines a label, `@` defines a global.

use std::rc::Rc;

use crate::block::{Block, BlockLabel, Instruction, LabelName, Opcode, Operand, Reg};
use crate::function::Function;
use crate::token::Token;

pub const STRING_LABEL_PREFIX: &str = "SLABEL";
pub const JUMP_LABEL_PREFIX: &str = "JLABEL";
pub const MISC_LABEL_PREFIX: &str = "MLABEL";
pub const USER_LABEL_PREFIX: &str = "ULABEL";
pub const FUNCTION_BODY_PREFIX: &str = "_F_";

fn is_plain_string_byte(byte: u8) -> bool {
    // Backslash and double quote are invalid inside an assembly string;
    // everything else printable passes through.
    byte != b'\\' && byte != b'"' && (0x20..0x7f).contains(&byte)
}

pub struct Emitter {
    out: String,
    first_term: bool,
    line: u32,
    filename: Option<Rc<str>>,
}

impl Emitter {
    pub fn new() -> Self {
        let mut emitter = Emitter {
            out: String::new(),
            first_term: true,
            line: 0,
            filename: None,
        };
        // Manual line control: we emit an increment directive for each
        // source line we pass.
        emitter.raw("#line manual\n");
        emitter
    }

    fn raw(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn ch(&mut self, c: char) {
        self.out.push(c);
    }

    pub fn newline(&mut self) {
        self.ch('\n');
        self.first_term = true;
    }

    fn line_start(&mut self) {
        if !self.first_term {
            self.newline();
        }
    }

    pub fn term(&mut self, keyword: &str) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        self.raw(keyword);
        self.ch(' ');
    }

    pub fn register(&mut self, index: Reg) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        match index {
            0..=9 => {
                self.ch('r');
                self.ch((b'0' + index) as char);
            }
            10 => self.raw("ra"),
            11 => self.raw("rb"),
            12 => self.raw("rsp"),
            13 => self.raw("rfp"),
            14 => self.raw("rpp"),
            _ => self.raw("rip"),
        }
        self.ch(' ');
    }

    fn hex_char(value: u32) -> char {
        debug_assert!(value < 16);
        if value <= 9 {
            (b'0' + value as u8) as char
        } else {
            (b'A' + (value - 10) as u8) as char
        }
    }

    /// Hexadecimal with no leading zeros.
    pub fn hex_number(&mut self, number: u32) {
        let mut started = false;
        for shift in (0..8).rev() {
            let nibble = (number >> (shift * 4)) & 0xf;
            if nibble != 0 || started || shift == 0 {
                started = true;
                self.ch(Self::hex_char(nibble));
            }
        }
    }

    /// Small values in decimal for readability, everything else as hex.
    pub fn int(&mut self, value: i32) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        if value > -100_000_000 && value < 1_000_000 {
            self.raw(&value.to_string());
        } else {
            self.raw("0x");
            self.hex_number(value as u32);
        }
        self.ch(' ');
    }

    fn render_label(&mut self, name: &LabelName) {
        match name {
            LabelName::Jump(index) => {
                self.raw(JUMP_LABEL_PREFIX);
                self.hex_number(*index);
            }
            LabelName::Str(index) => {
                self.raw(STRING_LABEL_PREFIX);
                self.hex_number(*index);
            }
            LabelName::Body(name) => {
                self.raw(FUNCTION_BODY_PREFIX);
                let name = name.clone();
                self.raw(&name);
            }
            LabelName::Sym(name) => {
                let name = name.clone();
                self.raw(&name);
            }
            LabelName::User { func, name } => {
                let (func, name) = (func.clone(), name.clone());
                self.raw(USER_LABEL_PREFIX);
                self.hex_number(func.len() as u32);
                self.ch('_');
                self.raw(&func);
                self.ch('_');
                self.raw(&name);
            }
        }
    }

    /// A label definition or reference followed by a space, as a term.
    pub fn label(&mut self, prefix: char, name: &LabelName) {
        if self.first_term {
            if prefix == '^' || prefix == '&' {
                self.raw("  ");
            }
            self.first_term = false;
        }
        self.ch(prefix);
        self.render_label(name);
        self.ch(' ');
    }

    pub fn quoted_byte(&mut self, byte: u8) {
        self.ch('\'');
        self.ch(Self::hex_char(u32::from(byte >> 4)));
        self.ch(Self::hex_char(u32::from(byte & 0xf)));
    }

    /// Bytes as a string run, escaping anything the assembly string syntax
    /// cannot carry.
    pub fn string_literal(&mut self, bytes: &[u8]) {
        let mut open = false;
        for &byte in bytes {
            let plain = is_plain_string_byte(byte);
            if plain != open {
                self.ch('"');
                open = !open;
            }
            if plain {
                self.ch(byte as char);
            } else {
                self.quoted_byte(byte);
            }
        }
        if open {
            self.ch('"');
        }
    }

    pub fn character_literal(&mut self, byte: u8) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        if is_plain_string_byte(byte) {
            self.ch('"');
            self.ch(byte as char);
            self.ch('"');
        } else {
            self.quoted_byte(byte);
        }
        self.ch(' ');
    }

    /// Brings the reported source location up to the token's. A one to
    /// four line advance in the same file is reported with lone `#`
    /// increment directives, anything else with a full `#line`.
    pub fn sync_source(&mut self, token: &Token) {
        let same_file = self
            .filename
            .as_ref()
            .is_some_and(|f| Rc::ptr_eq(f, &token.filename) || **f == *token.filename);
        if same_file && token.line == self.line {
            return;
        }

        self.line_start();
        if same_file && token.line > self.line && token.line - self.line <= 4 {
            for _ in 0..(token.line - self.line) {
                self.raw("#\n");
            }
        } else {
            self.raw("#line ");
            self.raw(&token.line.to_string());
            self.raw(" \"");
            let name = token.filename.clone();
            self.raw(&name);
            self.raw("\"\n");
        }
        self.line = token.line;
        self.filename = Some(token.filename.clone());
    }

    pub fn global_divider(&mut self) {
        self.newline();
        self.newline();
        self.newline();
    }

    fn instruction(&mut self, insn: &Instruction) {
        self.sync_source(&insn.token);
        self.term(insn.op.mnemonic());
        for operand in &insn.operands {
            match operand {
                Operand::Reg(r) => self.register(*r),
                Operand::Imm(v) => self.int(*v),
                Operand::Label { prefix, name } => {
                    let name = name.clone();
                    self.label(*prefix, &name);
                }
            }
        }
        self.newline();
    }

    fn block_label(&mut self, label: &BlockLabel) {
        self.line_start();
        match label {
            BlockLabel::Jump(index) => self.label(':', &LabelName::Jump(*index)),
            BlockLabel::User { func, name } => self.label(
                ':',
                &LabelName::User {
                    func: func.clone(),
                    name: name.clone(),
                },
            ),
        }
        self.newline();
    }

    /// Writes a complete function: the body label, each block with its
    /// jump label, then the public entry that sets up the frame and jumps
    /// to the body.
    pub fn function(&mut self, function: &Function) {
        self.sync_source(&function.name);
        self.line_start();
        self.label('@', &LabelName::Body(function.asm_name.clone()));
        self.newline();

        for block in &function.blocks {
            self.block_label(&block.label);
            for insn in &block.instructions {
                self.instruction(insn);
            }
        }

        self.newline();
        self.label('@', &LabelName::Sym(function.asm_name.clone()));
        self.newline();
        self.term("enter");
        self.newline();

        let frame = function.frame_size;
        if frame > 0 {
            if frame < 0x80 {
                self.term("sub");
                self.term("rsp");
                self.term("rsp");
                self.int(frame as i32);
                self.newline();
            } else {
                self.term("imw");
                self.register(crate::block::R9);
                self.int(frame as i32);
                self.newline();
                self.term("sub");
                self.term("rsp");
                self.term("rsp");
                self.register(crate::block::R9);
                self.newline();
            }
        }

        self.term("jmp");
        self.label('^', &LabelName::Body(function.asm_name.clone()));
        self.newline();
        self.global_divider();
    }

    /*
     * String literal definitions. These are written on the fly as string
     * tokens are parsed; adjacent literals continue under the same label.
     */

    pub fn string_def_begin(&mut self, label: u32) {
        self.line_start();
        self.label('@', &LabelName::Str(label));
        self.newline();
    }

    pub fn string_def_part(&mut self, bytes: &[u8]) {
        self.raw("  ");
        self.first_term = false;
        self.string_literal(bytes);
        self.newline();
    }

    pub fn string_def_end(&mut self) {
        self.raw("  ");
        self.first_term = false;
        self.quoted_byte(0);
        self.newline();
        self.newline();
    }

    /*
     * Global variable data.
     */

    pub fn global_def(&mut self, name: &Rc<str>) {
        self.line_start();
        self.label('@', &LabelName::Sym(name.clone()));
        self.newline();
    }

    pub fn data_word(&mut self, value: i32) {
        self.int(value);
    }

    pub fn data_word_label(&mut self, name: &LabelName) {
        let name = name.clone();
        self.label('^', &name);
    }

    pub fn data_short(&mut self, value: u16) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        self.quoted_byte((value & 0xff) as u8);
        self.quoted_byte((value >> 8) as u8);
        self.ch(' ');
    }

    pub fn data_byte(&mut self, value: u8) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        self.quoted_byte(value);
        self.ch(' ');
    }

    pub fn data_bytes(&mut self, bytes: &[u8]) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        self.string_literal(bytes);
        self.ch(' ');
    }

    /// Zero bytes in groups of four, sixteen to a line.
    pub fn zero_fill(&mut self, size: u32) {
        if self.first_term {
            self.raw("  ");
            self.first_term = false;
        }
        for i in 0..size {
            if i > 0 {
                if i % 16 == 0 {
                    self.newline();
                    self.raw("  ");
                    self.first_term = false;
                } else if i % 4 == 0 {
                    self.ch(' ');
                }
            }
            self.quoted_byte(0);
        }
        self.ch(' ');
    }

    pub fn finish(mut self) -> String {
        self.newline();
        self.out
    }

    #[cfg(test)]
    fn contents(&self) -> &str {
        &self.out
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Emitter::new()
    }
}

/// True if the instruction stream needs a `#line manual` aware assembler;
/// used by tests to confirm the header is present.
pub fn has_manual_line_header(asm: &str) -> bool {
    asm.starts_with("#line manual\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{R0, R9, RSP};

    fn fresh() -> Emitter {
        Emitter::new()
    }

    #[test]
    fn test_header() {
        let e = fresh();
        assert!(has_manual_line_header(e.contents()));
    }

    #[test]
    fn test_registers() {
        let mut e = fresh();
        e.register(R0);
        e.register(R9);
        e.register(RA);
        e.register(11);
        e.register(RSP);
        e.register(13);
        e.register(14);
        e.register(15);
        assert!(e.contents().ends_with("r0 r9 ra rb rsp rfp rpp rip "));
    }

    use crate::block::RA;

    #[test]
    fn test_int_decimal_and_hex() {
        let mut e = fresh();
        e.int(42);
        e.int(-7);
        e.int(999_999);
        assert!(e.contents().ends_with("42 -7 999999 "));

        let mut e = fresh();
        e.int(1_000_000);
        assert!(e.contents().ends_with("0xF4240 "));

        let mut e = fresh();
        e.int(-100_000_001);
        assert!(e.contents().ends_with("0xFA0A1EFF "));
    }

    #[test]
    fn test_hex_no_leading_zeros() {
        let mut e = fresh();
        e.hex_number(0x1f);
        assert!(e.contents().ends_with("1F"));
        let mut e = fresh();
        e.hex_number(0);
        assert!(e.contents().ends_with("\n0"));
    }

    #[test]
    fn test_string_literal_runs() {
        let mut e = fresh();
        e.string_literal(b"ab\"c\n");
        assert!(e.contents().ends_with("\"ab\"'22\"c\"'0A"));
    }

    #[test]
    fn test_quoted_byte() {
        let mut e = fresh();
        e.quoted_byte(0);
        assert!(e.contents().ends_with("'00"));
        let mut e = fresh();
        e.quoted_byte(0xab);
        assert!(e.contents().ends_with("'AB"));
    }

    #[test]
    fn test_term_indent() {
        let mut e = fresh();
        e.term("add");
        e.register(R0);
        e.newline();
        assert!(e.contents().ends_with("  add r0 \n"));
    }

    #[test]
    fn test_user_label_encoding() {
        let mut e = fresh();
        e.newline();
        e.label(
            ':',
            &LabelName::User {
                func: Rc::from("main"),
                name: Rc::from("done"),
            },
        );
        assert!(e.contents().ends_with(":ULABEL4_main_done "));
    }

    #[test]
    fn test_sync_source_increments() {
        use crate::token::{Token, TokenKind};
        let mut e = fresh();
        let t1 = Token::new(TokenKind::Number, Rc::from("1"), Rc::from("a.c"), 10);
        e.sync_source(&t1);
        assert!(e.contents().ends_with("#line 10 \"a.c\"\n"));

        let t2 = Token::new(TokenKind::Number, Rc::from("1"), Rc::from("a.c"), 11);
        e.sync_source(&t2);
        assert!(e.contents().ends_with("#line 10 \"a.c\"\n#\n"));

        // Same line emits nothing.
        let before = e.contents().len();
        e.sync_source(&t2);
        assert_eq!(e.contents().len(), before);

        // A long jump gets a full directive.
        let t3 = Token::new(TokenKind::Number, Rc::from("1"), Rc::from("a.c"), 100);
        e.sync_source(&t3);
        assert!(e.contents().ends_with("#line 100 \"a.c\"\n"));
    }
}
