//! OVM C Compiler Library
//!
//! Compiles preprocessed C translation units (`.i` files with `#line`
//! directives) to textual OVM assembly. The pipeline is a single forward
//! pass: the lexer feeds the parser, the parser drives code generation one
//! function at a time, and the emitter serialises instructions as they are
//! produced. There is no whole-program IR; a function's tree lives only
//! until its assembly has been written.
//!
//! The compiler state that the original design kept in globals lives in a
//! single [`Compiler`] value threaded through every parse and generate
//! function.

pub mod block;
pub mod emit;
pub mod errors;
pub mod function;
pub mod generate;
pub mod generate_ops;
pub mod lexer;
pub mod node;
pub mod optimize_asm;
pub mod optimize_tree;
pub mod options;
pub mod parse_decl;
pub mod parse_expr;
pub mod parse_init;
pub mod parse_stmt;
pub mod record;
pub mod scope;
pub mod strings;
pub mod symbol;
pub mod token;
pub mod types;

pub use errors::{CompileError, ErrorKind, Result};
pub use options::{Options, Warning, WarningConfig};

use std::fs;
use std::path::Path;
use std::rc::Rc;

use emit::Emitter;
use lexer::Lexer;
use options::Options as CompilerOptions;
use scope::ScopeStack;
use symbol::{SymbolKind, SymbolRef};
use token::Token;

/// All compiler state for one translation unit.
pub struct Compiler {
    pub lexer: Lexer,
    pub scopes: ScopeStack,
    pub options: CompilerOptions,
    pub emitter: Emitter,

    /// Next block-local jump label index.
    pub next_label: u32,
    /// Next string literal label index.
    pub next_string: u32,

    /// Name of the function currently being parsed, for `__func__` and
    /// user `goto` labels.
    pub current_function_name: Option<Rc<str>>,

    /// Return type of the function currently being parsed; `return`
    /// statements convert their value to it.
    pub current_return_type: Option<types::TypeRef>,

    /// Promoted controlling types of the enclosing `switch` statements,
    /// innermost last. Case constants convert to the top entry.
    pub switch_types: Vec<types::TypeRef>,

    /// File-scope variables that may still be tentative at end of unit,
    /// in declaration order.
    pub pending_globals: Vec<SymbolRef>,
}

impl Compiler {
    pub fn new(source: Vec<u8>, filename: &str, options: CompilerOptions) -> Result<Self> {
        Ok(Compiler {
            lexer: Lexer::new(source, filename)?,
            scopes: ScopeStack::new(),
            options,
            emitter: Emitter::new(),
            next_label: 0,
            next_string: 0,
            current_function_name: None,
            current_return_type: None,
            switch_types: Vec::new(),
            pending_globals: Vec::new(),
        })
    }

    pub fn alloc_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    pub fn alloc_string(&mut self) -> u32 {
        let label = self.next_string;
        self.next_string += 1;
        label
    }

    /// Reports a warning, or fails if the configuration elevates it.
    pub fn warn(&mut self, warning: Warning, token: &Token, message: &str) -> Result<()> {
        if !self.options.warnings.is_enabled(warning) {
            return Ok(());
        }
        if self.options.warnings.is_error(warning) {
            return Err(CompileError::at(
                ErrorKind::ElevatedWarning,
                token,
                format!("{} [-W{}]", message, warning.id()),
            ));
        }
        eprintln!(
            "{}:{}: warning: {} [-W{}]",
            token.filename, token.line, message, warning.id()
        );
        Ok(())
    }

    /// Parses and compiles the whole translation unit.
    pub fn run(&mut self) -> Result<()> {
        while self.lexer.token.kind != token::TokenKind::End {
            self.parse_global()?;
        }
        self.emit_tentative_definitions()?;
        Ok(())
    }

    /// File-scope variables that reached the end of the unit still
    /// tentative become zero-initialised definitions.
    fn emit_tentative_definitions(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_globals);
        for symbol in pending {
            let emit = {
                let s = symbol.borrow();
                let current = self.scopes.find_symbol_global(&s.name);
                s.kind == SymbolKind::Variable
                    && s.is_tentative
                    && !s.is_defined
                    && !s.is_hidden
                    && s.linkage != symbol::Linkage::None
                    && current.is_some_and(|c| Rc::ptr_eq(&c, &symbol))
            };
            if emit {
                symbol.borrow_mut().is_defined = true;
                generate::generate_static_variable(self, &symbol, None)?;
            }
        }
        Ok(())
    }
}

/// Compiles a source string, returning the generated assembly text.
pub fn compile_source(source: &str, filename: &str, options: &Options) -> Result<String> {
    let mut compiler = Compiler::new(source.as_bytes().to_vec(), filename, options.clone())?;
    compiler.run()?;
    Ok(compiler.emitter.finish())
}

/// Compiles a preprocessed input file to an output assembly file.
pub fn compile_file(input: &Path, output: &Path, options: &Options) -> Result<()> {
    let source = fs::read(input).map_err(|e| {
        CompileError::new(
            ErrorKind::Io,
            format!("Failed to open input file {}: {}", input.display(), e),
        )
    })?;
    let filename = input.to_string_lossy();
    let mut compiler = Compiler::new(source, &filename, options.clone())?;
    compiler.run()?;
    let asm = compiler.emitter.finish();
    fs::write(output, asm).map_err(|e| {
        CompileError::new(
            ErrorKind::Io,
            format!("Failed to write output file {}: {}", output.display(), e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<String> {
        compile_source(source, "test.i", &Options::default())
    }

    #[test]
    fn test_empty_function() {
        let asm = compile("int main(void) { return 0; }").unwrap();
        assert!(asm.contains("@_F_main"));
        assert!(asm.contains("@main"));
        assert!(asm.contains("enter"));
        assert!(asm.contains("ret"));
        assert!(emit::has_manual_line_header(&asm));
    }

    #[test]
    fn test_boolnot_twice() {
        // End-to-end scenario: double boolean negation through casts.
        let asm = compile(
            "int main(void){ if(!!0) return 1; if(!!(char)0x100) return 2;\n\
             if(!!(char)3){ if(!!1) return 0;} return 3; }",
        )
        .unwrap();
        assert!(asm.contains("isz"));
    }

    #[test]
    fn test_cast_overflowing_char() {
        let asm = compile(
            "int main(void){ if((signed char)0x123 != 0x23) return 1;\n\
             if((char signed)0x123 != 0x23) return 1; return 0; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_pointer_deref_lvalue() {
        let asm = compile(
            "int puts(const char* s);\n\
             const char* word; const char** words;\n\
             int main(void){ words = &word; *words = \"Hello\";\n\
             puts(word); puts(*(words+0)); return 0; }",
        )
        .unwrap();
        // Both globals become zero-initialised definitions.
        assert!(asm.contains("@word"));
        assert!(asm.contains("@words"));
        // The string literal is emitted exactly once.
        assert_eq!(asm.matches(&format!("@{}0", emit::STRING_LABEL_PREFIX)).count(), 1);
    }

    #[test]
    fn test_struct_return_by_value() {
        let asm = compile(
            "struct P{int x,y;};\n\
             struct P foo(void){ struct P a={2,3}; return a; }\n\
             int main(void){ 5*3+4*7; struct P a=foo();\n\
             if(a.x!=2) return 1; if(a.y!=3) return 2;\n\
             struct P b; b=foo(); if(b.x!=2) return 3; if(b.y!=3) return 4; return 0; }",
        )
        .unwrap();
        assert!(asm.contains("memcpy"));
    }

    #[test]
    fn test_func_name_single_definition() {
        let asm = compile(
            "int strcmp(const char* a, const char* b);\n\
             const char* f(void){ return __func__; }\n\
             int main(void){ return strcmp(f(), \"f\"); }",
        )
        .unwrap();
        // Exactly one string label holds the function name "f".
        let defs: Vec<_> = asm
            .match_indices(&format!("@{}", emit::STRING_LABEL_PREFIX))
            .collect();
        assert_eq!(defs.len(), 2); // __func__ literal and the "f" operand string
    }

    #[test]
    fn test_enum_constant_expressions() {
        let asm = compile(
            "enum E { A=3, B, C=B+4 };\n\
             int main(void){ return (A==3 && B==4 && C==8)?0:1; }",
        );
        assert!(asm.is_ok());
    }

    #[test]
    fn test_string_labels_unique_and_increasing() {
        let asm = compile(
            "const char* a = \"one\"; const char* b = \"two\"; const char* c = \"three\";\n\
             int main(void){ return 0; }",
        )
        .unwrap();
        let p = emit::STRING_LABEL_PREFIX;
        let i0 = asm.find(&format!("@{}0", p)).unwrap();
        let i1 = asm.find(&format!("@{}1", p)).unwrap();
        let i2 = asm.find(&format!("@{}2", p)).unwrap();
        assert!(i0 < i1 && i1 < i2);
    }

    #[test]
    fn test_compile_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("main.i");
        let output = dir.path().join("main.os");
        std::fs::write(&input, "int main(void) { return 0; }").unwrap();
        compile_file(&input, &output, &Options::default()).unwrap();
        let asm = std::fs::read_to_string(&output).unwrap();
        assert!(asm.contains("@main"));
        assert!(asm.ends_with('\n'));
    }

    #[test]
    fn test_compile_file_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = compile_file(
            &dir.path().join("absent.i"),
            &dir.path().join("out.os"),
            &Options::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }

    #[test]
    fn test_error_reports_location() {
        let err = compile("int main(void) { return x; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownName);
        assert_eq!(err.filename.as_deref(), Some("test.i"));
    }

    #[test]
    fn test_fail_fast_on_syntax_error() {
        let err = compile("int main(void) { return 0 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpectedToken);
    }
}
