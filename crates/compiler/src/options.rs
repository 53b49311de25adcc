//! Compiler options
//!
//! Options control optimisation, AST dumping and the warning set. The
//! warning configuration can be loaded from a TOML file and merged over
//! the built-in defaults, so projects can check a shared warning policy
//! into their tree.
//!
//! ```toml
//! # warnings.toml
//! disabled = ["statement-expressions"]
//! errors = ["implicit-int"]
//! ```

use std::collections::HashSet;

use serde::Deserialize;

/// Warning identifiers. Every warning can be disabled or elevated to an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    ImplicitInt,
    ImplicitlyUnsignedLiteral,
    AnonymousTags,
    ZeroLengthArray,
    StatementExpressions,
    ExtraKeywords,
    PointerArith,
}

impl Warning {
    pub const ALL: [Warning; 7] = [
        Warning::ImplicitInt,
        Warning::ImplicitlyUnsignedLiteral,
        Warning::AnonymousTags,
        Warning::ZeroLengthArray,
        Warning::StatementExpressions,
        Warning::ExtraKeywords,
        Warning::PointerArith,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Warning::ImplicitInt => "implicit-int",
            Warning::ImplicitlyUnsignedLiteral => "implicitly-unsigned-literal",
            Warning::AnonymousTags => "anonymous-tags",
            Warning::ZeroLengthArray => "zero-length-array",
            Warning::StatementExpressions => "statement-expressions",
            Warning::ExtraKeywords => "extra-keywords",
            Warning::PointerArith => "pointer-arith",
        }
    }

    pub fn from_id(id: &str) -> Option<Warning> {
        Warning::ALL.into_iter().find(|w| w.id() == id)
    }
}

/// Raw deserialized form of a warning configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WarningConfigFile {
    #[serde(default)]
    disabled: Vec<String>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Which warnings are reported and which abort compilation.
#[derive(Debug, Clone, Default)]
pub struct WarningConfig {
    disabled: HashSet<Warning>,
    errors: HashSet<Warning>,
}

impl WarningConfig {
    /// All warnings enabled, none elevated.
    pub fn default_config() -> Self {
        WarningConfig::default()
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let file: WarningConfigFile =
            toml::from_str(content).map_err(|e| format!("Invalid warning config: {}", e))?;
        let mut config = WarningConfig::default();
        for id in &file.disabled {
            let warning = Warning::from_id(id)
                .ok_or_else(|| format!("Unknown warning identifier: {}", id))?;
            config.disabled.insert(warning);
        }
        for id in &file.errors {
            let warning = Warning::from_id(id)
                .ok_or_else(|| format!("Unknown warning identifier: {}", id))?;
            config.errors.insert(warning);
        }
        Ok(config)
    }

    /// Overlays another configuration on top of this one.
    pub fn merge(&mut self, other: WarningConfig) {
        self.disabled.extend(other.disabled);
        self.errors.extend(other.errors);
    }

    pub fn disable(&mut self, warning: Warning) {
        self.disabled.insert(warning);
    }

    pub fn elevate(&mut self, warning: Warning) {
        self.errors.insert(warning);
    }

    pub fn is_enabled(&self, warning: Warning) -> bool {
        !self.disabled.contains(&warning)
    }

    pub fn is_error(&self, warning: Warning) -> bool {
        self.errors.contains(&warning) && self.is_enabled(warning)
    }
}

/// Options for a single compilation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Run the tree optimiser and the peephole pass.
    pub optimize: bool,
    /// Print each function's tree to stdout after parsing.
    pub dump_ast: bool,
    pub warnings: WarningConfig,
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_dump_ast(mut self, dump_ast: bool) -> Self {
        self.dump_ast = dump_ast;
        self
    }

    pub fn with_warnings(mut self, warnings: WarningConfig) -> Self {
        self.warnings = warnings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_all_enabled() {
        let config = WarningConfig::default_config();
        for warning in Warning::ALL {
            assert!(config.is_enabled(warning));
            assert!(!config.is_error(warning));
        }
    }

    #[test]
    fn test_from_toml() {
        let config = WarningConfig::from_toml(
            r#"
            disabled = ["statement-expressions"]
            errors = ["implicit-int"]
            "#,
        )
        .unwrap();
        assert!(!config.is_enabled(Warning::StatementExpressions));
        assert!(config.is_error(Warning::ImplicitInt));
        assert!(config.is_enabled(Warning::PointerArith));
    }

    #[test]
    fn test_from_toml_unknown_id() {
        let result = WarningConfig::from_toml(r#"disabled = ["no-such-warning"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml_unknown_field() {
        let result = WarningConfig::from_toml(r#"warnigns = []"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_merge() {
        let mut base = WarningConfig::default_config();
        let overlay = WarningConfig::from_toml(r#"errors = ["anonymous-tags"]"#).unwrap();
        base.merge(overlay);
        assert!(base.is_error(Warning::AnonymousTags));
    }

    #[test]
    fn test_disabled_warning_is_not_error() {
        let config = WarningConfig::from_toml(
            r#"
            disabled = ["implicit-int"]
            errors = ["implicit-int"]
            "#,
        )
        .unwrap();
        assert!(!config.is_error(Warning::ImplicitInt));
    }

    #[test]
    fn test_id_round_trip() {
        for warning in Warning::ALL {
            assert_eq!(Warning::from_id(warning.id()), Some(warning));
        }
    }
}
