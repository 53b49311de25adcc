//! OVM C Compiler CLI
//!
//! Command-line interface for compiling preprocessed C translation units
//! to OVM assembly.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use ovmcc::{Options, Warning, WarningConfig};

#[derive(Parser)]
#[command(name = "ovmcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "OVM C compiler - compile preprocessed C to OVM assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a preprocessed .i file to assembly
    Build {
        /// Input preprocessed C source file
        input: PathBuf,

        /// Output assembly path (defaults to the input filename with a
        /// .os extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Enable optimization (tree folding and peephole)
        #[arg(short = 'O', long)]
        optimize: bool,

        /// Print each function's tree after parsing
        #[arg(long)]
        dump_ast: bool,

        /// Path to a warning configuration (TOML)
        #[arg(long, value_name = "PATH")]
        warn_config: Option<PathBuf>,

        /// Disable a warning by identifier (repeatable)
        #[arg(long = "no-warn", value_name = "ID")]
        no_warn: Vec<String>,

        /// Elevate a warning to an error by identifier (repeatable)
        #[arg(long = "warn-error", value_name = "ID")]
        warn_error: Vec<String>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            optimize,
            dump_ast,
            warn_config,
            no_warn,
            warn_error,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension("os"));
            run_build(
                &input,
                &output,
                optimize,
                dump_ast,
                warn_config.as_deref(),
                &no_warn,
                &warn_error,
            );
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ovmcc", &mut io::stdout());
        }
    }
}

fn build_warning_config(
    warn_config: Option<&Path>,
    no_warn: &[String],
    warn_error: &[String],
) -> Result<WarningConfig, String> {
    let mut config = WarningConfig::default_config();

    if let Some(path) = warn_config {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read warning config {}: {}", path.display(), e))?;
        let loaded = WarningConfig::from_toml(&content)?;
        config.merge(loaded);
    }

    for id in no_warn {
        let warning = Warning::from_id(id)
            .ok_or_else(|| format!("Unknown warning identifier: {}", id))?;
        config.disable(warning);
    }
    for id in warn_error {
        let warning = Warning::from_id(id)
            .ok_or_else(|| format!("Unknown warning identifier: {}", id))?;
        config.elevate(warning);
    }

    Ok(config)
}

fn run_build(
    input: &Path,
    output: &Path,
    optimize: bool,
    dump_ast: bool,
    warn_config: Option<&Path>,
    no_warn: &[String],
    warn_error: &[String],
) {
    let warnings = match build_warning_config(warn_config, no_warn, warn_error) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let options = Options::new()
        .with_optimize(optimize)
        .with_dump_ast(dump_ast)
        .with_warnings(warnings);

    match ovmcc::compile_file(input, output, &options) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
