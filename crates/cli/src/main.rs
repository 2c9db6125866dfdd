//! horsec CLI
//!
//! Front door of the runtime: execute compiled program artifacts, print
//! bytecode statistics and disassembly, and hand compiler-owned actions
//! off with a clear message (the front-end is a separate tool whose only
//! interface here is the serialized artifact).
//!
//! Standalone mode runs first: a horsec binary with an appended program
//! archive executes that program immediately, ignoring its arguments.

use clap::Parser as ClapParser;
use horse_runtime::pak;
use horse_runtime::program::NativeRegistry;
use horse_runtime::scheduler::run_program;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

// Clap prefixes the binary name, so the banner starts with the bare
// version and continues with the component lines.
const VERSION_BANNER: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncorelib ",
    env!("CARGO_PKG_VERSION"),
    "\nbuild: cargo, runtime-only\ncompiler: not bundled",
);

#[derive(ClapParser)]
#[command(name = "horsec")]
#[command(version = VERSION_BANNER)]
#[command(about = "Horse64 runtime - run compiled .hasm programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print bytecode statistics of a compiled program
    Codeinfo {
        /// Compiled .hasm artifact
        input: PathBuf,

        /// Emit machine-readable JSON instead of the human summary
        #[arg(long)]
        json: bool,
    },

    /// Compile a source file (requires the compiler front-end)
    Compile { input: PathBuf },

    /// Execute a compiled program artifact
    Exec { input: PathBuf },

    /// Print the disassembly of a compiled program
    GetAsm { input: PathBuf },

    /// Print the syntax tree of a source file (requires the compiler front-end)
    GetAst { input: PathBuf },

    /// Print the resolved syntax tree (requires the compiler front-end)
    GetResolvedAst { input: PathBuf },

    /// Print the token stream of a source file (requires the compiler front-end)
    GetTokens { input: PathBuf },

    /// Execute a compiled program artifact
    Run { input: PathBuf },
}

/// Historic option spellings accepted alongside the clap-native ones.
fn normalize_args() -> Vec<String> {
    std::env::args()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            match arg.as_str() {
                "-?" | "/?" => "--help".to_string(),
                "-v" | "-version" => "--version".to_string(),
                // Clap subcommands are kebab-case; the action names are
                // historically snake_case.
                "get_asm" => "get-asm".to_string(),
                "get_ast" => "get-ast".to_string(),
                "get_resolved_ast" => "get-resolved-ast".to_string(),
                "get_tokens" => "get-tokens".to_string(),
                _ => arg,
            }
        })
        .collect()
}

fn main() {
    // Standalone mode: an embedded program takes over unconditionally.
    if let Ok(exe) = std::env::current_exe() {
        match pak::extract_embedded_program(&exe) {
            Ok(Some(blob)) => {
                process::exit(execute_blob(&blob));
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("horsec: error: embedded program unreadable: {}", e);
                process::exit(255);
            }
        }
    }

    let cli = match Cli::try_parse_from(normalize_args()) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = e.print();
                    process::exit(0);
                }
                _ => {
                    let _ = e.print();
                    process::exit(255);
                }
            }
        }
    };

    match cli.command {
        Commands::Exec { input } | Commands::Run { input } => {
            let blob = read_artifact(&input);
            process::exit(execute_blob(&blob));
        }
        Commands::Codeinfo { input, json } => {
            let program = load_program(&read_artifact(&input));
            let stats = program.stats();
            if json {
                println!("{}", stats.render_json());
            } else {
                print!("{}", stats.render_human());
            }
        }
        Commands::GetAsm { input } => {
            let program = load_program(&read_artifact(&input));
            print!("{}", program.disassemble());
        }
        Commands::Compile { .. }
        | Commands::GetAst { .. }
        | Commands::GetResolvedAst { .. }
        | Commands::GetTokens { .. } => {
            eprintln!(
                "horsec: error: this action needs the compiler front-end, \
                 which is not bundled with this runtime build"
            );
            process::exit(255);
        }
    }
}

fn read_artifact(path: &std::path::Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("horsec: error: cannot read {}: {}", path.display(), e);
            process::exit(255);
        }
    }
}

fn load_program(blob: &[u8]) -> horse_runtime::Program {
    let registry = NativeRegistry::with_corelib();
    match horse_runtime::serialize::restore(blob, &registry) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("horsec: error: cannot load program: {}", e);
            process::exit(255);
        }
    }
}

fn execute_blob(blob: &[u8]) -> i32 {
    let program = Arc::new(load_program(blob));
    match run_program(program) {
        Ok(status) => {
            if let Some((class, msg)) = status.uncaught {
                eprintln!("Uncaught {}: {}", class, msg);
                return 1;
            }
            status.code
        }
        Err(_) => {
            eprintln!("horsec: error: out of memory while starting the program");
            255
        }
    }
}
