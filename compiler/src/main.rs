use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use loomc::cancel::CancellationToken;
use loomc::pipeline::{compile, CompileError, CompileOptions};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Typed,
    Schedule,
    Groups,
    Alloc,
    Bytecode,
    Ir,
    Dot,
}

#[derive(Parser, Debug)]
#[command(
    name = "loomc",
    version,
    about = "Loom Compiler — compiles finalized dataflow graph documents to bytecode and native IR"
)]
struct Cli {
    /// Input graph document (JSON)
    source: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Bytecode)]
    emit: EmitStage,

    /// Print compiler phases and counts
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.verbose {
        eprintln!("loomc: source = {}", cli.source.display());
        eprintln!("loomc: emit   = {:?}", cli.emit);
    }

    // ── Load graph document ──
    let text = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("loomc: error: {}: {}", cli.source.display(), e);
            return ExitCode::from(2);
        }
    };
    let graph = match loomc::doc::from_json(&text) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("loomc: error: {}", e);
            return ExitCode::from(2);
        }
    };

    if cli.verbose {
        eprint!("loomc: {}", graph);
    }

    if matches!(cli.emit, EmitStage::Dot) {
        print!("{}", loomc::dot::render(&graph));
        return ExitCode::SUCCESS;
    }

    // ── Compile ──
    let options = CompileOptions {
        emit_bytecode: matches!(cli.emit, EmitStage::Bytecode),
        emit_native: matches!(cli.emit, EmitStage::Ir),
    };
    let token = CancellationToken::new();
    let compiled = match compile(&graph, &options, &token) {
        Ok(c) => c,
        Err(CompileError::Diagnostics { diagnostics, .. }) => {
            for d in &diagnostics {
                eprintln!("loomc: {}", d);
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("loomc: error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for w in &compiled.warnings {
        eprintln!("loomc: {}", w);
    }
    if cli.verbose {
        eprintln!(
            "loomc: topology {}",
            compiled.provenance.topology_hash_hex()
        );
    }

    match cli.emit {
        EmitStage::Typed => {
            let mut vars: Vec<_> = compiled.typed.vars.iter().collect();
            vars.sort_by_key(|v| v.id);
            for v in vars {
                println!("var {}: {}", v.id.0, v.ty);
            }
        }
        EmitStage::Schedule => print!("{}", compiled.schedule),
        EmitStage::Groups => print!("{}", compiled.groups),
        EmitStage::Alloc => print!("{}", compiled.alloc),
        EmitStage::Bytecode => {
            if let Some(bc) = &compiled.bytecode {
                print!("{}", bc);
            }
        }
        EmitStage::Ir => {
            if let Some(ir) = &compiled.native {
                print!("{}", ir.ir);
            }
        }
        EmitStage::Dot => unreachable!("handled before compilation"),
    }
    ExitCode::SUCCESS
}
