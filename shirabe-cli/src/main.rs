//! Shirabe CLI - コマンドラインインターフェース
//!
//! DWARFデバッグ情報を対話的に調べるREPLインターフェース

mod command;

use anyhow::Result;
use clap::Parser;
use command::Command;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use shirabe_dwarf::{
    DwarfEngine, DwarfLoader, EngineConfig, Function, ResolvedEntity, Type, Uid, Variable,
    VariableLocation,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Shirabe - DWARF debug info explorer
#[derive(Parser)]
#[command(name = "shirabe")]
#[command(version = "0.1.0")]
#[command(about = "Lazy DWARF debug information explorer", long_about = None)]
struct Cli {
    /// Path to the executable or object file
    binary: PathBuf,

    /// Additional directory to search for .dwo files
    #[arg(long = "dwo-path", value_name = "DIR")]
    dwo_paths: Vec<PathBuf>,

    /// Path to the .dwp package (default: <binary>.dwp)
    #[arg(long, value_name = "FILE")]
    dwp: Option<PathBuf>,

    /// Do not load split DWARF units
    #[arg(long)]
    no_split: bool,

    /// Companion object files (debug map)
    #[arg(long = "companion", value_name = "FILE")]
    companions: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Run a single command and exit (e.g. `lookup 0x1040`)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig {
        split_search_paths: cli.dwo_paths.clone(),
        package_path: cli.dwp.clone(),
        load_split_units: !cli.no_split,
        ..Default::default()
    };
    let engine = DwarfLoader::load_with_companions(&cli.binary, &cli.companions, config)?;
    debug!(units = engine.num_compile_units(), "engine ready");

    if !cli.command.is_empty() {
        let line = cli.command.join(" ");
        return handle_command(&engine, &line);
    }

    println!("Shirabe - DWARF debug info explorer");
    println!("Loaded {}", cli.binary.display());
    println!();
    run_repl(&engine)
}

/// ログ出力を初期化する（RUST_LOG が優先）
fn init_logging(verbose: bool) {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    } else if verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_writer(std::io::stderr)
            .init();
    }
}

/// REPLループを実行する
fn run_repl(engine: &DwarfEngine) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(shirabe) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                if let Err(e) = handle_command(engine, line) {
                    eprintln!("Error: {}", e);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn handle_command(engine: &DwarfEngine, line: &str) -> Result<()> {
    match Command::parse(line) {
        Some(Command::Units) => handle_units(engine),
        Some(Command::Lookup(addr)) => handle_lookup(engine, addr),
        Some(Command::Context(addr)) => handle_context(engine, addr),
        Some(Command::Type(name)) => handle_type(engine, &name),
        Some(Command::Function(name)) => handle_function(engine, &name),
        Some(Command::Variable(name)) => handle_variable(engine, &name),
        Some(Command::Uid(value)) => handle_uid(engine, Uid(value)),
        Some(Command::Stats) => println!("{:?}", engine.cache_stats()),
        Some(Command::Help) => print_help(),
        Some(Command::Quit) => handle_quit(),
        None => {
            println!("Unknown command: {}", line);
            println!("Type 'help' for available commands.");
        }
    }
    Ok(())
}

/// Quitコマンドを処理する
fn handle_quit() {
    println!("Goodbye!");
    std::process::exit(0);
}

fn handle_units(engine: &DwarfEngine) {
    let units = engine.compile_units();
    println!("Compile units ({} found):", units.len());
    for unit in &units {
        print!(
            "  [{}] {} 0x{:x} v{} {}",
            unit.index,
            unit.file,
            unit.offset,
            unit.version,
            unit.name.as_deref().unwrap_or("<unnamed>")
        );
        if let Some(lang) = &unit.language {
            print!(" ({})", lang);
        }
        if let Some(dwo_id) = unit.dwo_id {
            print!(
                " dwo_id=0x{:016x} {}",
                dwo_id,
                unit.dwo_name.as_deref().unwrap_or("")
            );
        }
        println!();
    }
}

fn handle_lookup(engine: &DwarfEngine, addr: u64) {
    match engine.lookup_address(addr) {
        Some(ResolvedEntity::Function(f)) => print_function(&f),
        Some(ResolvedEntity::Variable(v)) => print_variable(&v),
        Some(other) => println!("{} {}", other.kind_name(), other.uid()),
        None => println!("No function or global variable at 0x{:x}", addr),
    }
    if let Some(line) = engine.line_for_address(addr) {
        println!("  at {}:{}", line.file, line.line);
    }
}

fn handle_context(engine: &DwarfEngine, addr: u64) {
    let context = engine.resolve_symbol_context(addr);
    println!("Address 0x{:x}", context.address);
    if let Some(unit) = &context.unit {
        println!("  unit: {}", unit.name.as_deref().unwrap_or("<unnamed>"));
    }
    match &context.function {
        Some(f) => println!("  function: {} [{}]", f.display_name(), f.uid),
        None => println!("  function: <none>"),
    }
    if let Some(block) = &context.block {
        println!("  block: {}", block.uid);
        if let Some(inlined) = &block.inlined {
            println!("  inlined: {}", inlined.name.as_deref().unwrap_or("<unknown>"));
        }
        for var in &block.variables {
            print_variable(var);
        }
    }
    if let Some(line) = &context.line {
        println!("  line: {}:{}", line.file, line.line);
    }
}

fn handle_type(engine: &DwarfEngine, name: &str) {
    let types = engine.find_types(name);
    if types.is_empty() {
        println!("No type named '{}'", name);
        return;
    }
    for ty in &types {
        print_type(ty);
    }
}

fn handle_function(engine: &DwarfEngine, name: &str) {
    let functions = engine.find_functions(name);
    if functions.is_empty() {
        println!("No function named '{}'", name);
        return;
    }
    for f in &functions {
        print_function(f);
        for var in engine.function_variables(f) {
            print_variable(&var);
        }
    }
}

fn handle_variable(engine: &DwarfEngine, name: &str) {
    let variables = engine.find_global_variables(name);
    if variables.is_empty() {
        println!("No global variable named '{}'", name);
        return;
    }
    for var in &variables {
        print_variable(var);
    }
}

fn handle_uid(engine: &DwarfEngine, uid: Uid) {
    match engine.resolve(uid) {
        Some(ResolvedEntity::Type(ty)) => print_type(&ty),
        Some(ResolvedEntity::Function(f)) => print_function(&f),
        Some(ResolvedEntity::Variable(v)) => print_variable(&v),
        Some(ResolvedEntity::Block(b)) => {
            println!("block {} ({} variables, {} children)", b.uid, b.variables.len(), b.children.len());
        }
        Some(ResolvedEntity::Namespace(ns)) => println!("namespace {} [{}]", ns.qualified_name, ns.uid),
        None => println!("Invalid identifier {}", uid),
    }
}

/// 型を表示するヘルパー関数
fn print_type(ty: &Arc<Type>) {
    let size = ty
        .byte_size()
        .map(|s| format!("{} bytes", s))
        .unwrap_or_else(|| "size unknown".to_string());
    let state = if ty.is_complete() { "" } else { " (incomplete)" };
    println!("{} {} [{}] {}{}", ty.kind(), ty.display_name(), ty.uid(), size, state);

    for m in ty.members() {
        let member_type = m
            .ty
            .as_ref()
            .and_then(|t| t.get())
            .map(|t| t.display_name())
            .unwrap_or_else(|| "?".to_string());
        match m.byte_offset {
            Some(offset) => println!(
                "  +{:<4} {}: {}",
                offset,
                m.name.as_deref().unwrap_or("<anon>"),
                member_type
            ),
            None => println!("        {}: {}", m.name.as_deref().unwrap_or("<anon>"), member_type),
        }
    }
    for e in ty.enumerators() {
        println!("  {} = {}", e.name, e.value);
    }
}

/// 関数を表示するヘルパー関数
fn print_function(f: &Function) {
    println!("function {} [{}]", f.display_name(), f.uid);
    for range in &f.ranges {
        println!("  0x{:x}..0x{:x}", range.start, range.end);
    }
    if let Some(demangled) = &f.demangled_name {
        println!("  demangled: {}", demangled);
    }
    if let Some(ret) = f.return_type.as_ref().and_then(|t| t.get()) {
        println!("  returns: {}", ret.display_name());
    }
}

/// 変数を表示するヘルパー関数
fn print_variable(v: &Variable) {
    let ty = v
        .ty()
        .map(|t| t.display_name())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "  {:?} {}: {} @ {}",
        v.scope,
        v.qualified_name.as_deref().or(v.name.as_deref()).unwrap_or("<anon>"),
        ty,
        format_location(&v.location)
    );
}

fn format_location(location: &VariableLocation) -> String {
    match location {
        VariableLocation::FrameOffset(offset) => format!("fbreg{:+}", offset),
        VariableLocation::Register(reg) => format!("reg{}", reg),
        VariableLocation::RegisterOffset { register, offset } => format!("breg{}{:+}", register, offset),
        VariableLocation::Address(addr) => format!("0x{:x}", addr),
        VariableLocation::Constant(value) => format!("const {}", value),
        VariableLocation::Expression(bytes) => format!("expr({} bytes)", bytes.len()),
        VariableLocation::List(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .map(|e| {
                    format!(
                        "[0x{:x}..0x{:x}) {}",
                        e.range.start,
                        e.range.end,
                        format_location(&e.location)
                    )
                })
                .collect();
            parts.join(", ")
        }
        VariableLocation::OptimizedOut => "<optimized out>".to_string(),
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help             - Show this help message");
    println!("  quit/exit/q      - Exit");
    println!();
    println!("Query commands:");
    println!("  units            - List compile units (including split units)");
    println!("  lookup <addr>    - Find the function or global variable at an address");
    println!("  context <addr>   - Show function, block and line for an address");
    println!("  type <name>      - Find types by (qualified) name");
    println!("  function <name>  - Find functions by name, qualified name or linkage name");
    println!("  variable <name>  - Find global variables by name");
    println!("  uid <id>         - Resolve an entity identifier");
    println!("  stats            - Show cache statistics");
    println!();
    println!("Examples:");
    println!("  lookup 0x1040");
    println!("  type std::string");
    println!("  function main");
}
