//! Command-line driver: lower a JSON-encoded HIR function and report the
//! result.
//!
//! Usage:
//!   hir-x64 function.json [--config cfg.json] [--trace-data] [--run]

use clap::Parser;
use hir_x64::{GuestRuntime, HirFunction, LoweringConfig};
use std::error::Error;
use std::path::PathBuf;

/// Guest context block handed to `--run`.
const CONTEXT_SIZE: usize = 64 * 1024;
/// Flat guest memory handed to `--run`.
const MEMORY_SIZE: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lower a HIR function to x86-64 machine code")]
struct Args {
    /// HIR function in JSON form
    file: PathBuf,

    /// Lowering config (JSON); defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit data tracer calls around every load and store
    #[arg(long)]
    trace_data: bool,

    /// Execute the function against a zeroed context and guest memory
    #[arg(long)]
    run: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LoweringConfig::load(path)?,
        None => LoweringConfig::default(),
    };
    if args.trace_data {
        config.trace_data = true;
    }

    let text = std::fs::read_to_string(&args.file)?;
    let func: HirFunction = serde_json::from_str(&text)?;
    log::info!("Lowering '{}' ({} instructions)", func.name, func.instruction_count());

    let compiled = hir_x64::compile(&func, GuestRuntime::standalone(), config)?;
    println!("{}", serde_json::to_string_pretty(compiled.stats())?);
    println!("{}", hex::encode(compiled.code()));

    if args.run {
        run(&compiled);
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn run(compiled: &hir_x64::CompiledFunction) {
    let mut context = vec![0u8; CONTEXT_SIZE];
    let mut memory = vec![0u8; MEMORY_SIZE];
    log::info!("Running '{}'", compiled.name());
    // SAFETY: addresses outside the buffers are the caller's responsibility;
    // the context and memory sizes are documented on the flag.
    unsafe { compiled.call(context.as_mut_ptr(), memory.as_mut_ptr()) };
    for (i, word) in context[..64].chunks(8).enumerate() {
        let value = word.iter().rev().fold(0u64, |acc, &b| acc << 8 | b as u64);
        println!("ctx[{:#04x}] = {:#018x}", i * 8, value);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn run(_compiled: &hir_x64::CompiledFunction) {
    log::warn!("--run needs an x86-64 host");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let args = Args::try_parse_from(["hir-x64", "f.json"]).unwrap();
        assert_eq!(args.file, PathBuf::from("f.json"));
        assert!(args.config.is_none());
        assert!(!args.trace_data);
        assert!(!args.run);
    }

    #[test]
    fn test_parse_all_flags() {
        let args =
            Args::try_parse_from(["hir-x64", "f.json", "--config", "c.json", "--trace-data", "--run"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("c.json")));
        assert!(args.trace_data);
        assert!(args.run);
    }

    #[test]
    fn test_missing_file_is_rejected() {
        assert!(Args::try_parse_from(["hir-x64"]).is_err());
    }
}
