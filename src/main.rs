//! The `lamc` command-line interface: parse a lambda-calculus program,
//! compile it, reduce it to β-normal form, and print the result.

use anyhow::{Context, Result};
use clap::Parser;

/// Normalize a closed lambda-calculus term and print its β-normal form.
///
/// The source grammar accepts `\` or `λ` lambdas with multi-identifier
/// binder lists, left-associative application, and `/- … -/` comments.
#[derive(Parser)]
#[command(name = "lamc", version, about)]
struct Args {
    /// Source program; defaults to the identity function `λ x. x`.
    program: Option<String>,

    /// Print evaluation statistics to stderr.
    #[arg(long)]
    stats: bool,

    /// Nursery size in bytes.
    #[arg(long, default_value_t = 3 * 1024 * 1024)]
    nursery_size: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let source = args.program.as_deref().unwrap_or("λ x. x");

    let ast = lamc_frontend::parse(source)?;
    let (arena, root) = lamc_frontend::lower(&ast);
    let program = lamc_codegen::compile(&arena, root).context("compilation failed")?;
    drop(arena);

    let config = lamc_runtime::RuntimeConfig {
        nursery_bytes: args.nursery_size,
        ..Default::default()
    };
    let (nf, stats) = lamc_runtime::normalize_with_stats(&program.code, program.entry, &config)
        .context("evaluation failed")?;

    if args.stats {
        eprintln!(
            "thunks entered: {}, paps: {}, rigids grown: {}, gcs: {} minor / {} major",
            stats.thunks_entered,
            stats.paps_created,
            stats.rigids_grown,
            stats.minor_gcs,
            stats.major_gcs
        );
    }
    println!("{nf}");
    Ok(())
}
