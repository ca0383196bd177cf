//==============================================
// File: bin/transform_inspect.rs
// License: Duality Public License (DPL v1.0)
// Goal: Transform inspection tool
// Objective: Print the wrapped guest program and its line mapping for a
//            source file, for debugging mapping regressions offline
//==============================================

use std::fs;
use std::io::Read;

use anyhow::{Context, Result};
use clap::Parser;

use tidepool::{TransformResult, transform, transform_with_trace};

#[derive(Parser)]
#[command(name = "tidepool-transform", about = "Inspect the guest source transform")]
struct Args {
    /// Source file to transform, or "-" for stdin.
    input: String,

    /// Emit the traced variant with per-statement trace calls.
    #[arg(long)]
    trace: bool,

    /// Print the explicit line map instead of the transformed code.
    #[arg(long)]
    map: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let source = if args.input == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        text
    } else {
        fs::read_to_string(&args.input)
            .with_context(|| format!("failed to read {}", args.input))?
    };

    let result: TransformResult = if args.trace {
        transform_with_trace(&source)
    } else {
        transform(&source)
    };

    if args.map {
        println!("header_line_count: {}", result.header_line_count);
        println!("expansion: {}", result.expansion);
        match &result.line_map {
            Some(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort();
                for (transformed, original) in entries {
                    println!("{transformed} -> {original}");
                }
            }
            None => println!("(arithmetic fallback, no explicit map)"),
        }
    } else {
        print!("{}", result.code);
    }

    Ok(())
}
