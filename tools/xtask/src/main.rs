//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::Command;

/// Attributes every library crate root must carry.
const REQUIRED_CRATE_ATTRS: [&str; 2] = ["#![forbid(unsafe_code)]", "#![deny(missing_docs)]"];

#[derive(Parser)]
#[command(name = "xtask", about = "Keel workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Run only the engine and API integration tests
    Integration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Integration => run_integration(),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"])?;
    run_cmd("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    run_cmd("cargo", &["test", "--workspace"])?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    for entry in std::fs::read_dir("crates").context("read crates/")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("keel-") {
            anyhow::bail!("Crate '{name}' does not follow keel-* naming");
        }

        let manifest = std::fs::read_to_string(entry.path().join("Cargo.toml"))
            .with_context(|| format!("read {name}/Cargo.toml"))?;
        if !manifest.contains("[lints]") {
            anyhow::bail!("Crate '{name}' does not inherit workspace lints");
        }

        let lib = entry.path().join("src/lib.rs");
        if lib.exists() {
            let source = std::fs::read_to_string(&lib)?;
            for attr in REQUIRED_CRATE_ATTRS {
                if !source.contains(attr) {
                    anyhow::bail!("Crate '{name}' is missing {attr} in src/lib.rs");
                }
            }
        }
    }

    println!("All conventions validated!");
    Ok(())
}

fn run_integration() -> Result<()> {
    run_cmd("cargo", &["test", "-p", "keel-engine", "--tests"])?;
    run_cmd("cargo", &["test", "-p", "keel-api", "--tests"])?;
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
