//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`
//!
//! `lint` enforces the fleetlb workspace conventions:
//!
//! - every member under `crates/` is named `fleetlb-*` and listed in the
//!   root manifest
//! - every library root carries the shared lint attributes
//! - crate manifests take every dependency from `[workspace.dependencies]`
//! - library code outside `#[cfg(test)]` never calls `unwrap()` or
//!   `expect()`; `fleetlb-test-utils` is exempt

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Attributes every library crate must carry.
const REQUIRED_ATTRIBUTES: &[&str] = &[
    "#![forbid(unsafe_code)]",
    "#![deny(rust_2018_idioms)]",
    "#![warn(clippy::pedantic)]",
];

/// Crates allowed to panic on setup failures.
const PANIC_EXEMPT: &[&str] = &["fleetlb-test-utils"];

const DEPENDENCY_TABLES: &[&str] = &[
    "[dependencies]",
    "[dev-dependencies]",
    "[build-dependencies]",
];

#[derive(Parser)]
#[command(name = "xtask", about = "fleetlb workspace automation")]
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
    /// Generate coverage report
    Coverage,
    /// Run the distributor agent with pretty logs
    Distributor {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9443")]
        listen: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Coverage => run_coverage(),
        Commands::Distributor { listen } => run_distributor(&listen),
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

    let root_manifest = fs::read_to_string("Cargo.toml").context("Failed to read Cargo.toml")?;
    let members = workspace_members(&root_manifest);
    let mut violations = Vec::new();

    let mut crates: Vec<PathBuf> = fs::read_dir("crates")?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    crates.sort();

    for dir in &crates {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !name.starts_with("fleetlb-") {
            violations.push(format!("crate '{name}' does not follow fleetlb-* naming"));
        }
        if !members.iter().any(|m| m == &format!("crates/{name}")) {
            violations.push(format!("crate '{name}' is not a workspace member"));
        }

        let manifest = dir.join("Cargo.toml");
        let source = fs::read_to_string(&manifest)
            .with_context(|| format!("Failed to read {}", manifest.display()))?;
        for dep in pinned_dependencies(&source) {
            violations.push(format!(
                "{}: dependency '{dep}' does not use workspace = true",
                manifest.display()
            ));
        }

        let lib = dir.join("src/lib.rs");
        if lib.exists() {
            let source = fs::read_to_string(&lib)
                .with_context(|| format!("Failed to read {}", lib.display()))?;
            for attribute in missing_attributes(&source) {
                violations.push(format!("{} is missing {attribute}", lib.display()));
            }
        }

        if PANIC_EXEMPT.contains(&name.as_str()) {
            continue;
        }
        for file in rust_files(&dir.join("src"))? {
            let source = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            for line in panicking_calls(&source) {
                violations.push(format!(
                    "{}:{line}: unwrap/expect outside tests",
                    file.display()
                ));
            }
        }
    }

    for member in &members {
        if !Path::new(member).join("Cargo.toml").exists() {
            violations.push(format!("workspace member '{member}' has no Cargo.toml"));
        }
    }

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  {violation}");
        }
        anyhow::bail!("{} convention violation(s)", violations.len());
    }
    println!("All conventions validated ({} crates)", crates.len());
    Ok(())
}

/// Reads the `members` array of the root manifest.
fn workspace_members(manifest: &str) -> Vec<String> {
    let Some(start) = manifest.find("members") else {
        return Vec::new();
    };
    let rest = &manifest[start..];
    let (Some(open), Some(close)) = (rest.find('['), rest.find(']')) else {
        return Vec::new();
    };
    rest[open + 1..close]
        .split(',')
        .map(|m| m.trim().trim_matches('"').to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

/// Names of dependencies declared with their own version.
fn pinned_dependencies(manifest: &str) -> Vec<String> {
    let mut in_deps = false;
    let mut pinned = Vec::new();
    for line in manifest.lines().map(str::trim) {
        if line.starts_with('[') {
            in_deps = DEPENDENCY_TABLES.contains(&line);
            continue;
        }
        if !in_deps || line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, spec)) = line.split_once('=') {
            let inherited = spec.contains("workspace = true") || name.trim().ends_with(".workspace");
            if !inherited {
                pinned.push(name.trim().to_string());
            }
        }
    }
    pinned
}

fn missing_attributes(source: &str) -> Vec<&'static str> {
    REQUIRED_ATTRIBUTES
        .iter()
        .copied()
        .filter(|attribute| !source.contains(attribute))
        .collect()
}

/// Line numbers of `unwrap()`/`expect(` calls before the first test module.
/// Comments are skipped.
fn panicking_calls(source: &str) -> Vec<usize> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .filter(|(_, line)| line.contains(".unwrap()") || line.contains(".expect("))
        .map(|(i, _)| i + 1)
        .collect()
}

fn rust_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(rust_files(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn run_coverage() -> Result<()> {
    run_cmd("cargo", &["llvm-cov", "--workspace", "--html"])?;
    println!("\nCoverage report: target/llvm-cov/html/index.html");
    Ok(())
}

fn run_distributor(listen: &str) -> Result<()> {
    let status = Command::new("cargo")
        .args(["run", "--bin", "fleetlb-distributor-agent"])
        .env("FLEETLB_DIST_LISTEN_ADDR", listen)
        .env("FLEETLB_DIST_DEBUG", "true")
        .status()
        .context("Failed to run the distributor")?;

    if !status.success() {
        anyhow::bail!("Distributor exited with {status}");
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_read_from_the_root_manifest() {
        let manifest = r#"
[workspace]
resolver = "2"
members = [
    "crates/fleetlb-core",
    "tools/xtask",
]
"#;
        assert_eq!(
            workspace_members(manifest),
            vec!["crates/fleetlb-core".to_string(), "tools/xtask".to_string()]
        );
    }

    #[test]
    fn only_dependency_tables_are_checked() {
        let manifest = r#"
[package]
name = "fleetlb-flow"
version.workspace = true

[dependencies]
fleetlb-core = { workspace = true }
serde = "1"
tokio.workspace = true

[dev-dependencies]
proptest = { version = "1" }
"#;
        assert_eq!(pinned_dependencies(manifest), vec!["serde", "proptest"]);
    }

    #[test]
    fn panicking_calls_stop_at_the_test_module() {
        let source = "\
/// let x = parse().unwrap();
fn a() { b().unwrap(); }
// c().expect(\"no\");
fn d() { e().expect(\"boom\"); }
#[cfg(test)]
mod tests { fn f() { g().unwrap(); } }
";
        assert_eq!(panicking_calls(source), vec![2, 4]);
    }

    #[test]
    fn missing_attributes_are_listed() {
        let source = "#![forbid(unsafe_code)]\n#![warn(clippy::pedantic)]\n";
        assert_eq!(missing_attributes(source), vec!["#![deny(rust_2018_idioms)]"]);
    }
}
