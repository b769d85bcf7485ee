use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use classflow::callgraph;
use classflow::classpath::ClassPath;
use classflow::init_logging;
use classflow::natives::NativeStubs;
use classflow::rta::{self, AnalysisOptions, EntryPoint, default_entry_points};

/// CLI arguments for a whole-program analysis run.
#[derive(Parser, Debug)]
#[command(
    name = "classflow",
    about = "RTA call graphs and class-flow analysis for JVM class files and JAR files.",
    version
)]
struct Cli {
    /// Classpath: colon- or semicolon-separated directories and archives.
    #[arg(long, value_name = "PATH")]
    classpath: String,
    /// Entry points, as class#method(descriptor). Repeatable.
    #[arg(long, value_name = "ENTRY", required_unless_present = "default_entries")]
    entry: Vec<String>,
    /// Add the JVM bootstrap entry points.
    #[arg(long)]
    default_entries: bool,
    /// Native-method stubs file; enables native following.
    #[arg(long, value_name = "PATH")]
    natives: Option<PathBuf>,
    /// Typecheck stack slots during IR construction.
    #[arg(long)]
    bcv: bool,
    /// Emit link checks for class-loading opcodes.
    #[arg(long)]
    check_link: bool,
    /// Write the callgraph JSON here instead of stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Persist the analyzed program for later reloading.
    #[arg(long, value_name = "PATH")]
    save_program: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut classpath = ClassPath::open(&cli.classpath).context("open classpath")?;

    let mut entry_points = Vec::new();
    if cli.default_entries {
        entry_points.extend(default_entry_points());
    }
    for spec in &cli.entry {
        entry_points.push(EntryPoint::parse(spec)?);
    }

    let stubs = match &cli.natives {
        Some(path) => Some(NativeStubs::load(path)?),
        None => None,
    };
    let options = AnalysisOptions {
        bcv: cli.bcv,
        check_link: cli.check_link,
        parse_natives: stubs.is_some(),
    };

    let program = rta::run(&mut classpath, &entry_points, stubs, options);

    if let Some(path) = &cli.save_program {
        fs::write(path, program.to_json()?)
            .with_context(|| format!("write program snapshot {}", path.display()))?;
    }

    let edges = callgraph::edges(&program);
    let json = serde_json::to_string_pretty(&edges).context("serialize callgraph")?;
    match &cli.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("create output file {}", path.display()))?;
            file.write_all(json.as_bytes()).context("write callgraph")?;
            file.write_all(b"\n").context("write callgraph")?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(json.as_bytes()).context("write callgraph")?;
            handle.write_all(b"\n").context("write callgraph")?;
        }
    }
    Ok(())
}
