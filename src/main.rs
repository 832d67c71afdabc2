//! Command-line interface for the `shaderpipe` compile pipeline.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use shaderpipe::{read_job_dump, CompilationContext, CompileConfig, PathMappings, VirtualPath};

#[derive(Parser)]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// validate a virtual shader path against the path rules
    Check(PathArgs),
    /// list the include closure of a virtual shader file
    Includes(PathArgs),
    /// read a binary job dump and print its contents
    Dump(DumpArgs),
}

#[derive(Args)]
struct PathArgs {
    /// virtual shader path, e.g. /Game/Foo.usf
    path: String,
    /// virtual-to-physical directory mapping, VIRTUAL=PHYSICAL (repeatable)
    #[arg(long = "map", value_parser = parse_mapping)]
    mappings: Vec<(String, PathBuf)>,
    /// target platform name used for /Platform/... substitution
    #[arg(long, default_value = "Generic")]
    platform: String,
}

#[derive(Args)]
struct DumpArgs {
    /// job dump file written by the dispatcher
    input: PathBuf,
}

fn parse_mapping(raw: &str) -> Result<(String, PathBuf), String> {
    raw.split_once('=')
        .map(|(virt, phys)| (virt.to_string(), PathBuf::from(phys)))
        .ok_or_else(|| format!("expected VIRTUAL=PHYSICAL, got `{raw}`"))
}

fn build_mappings(args: &PathArgs) -> Arc<PathMappings> {
    let mut mappings = PathMappings::new();
    for (virt, phys) in &args.mappings {
        mappings.add_mapping(virt.clone(), phys.clone());
    }
    Arc::new(mappings)
}

fn check(args: &PathArgs) -> ExitCode {
    let mappings = build_mappings(args);
    match VirtualPath::new(args.path.clone(), &mappings) {
        Ok(path) => {
            match mappings.resolve(&path) {
                Ok(physical) => println!("{path} -> {}", physical.display()),
                Err(_) => println!("{path} -- OK (no directory mapping registered)"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn includes(args: &PathArgs) -> ExitCode {
    let mappings = build_mappings(args);
    let ctx = CompilationContext::with_file_resolver(mappings.clone(), CompileConfig::default());
    let path = match VirtualPath::new(args.path.clone(), &mappings) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    match ctx.scan_includes(&path, &args.platform) {
        Ok(deps) => {
            for include in deps.paths() {
                println!("{include}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn dump(args: &DumpArgs) -> ExitCode {
    let file = match File::open(&args.input) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("cannot open {}: {err}", args.input.display());
            return ExitCode::FAILURE;
        }
    };
    match read_job_dump(file) {
        Ok((input, output)) => {
            println!("source:      {}", input.source_path);
            println!("entry point: {}", input.entry_point);
            println!("format:      {}", input.shader_format);
            println!("platform:    {}", input.target.platform);
            println!("input hash:  {}", input.input_hash);
            println!("succeeded:   {}", output.succeeded);
            println!("code bytes:  {}", output.code.len());
            for diag in &output.diagnostics {
                println!("{}", diag.formatted());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Command::Check(args) => check(args),
        Command::Includes(args) => includes(args),
        Command::Dump(args) => dump(args),
    }
}
