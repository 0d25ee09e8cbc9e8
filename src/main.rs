use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use import7z::archive::Archive;
use import7z::hook::PathHook;
use import7z::importer::{CodeKind, ImportOptions, Importer, Lookup};
use import7z::CodecRegistry;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "import7z", about = "Inspect 7z archives and resolve modules stored in them")]
struct Cli {
    /// -v for debug logging, -vv for trace (RUST_LOG overrides)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List archive entries
    List {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show folders, coders and sizes
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Resolve a dotted module name against a search-path entry (archive[/prefix])
    Find {
        path: PathBuf,
        name: String,
        /// Ignore compiled modules
        #[arg(long)]
        source_only: bool,
    },
    /// Load a module and print its source (or a summary of its bytecode)
    Show {
        path: PathBuf,
        name: String,
        #[arg(long)]
        source_only: bool,
    },
    /// Write one stored file to stdout
    Cat {
        input: PathBuf,
        entry: String,
    },
    /// Decode every folder and check all CRCs
    Verify {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let ar = Archive::open(&input)?;
            let files = ar.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
                return Ok(());
            }
            println!("Archive: {}", input.display());
            println!("{:<40} {:>10} {:>8} {:>6}  Method", "Name", "Size", "CRC", "Folder");
            for info in files {
                let name = if info.is_dir { format!("{}/", info.name) } else { info.name };
                println!("{:<40} {:>10} {:>8} {:>6}  {}",
                    name,
                    info.size,
                    info.crc.map(|c| format!("{c:08X}")).unwrap_or_else(|| "-".into()),
                    info.folder.map(|f| f.to_string()).unwrap_or_else(|| "-".into()),
                    info.method.unwrap_or_default());
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let ar = Archive::open(&input)?;
            let info = ar.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            println!("── 7z Archive ───────────────────────────────────────────");
            println!("  Path           {}", info.path.display());
            println!("  File size      {} B", info.file_size);
            println!("  Entries        {}", info.entries);
            println!("  Packed         {} B", info.pack_size);
            println!("  Unpacked       {} B", info.unpack_size);
            println!("  Folders ({}):", info.folders.len());
            for f in &info.folders {
                println!("    #{:<3} {:<20} {:>10} -> {:>10} B  {} substream(s)",
                    f.index, f.method, f.pack_size, f.unpack_size, f.substreams);
                for c in &f.coders {
                    let props = if c.properties.is_empty() { "-" } else { c.properties.as_str() };
                    let mark = if c.supported { "" } else { "  UNSUPPORTED" };
                    println!("         coder {} ({}) props {}{}", c.id, c.name, props, mark);
                }
                if let Some(reason) = &f.graph_error {
                    println!("         invalid graph: {reason}");
                }
            }
        }

        // ── Find ─────────────────────────────────────────────────────────────
        Commands::Find { path, name, source_only } => {
            let hook = path_hook(source_only);
            match resolve(&hook, &path, &name)?.1 {
                Lookup::Found(unit) => {
                    let kind = if unit.is_package { "package" } else { "module" };
                    let code = match unit.kind {
                        CodeKind::Source => "source",
                        CodeKind::Bytecode => "bytecode",
                    };
                    println!("{name}: {kind} ({code}) at {}", unit.origin);
                    if let Some(root) = unit.search_root {
                        println!("  search root {root}");
                    }
                }
                Lookup::Namespace(portion) => println!("{name}: namespace portion {portion}"),
                Lookup::NotFound => {
                    println!("{name}: not found");
                    std::process::exit(1);
                }
            }
        }

        // ── Show ─────────────────────────────────────────────────────────────
        Commands::Show { path, name, source_only } => {
            let hook = path_hook(source_only);
            let (importer, lookup) = resolve(&hook, &path, &name)?;
            let Lookup::Found(unit) = lookup else {
                return Err(format!("{name}: no loadable module").into());
            };
            let module = importer.load(&unit)?;
            match module.source() {
                Some(src) => print!("{src}"),
                None => println!("# {} bytes of bytecode from {}", module.code.len(), module.origin),
            }
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { input, entry } => {
            let ar = Archive::open(&input)?;
            let data = ar.read_file(&entry)?;
            std::io::stdout().write_all(&data)?;
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let ar = Archive::open(&input)?;
            let mut failed = 0usize;
            for check in ar.verify() {
                match check.result {
                    Ok(size) => println!("  folder {:<4} OK     {size} B", check.folder),
                    Err(e) => {
                        failed += 1;
                        let status = if e.is_corruption() { "CORRUPT" } else { "FAILED " };
                        println!("  folder {:<4} {status} {e}", check.folder);
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} folder(s) failed verification").into());
            }
            println!("Everything is Ok");
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn path_hook(source_only: bool) -> PathHook {
    let options = ImportOptions { allow_bytecode: !source_only, ..ImportOptions::default() };
    PathHook::new(CodecRegistry::builtin(), options)
}

/// Walk `name` one dotted segment at a time, descending into packages the
/// way an import system would.
fn resolve(hook: &PathHook, entry: &Path, name: &str) -> Result<(Importer, Lookup), Box<dyn Error>> {
    let mut importer = hook.importer_for(entry)?;
    let parts: Vec<&str> = name.split('.').collect();
    for i in 0..parts.len() {
        let qualified = parts[..=i].join(".");
        let lookup = importer.find_loader(&qualified)?;
        if i + 1 == parts.len() {
            return Ok((importer, lookup));
        }
        importer = match lookup {
            Lookup::Found(unit) => importer.for_package(&unit)
                .ok_or_else(|| format!("{qualified} is a module, not a package"))?,
            Lookup::Namespace(portion) => hook.importer_for(&portion)?,
            Lookup::NotFound => return Err(format!("{qualified}: not found").into()),
        };
    }
    Err("empty module name".into())
}
