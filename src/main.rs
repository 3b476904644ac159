mod cli;

use streamguard::config;
use streamguard_media::{inspect, ContainerFamily, ContainerIndex, FragmentSignature};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use serde::Serialize;
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "streamguard=trace,streamguard_media=trace,streamguard_common=debug".to_string()
        } else {
            "streamguard=info,streamguard_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Inspect { file, json } => inspect_file(&file, json),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("streamguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct InspectReport {
    family: ContainerFamily,
    layout: Vec<inspect::LayoutNode>,
    index: Option<IndexReport>,
    index_error: Option<String>,
}

#[derive(Serialize)]
struct IndexReport {
    init_segment_len: usize,
    data_start: usize,
    entries: usize,
    audio_only: bool,
    fragments: Vec<FragmentSignature>,
}

fn inspect_file(file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }
    let data = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;

    let extension_family = file
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| match e.to_ascii_lowercase().as_str() {
            "mp4" | "m4v" | "m4a" | "m4s" => Some(ContainerFamily::Mp4),
            "webm" | "mkv" => Some(ContainerFamily::Webm),
            _ => None,
        });
    let Some(family) = ContainerFamily::sniff(&data).or(extension_family) else {
        anyhow::bail!("Unrecognised container: {:?}", file);
    };

    let (index, index_error) = match ContainerIndex::build(family, &data) {
        Ok(index) => {
            let fragments = index
                .extract_after_init(&data)
                .iter()
                .map(|f| f.signature())
                .collect();
            let report = IndexReport {
                init_segment_len: index.init_segment().len(),
                data_start: index.data_start(),
                entries: index.entry_count(),
                audio_only: index.is_audio_only(),
                fragments,
            };
            (Some(report), None)
        }
        Err(e) => (None, Some(e.to_string())),
    };
    let report = InspectReport {
        family,
        layout: inspect::layout(family, &data),
        index,
        index_error,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Container: {}", report.family);
    println!("\nLayout:");
    for node in &report.layout {
        println!(
            "  {}{} @{} size {}{}",
            "  ".repeat(node.depth),
            node.name,
            node.offset,
            node.size,
            if node.complete { "" } else { " (truncated)" }
        );
    }

    match (&report.index, &report.index_error) {
        (Some(index), _) => {
            println!("\nIndex:");
            println!("  Init segment: {} bytes", index.init_segment_len);
            println!("  Data start: {}", index.data_start);
            println!("  Entries: {}", index.entries);
            if index.audio_only {
                println!("  Audio only");
            }
            println!("\nFragments: {}", index.fragments.len());
            for (i, fragment) in index.fragments.iter().enumerate() {
                print!("  [{}] @{} len {}", i, fragment.offset, fragment.length);
                if !fragment.complete {
                    print!(" (partial)");
                }
                println!();
            }
        }
        (None, Some(error)) => println!("\nIndex: not built ({})", error),
        (None, None) => {}
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            print_summary(&config);
        }
        None => {
            println!("No config file specified, using defaults");
            print_summary(&config::Config::default());
        }
    }

    Ok(())
}

fn print_summary(config: &config::Config) {
    println!(
        "  Scan threshold: {} bytes",
        config.filter.scan_threshold_bytes
    );
    println!("  Video mode: {:?}", config.filter.video_mode);
    println!("  Default zone: {:?}", config.zone.default_zone);
    println!(
        "  Watchdog: every {} ms, expire after {} s",
        config.watchdog.interval_ms, config.watchdog.expire_after_secs
    );
    println!(
        "  Liveness probe: every {} ms",
        config.liveness.interval_ms
    );
    println!(
        "  Backends: {}",
        config.engine.backend_preference.join(", ")
    );
}
