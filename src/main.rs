//! rescan CLI - static PE analysis for pattern and offset recovery.
//!
//! This binary drives the rescan library over an on-disk image: it
//! loads a marker-target specification, fingerprints every target,
//! mines struct offsets, vtables, and singleton slots from the
//! results, and writes `patterns.json` / `offsets.json`.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};

use rescan::analyzer::{Analyzer, AnalyzerConfig, ScanSpec};
use rescan::report::{
    self, OffsetsReport, SingletonRecord, VtableRecord,
};
use rescan::ImageContainer;

/// Static PE analysis: function fingerprints, struct offsets, and
/// vtable recovery without symbols.
#[derive(Parser)]
#[command(name = "rescan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an image and list its sections
    Sections {
        /// Path to the PE32+ image
        image: PathBuf,
    },

    /// Run the full scan over a marker-target specification
    Scan {
        /// Path to the PE32+ image
        image: PathBuf,

        /// Marker-target specification (JSON)
        #[arg(short, long)]
        targets: PathBuf,

        /// Directory for patterns.json and offsets.json
        #[arg(short, long, default_value = "docs")]
        out_dir: PathBuf,

        /// Signature window length in bytes
        #[arg(long, default_value = "32")]
        window: usize,

        /// Code section name
        #[arg(long, default_value = ".text")]
        code_section: String,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sections { image } => list_sections(&image),
        Commands::Scan {
            image,
            targets,
            out_dir,
            window,
            code_section,
        } => scan(&image, &targets, &out_dir, window, code_section),
    }
}

fn load_image(path: &PathBuf) -> anyhow::Result<ImageContainer> {
    let image = ImageContainer::load(path)?;
    println!(
        "Analyzing: {} ({})",
        path.display(),
        ByteSize::b(image.len() as u64)
    );
    Ok(image)
}

fn list_sections(path: &PathBuf) -> anyhow::Result<()> {
    let image = load_image(path)?;
    println!("Image base: 0x{:X}", image.base());
    println!("{:<10} {:<12} {:<12} {:<12} Raw offset", "Name", "RVA", "VSize", "Raw size");
    for s in image.sections() {
        println!(
            "{:<10} 0x{:08X}   0x{:08X}   0x{:08X}   0x{:08X}",
            s.name, s.virtual_address, s.virtual_size, s.file_size, s.file_offset
        );
    }
    Ok(())
}

fn scan(
    image_path: &PathBuf,
    targets_path: &PathBuf,
    out_dir: &PathBuf,
    window: usize,
    code_section: String,
) -> anyhow::Result<()> {
    let image = load_image(image_path)?;
    let spec: ScanSpec = serde_json::from_str(&fs::read_to_string(targets_path)?)?;

    let config = AnalyzerConfig {
        signature_window: window,
        code_section,
        ..Default::default()
    };
    let analyzer = Analyzer::with_config(&image, config)?;

    // Phase 1: targeted function discovery.
    let pb = ProgressBar::new(spec.targets.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut patterns = Vec::new();
    for target in &spec.targets {
        pb.set_message(target.label.clone());
        if let Some(named) = analyzer.scan_target(target) {
            patterns.push(named);
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!("\nPatterns: {} of {} targets found", patterns.len(), spec.targets.len());
    for p in &patterns {
        println!(
            "  [{}] RVA 0x{:08X} via \"{}\" ({} function(s), xref +0x{:X})",
            p.label, p.best.entry.entry_rva, p.marker, p.total_functions, p.best.distance
        );
        println!("    {}", p.best.signature);
    }

    // Phase 2: struct offsets from the fingerprinted functions.
    let mut offsets_report = OffsetsReport::default();
    for p in &patterns {
        let offs = analyzer.struct_offsets(p.best.entry.entry_offset);
        if offs.is_empty() {
            continue;
        }
        println!("\n  [{}] struct offsets:", p.label);
        for (disp, rec) in offs.iter().take(20) {
            println!("    +0x{disp:X}: {rec}");
        }
        if offs.len() > 20 {
            println!("    ... {} more", offs.len() - 20);
        }
        offsets_report.insert_function_offsets(&p.label, &offs);
    }

    // Phase 3: vtables containing the discovered functions.
    let known_vas: Vec<u64> = patterns
        .iter()
        .map(|p| image.base() + p.best.entry.entry_rva as u64)
        .collect();
    for m in analyzer.vtables(&known_vas) {
        println!(
            "\n  Vtable at RVA 0x{:08X}, matched index {}, run length {}",
            m.table_rva, m.matched_index, m.run_length
        );
        offsets_report
            .vtables
            .insert(VtableRecord::key(&m), VtableRecord::from_match(&m, image.base()));
    }

    // Phase 4: global singleton slots.
    for target in &spec.singletons {
        if let Some(hit) = analyzer.singleton_for_marker(target) {
            println!(
                "\n  [{}] global slot at RVA 0x{:08X} (via \"{}\")",
                hit.label, hit.site.target_rva, hit.marker
            );
            offsets_report
                .singletons
                .insert(hit.label.clone(), SingletonRecord::from_hit(&hit));
        } else {
            println!("\n  [{}] singleton not found", target.label);
        }
    }

    offsets_report.apply_fallbacks(&spec.fallback_offsets);

    // Write reports.
    fs::create_dir_all(out_dir)?;
    let patterns_path = out_dir.join("patterns.json");
    let offsets_path = out_dir.join("offsets.json");
    serde_json::to_writer_pretty(
        fs::File::create(&patterns_path)?,
        &report::patterns_report(&patterns),
    )?;
    serde_json::to_writer_pretty(fs::File::create(&offsets_path)?, &offsets_report)?;

    println!("\nPatterns saved to: {}", patterns_path.display());
    println!("Offsets saved to: {}", offsets_path.display());
    Ok(())
}
