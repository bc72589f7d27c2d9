#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sofs_block::FileByteDevice;
use sofs_core::{Credentials, FormatOptions, Volume};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sofs", about = "SOFS13 — block-oriented file system toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a backing file as an empty SOFS13 volume.
    Mkfs {
        /// Path to the backing file (its size fixes the block count).
        image: PathBuf,
        /// Volume name.
        #[arg(short, long, default_value = "SOFS13")]
        name: String,
        /// Number of inodes (default: one per eight blocks).
        #[arg(short, long)]
        inodes: Option<u32>,
        /// Zero-fill all free data clusters.
        #[arg(short, long)]
        zero: bool,
        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Dump the superblock of an image.
    Inspect {
        /// Path to the backing file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Run the full consistency check on an image.
    Fsck {
        /// Path to the backing file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    properly_unmounted: bool,
    total_blocks: u32,
    inodes_total: u32,
    inodes_free: u32,
    inode_table_blocks: u32,
    map_table_blocks: u32,
    bitmap_blocks: u32,
    data_clusters_total: u32,
    data_clusters_free: u32,
}

#[derive(Debug, Serialize)]
struct FsckOutput {
    findings: Vec<FsckFinding>,
}

#[derive(Debug, Serialize)]
struct FsckFinding {
    structure: String,
    detail: String,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            name,
            inodes,
            zero,
            quiet,
        } => mkfs_cmd(&image, name, inodes, zero, quiet),
        Command::Inspect { image, json } => inspect_cmd(&image, json),
        Command::Fsck { image, json } => fsck_cmd(&image, json),
    }
}

fn mkfs_cmd(
    image: &PathBuf,
    name: String,
    inodes: Option<u32>,
    zero: bool,
    quiet: bool,
) -> Result<()> {
    let dev = FileByteDevice::open(image)
        .with_context(|| format!("failed to open backing file: {}", image.display()))?;
    let opts = FormatOptions {
        name,
        inodes,
        zero,
    };
    let mut volume = sofs_core::format(dev, &opts)
        .with_context(|| format!("failed to format {}", image.display()))?;
    if !quiet {
        let sb = volume.superblock().context("read superblock back")?;
        println!(
            "Installed a {}-inode SOFS13 file system in {} ({} blocks, {} data clusters).",
            sb.itotal,
            image.display(),
            sb.ntotal,
            sb.dzone_total
        );
    }
    volume.close().context("flush formatted volume")?;
    Ok(())
}

fn inspect_cmd(image: &PathBuf, json: bool) -> Result<()> {
    let mut volume = Volume::open_path(image, Credentials::root())
        .with_context(|| format!("failed to open SOFS13 image: {}", image.display()))?;
    let sb = volume.superblock().context("read superblock")?;

    let output = InspectOutput {
        volume_name: sb.volume_name(),
        properly_unmounted: sb.mstat == sofs_core::MountStatus::Pru,
        total_blocks: sb.ntotal,
        inodes_total: sb.itotal,
        inodes_free: sb.ifree,
        inode_table_blocks: sb.itable_size,
        map_table_blocks: sb.ciutable_size,
        bitmap_blocks: sb.fctable_size,
        data_clusters_total: sb.dzone_total,
        data_clusters_free: sb.dzone_free,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("SOFS13 Inspector");
        println!("volume_name: {}", output.volume_name);
        println!("properly_unmounted: {}", output.properly_unmounted);
        println!("total_blocks: {}", output.total_blocks);
        println!("inodes_total: {}", output.inodes_total);
        println!("inodes_free: {}", output.inodes_free);
        println!("inode_table_blocks: {}", output.inode_table_blocks);
        println!("map_table_blocks: {}", output.map_table_blocks);
        println!("bitmap_blocks: {}", output.bitmap_blocks);
        println!("data_clusters_total: {}", output.data_clusters_total);
        println!("data_clusters_free: {}", output.data_clusters_free);
    }
    Ok(())
}

fn fsck_cmd(image: &PathBuf, json: bool) -> Result<()> {
    let mut volume = Volume::open_path(image, Credentials::root())
        .with_context(|| format!("failed to open SOFS13 image: {}", image.display()))?;
    let findings = volume.check().context("consistency check failed")?;

    let output = FsckOutput {
        findings: findings
            .iter()
            .map(|f| FsckFinding {
                structure: f.kind.as_str().to_owned(),
                detail: f.detail.clone(),
            })
            .collect(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize fsck report")?
        );
    } else if findings.is_empty() {
        println!("clean: no inconsistencies found");
    } else {
        println!("{} inconsistencies found:", findings.len());
        for f in &findings {
            println!("  {f}");
        }
    }

    // Exit with a distinct status when the image is damaged.
    if !findings.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
