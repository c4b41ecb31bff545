use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use versfs_core::{FileDevice, Mount, MountConfig};

#[derive(Parser, Debug)]
#[command(about = "Print a volume's superblock")]
struct Cli {
    device: PathBuf,

    /// Log2 of the block size the volume was formatted with.
    #[arg(long, default_value_t = 12)]
    block_bits: u32,

    /// Emit the superblock as JSON instead of the plain-text table.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct SuperblockSnapshot {
    device: String,
    block_bits: u32,
    vol_blocks: u64,
    free_blocks: u64,
    next_alloc: u64,
    bitmap_block: i64,
    itable_root: i64,
    itable_depth: u32,
    next_inum: u64,
}

pub fn cmd_inspect(argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let device = FileDevice::open(&cli.device, cli.block_bits)
        .with_context(|| format!("opening {}", cli.device.display()))?;
    let config = MountConfig::new(cli.block_bits);
    let mount = Mount::open(Box::new(device), config)
        .with_context(|| format!("reading superblock of {}", cli.device.display()))?;

    let sb = mount.superblock();
    let snapshot = SuperblockSnapshot {
        device: cli.device.display().to_string(),
        block_bits: sb.block_bits,
        vol_blocks: sb.vol_blocks,
        free_blocks: sb.free_blocks,
        next_alloc: sb.next_alloc,
        bitmap_block: sb.bitmap_block,
        itable_root: sb.itable_root,
        itable_depth: sb.itable_depth,
        next_inum: sb.next_inum,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot).context("serializing superblock")?);
        return Ok(());
    }

    println!("device:        {}", snapshot.device);
    println!("block_bits:    {}", snapshot.block_bits);
    println!("vol_blocks:    {}", snapshot.vol_blocks);
    println!("free_blocks:   {}", snapshot.free_blocks);
    println!("next_alloc:    {}", snapshot.next_alloc);
    println!("bitmap_block:  {}", snapshot.bitmap_block);
    println!("itable_root:   {}", snapshot.itable_root);
    println!("itable_depth:  {}", snapshot.itable_depth);
    println!("next_inum:     {}", snapshot.next_inum);
    Ok(())
}
