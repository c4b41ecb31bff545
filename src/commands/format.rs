use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use versfs_core::{FileDevice, Mount, MountConfig};

#[derive(Parser, Debug)]
#[command(about = "Format a new volume")]
struct Cli {
    /// Path to the backing file. Created (or truncated) if missing.
    device: PathBuf,

    /// Log2 of the block size.
    #[arg(long, default_value_t = 12)]
    block_bits: u32,

    /// Volume size in blocks.
    #[arg(long, default_value_t = 4096)]
    blocks: u64,

    /// Buffer pool size, in blocks.
    #[arg(long)]
    pool_size: Option<usize>,
}

pub fn cmd_format(argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let len_bytes = cli.blocks << cli.block_bits;
    let device = FileDevice::create(&cli.device, cli.block_bits, len_bytes)
        .with_context(|| format!("creating {}", cli.device.display()))?;

    let mut config = MountConfig::new(cli.block_bits);
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }

    Mount::format_volume(Box::new(device), cli.blocks, config)
        .with_context(|| format!("formatting {}", cli.device.display()))?;

    log::info!("formatted {} ({} blocks, block_bits={})", cli.device.display(), cli.blocks, cli.block_bits);
    Ok(())
}
