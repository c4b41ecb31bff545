use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use versfs_core::{FileDevice, Mount, MountConfig};

#[derive(Parser, Debug)]
#[command(about = "Format a scratch volume, round-trip a file through it, and verify persistence")]
struct Cli {
    #[arg(long, default_value_t = 12)]
    block_bits: u32,

    #[arg(long, default_value_t = 256)]
    blocks: u64,
}

pub fn cmd_selftest(argv: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(argv);

    let mut path: PathBuf = std::env::temp_dir();
    path.push(format!("versfs-selftest-{}.img", std::process::id()));

    let result = run(&cli, &path);
    let _ = std::fs::remove_file(&path);
    result
}

fn run(cli: &Cli, path: &PathBuf) -> Result<()> {
    let payload = b"the quick brown fox jumps over the lazy dog";

    let device = FileDevice::create(path, cli.block_bits, cli.blocks << cli.block_bits)
        .with_context(|| format!("creating {}", path.display()))?;
    let config = MountConfig::new(cli.block_bits);
    let mut mount = Mount::format_volume(Box::new(device), cli.blocks, config)
        .context("formatting scratch volume")?;

    let mut inode = mount.create_inode(0o100644).context("creating inode")?;
    let written = inode.write_at(&mut mount, 0, payload).context("writing inode data")?;
    ensure!(written == payload.len(), "short write: wrote {written} of {} bytes", payload.len());
    mount.save_inode(&inode).context("saving inode")?;
    mount.commit().context("committing format delta")?;
    let inum = inode.inum;
    drop(mount);

    let device = FileDevice::open(path, cli.block_bits)
        .with_context(|| format!("reopening {}", path.display()))?;
    let config = MountConfig::new(cli.block_bits);
    let mut mount = Mount::open(Box::new(device), config).context("reopening scratch volume")?;

    let inode = mount
        .load_inode(inum)
        .context("loading inode")?
        .with_context(|| format!("inode {inum} missing after reopen"))?;
    ensure!(inode.record.size == payload.len() as u64, "persisted size mismatch");

    let mut buf = vec![0u8; payload.len()];
    let read = inode.read_at(&mut mount, 0, &mut buf).context("reading inode data")?;
    ensure!(read == payload.len(), "short read: read {read} of {} bytes", payload.len());
    ensure!(buf == payload, "round-tripped bytes do not match what was written");

    log::info!("selftest passed: {} bytes round-tripped through inode {inum}", payload.len());
    Ok(())
}
