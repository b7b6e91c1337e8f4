//! PadOS diagnostic binary: format and inspect FAT images, and exercise
//! the compositor headlessly.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use core_display::FramebufferDriver;
use core_fat::format::{format_volume, FormatParams};
use core_fat::FatFilesystem;
use core_geom::{ColorSpace, IPoint};
use core_server::{
    AppServer, BundleWriter, Envelope, MessageCode, PayloadReader, PayloadWriter, PortRegistry,
};
use core_vfs::{DiskImage, Filesystem, OpenFlags, VolumeFlags};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pados", version, about = "PadOS subsystem tools")]
struct Args {
    /// Optional configuration file path (overrides discovery of `pados.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a FAT filesystem on an image file.
    Mkfs {
        image: PathBuf,
        /// FAT width: 12, 16 or 32.
        #[arg(long, default_value_t = 16)]
        fat: u8,
        /// Total sectors (512 bytes each).
        #[arg(long = "sectors", default_value_t = 20480)]
        total_sectors: u32,
        #[arg(long = "cluster-sectors", default_value_t = 4)]
        sectors_per_cluster: u32,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print volume statistics of a FAT image.
    Fsinfo { image: PathBuf },
    /// List a directory inside a FAT image.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file from a FAT image to stdout.
    Cat { image: PathBuf, path: String },
    /// Run a short headless compositor exercise and report a screen
    /// checksum.
    CompositorDemo,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct ConfigFile {
    #[serde(default)]
    screen: ScreenConfig,
    #[serde(default)]
    log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct ScreenConfig {
    #[serde(default = "ScreenConfig::default_width")]
    width: i32,
    #[serde(default = "ScreenConfig::default_height")]
    height: i32,
}

impl ScreenConfig {
    fn default_width() -> i32 {
        800
    }
    fn default_height() -> i32 {
        480
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
struct LogConfig {
    /// EnvFilter directive, e.g. "info,fat=debug".
    filter: Option<String>,
}

fn load_config(path: Option<&Path>) -> ConfigFile {
    let candidate = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("pados.toml"));
    match std::fs::read_to_string(&candidate) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|err| {
            eprintln!("warning: bad config {}: {err}", candidate.display());
            ConfigFile::default()
        }),
        Err(_) => ConfigFile::default(),
    }
}

fn configure_logging(config: &ConfigFile) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(".", "pados.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = config
        .log
        .filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env().add_directive("info".parse().unwrap()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());
    let _log_guard = configure_logging(&config)?;
    info!(target: "runtime", "startup");

    match args.command {
        Command::Mkfs {
            image,
            fat,
            total_sectors,
            sectors_per_cluster,
            label,
        } => cmd_mkfs(&image, fat, total_sectors, sectors_per_cluster, label.as_deref()),
        Command::Fsinfo { image } => cmd_fsinfo(&image),
        Command::Ls { image, path } => cmd_ls(&image, &path),
        Command::Cat { image, path } => cmd_cat(&image, &path),
        Command::CompositorDemo => cmd_compositor_demo(&config),
    }
}

fn cmd_mkfs(
    image: &Path,
    fat: u8,
    total_sectors: u32,
    sectors_per_cluster: u32,
    label: Option<&str>,
) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(image)
        .with_context(|| format!("creating {}", image.display()))?;
    file.set_len(total_sectors as u64 * 512)?;
    drop(file);

    let device = DiskImage::open(image)?;
    let mut params = FormatParams {
        fat_bits: fat,
        total_sectors,
        sectors_per_cluster,
        ..FormatParams::default()
    };
    if let Some(label) = label {
        let mut padded = *b"           ";
        for (i, b) in label.bytes().take(11).enumerate() {
            padded[i] = b.to_ascii_uppercase();
        }
        params.volume_label = Some(padded);
    }
    format_volume(&device, &params).map_err(|err| anyhow!("format failed: {err}"))?;
    println!("formatted {} as FAT{fat}, {total_sectors} sectors", image.display());
    Ok(())
}

fn open_volume(image: &Path) -> Result<(FatFilesystem, Arc<core_fat::FatVolume>)> {
    let device = Arc::new(DiskImage::open(image)?);
    let fs = FatFilesystem::new();
    let volume = fs
        .mount(device, &image.display().to_string(), VolumeFlags::empty())
        .map_err(|err| anyhow!("mount failed: {err}"))?;
    Ok((fs, volume))
}

/// Walk an absolute path to its inode.
fn resolve_path(
    fs: &FatFilesystem,
    volume: &Arc<core_fat::FatVolume>,
    path: &str,
) -> Result<Arc<std::sync::Mutex<core_fat::FatInode>>> {
    let mut inode = volume.root_inode();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        inode = fs
            .locate_inode(volume, &inode, part)
            .map_err(|err| anyhow!("{part}: {err}"))?;
    }
    Ok(inode)
}

fn cmd_fsinfo(image: &Path) -> Result<()> {
    let (fs, volume) = open_volume(image)?;
    let stat = fs.read_fs_stat(&volume).map_err(|err| anyhow!("{err}"))?;
    println!("volume:        {}", stat.volume_name);
    println!("device:        {}", stat.device_path);
    println!("block size:    {}", stat.block_size);
    println!("total blocks:  {}", stat.total_blocks);
    println!("free blocks:   {}", stat.free_blocks);
    println!("flags:         {:?}", stat.flags);
    fs.unmount(&volume).map_err(|err| anyhow!("{err}"))?;
    Ok(())
}

fn cmd_ls(image: &Path, path: &str) -> Result<()> {
    let (fs, volume) = open_volume(image)?;
    let inode = resolve_path(&fs, &volume, path)?;
    let mut dir = fs
        .open_directory(&volume, &inode)
        .map_err(|err| anyhow!("{err}"))?;
    while let Some(entry) = fs
        .read_directory(&volume, &mut dir)
        .map_err(|err| anyhow!("{err}"))?
    {
        let kind = if entry.is_directory { "d" } else { "-" };
        println!("{kind} {:>16x} {}", entry.inode_id, entry.name);
    }
    fs.unmount(&volume).map_err(|err| anyhow!("{err}"))?;
    Ok(())
}

fn cmd_cat(image: &Path, path: &str) -> Result<()> {
    let (fs, volume) = open_volume(image)?;
    let inode = resolve_path(&fs, &volume, path)?;
    let mut file = fs
        .open_file(&volume, &inode, OpenFlags::empty())
        .map_err(|err| anyhow!("{err}"))?;
    let mut position = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];
    use std::io::Write;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    loop {
        let read = fs
            .read(&volume, &mut file, &mut buffer, position)
            .map_err(|err| anyhow!("{err}"))?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])?;
        position += read as u64;
    }
    fs.unmount(&volume).map_err(|err| anyhow!("{err}"))?;
    Ok(())
}

/// Register one application, build two overlapping views, paint, and
/// checksum the framebuffer. Useful as a smoke test on new ports of the
/// display driver.
fn cmd_compositor_demo(config: &ConfigFile) -> Result<()> {
    let ports = PortRegistry::new();
    let driver = FramebufferDriver::new(
        IPoint::new(config.screen.width, config.screen.height),
        ColorSpace::Rgb16,
    );
    let mut server = AppServer::new(Box::new(driver), ports.clone());

    let (client_port, client_rx) = ports.create_port(64);

    // Register.
    let mut payload = PayloadWriter::new();
    payload.put_u32(client_port).put_u32(client_port).put_str("demo");
    server.handle_message(Envelope {
        target_handler: -1,
        code: MessageCode::RegisterApplication as i32,
        payload: payload.into_bytes(),
    });
    let reply = client_rx
        .recv_timeout(Duration::from_secs(1))
        .context("no registration reply")?;
    let app = PayloadReader::new(&reply.payload)
        .i32()
        .context("bad registration reply")?;

    // Create a root-level view and a child, then fill them.
    let mut bundle = BundleWriter::new();
    let mut create = PayloadWriter::new();
    create
        .put_u32(client_port)
        .put_u32(client_port)
        .put_i32(1000)
        .put_i32(-1)
        .put_i32(1) // root-level
        .put_i32(-1)
        .put_str("demo-view")
        .put_rect(core_geom::Rect::new(10.0, 10.0, 300.0, 200.0))
        .put_point(core_geom::Point::new(0.0, 0.0))
        .put_u32(0)
        .put_i32(0)
        .put_i32(0)
        .put_i32(0)
        .put_f32(1.0)
        .put_i32(2)
        .put_color(core_geom::Color::rgb(20, 20, 20))
        .put_color(core_geom::Color::rgb(0, 0, 0))
        .put_color(core_geom::Color::rgb(255, 255, 255));
    bundle.push(app, MessageCode::CreateView, &create.into_bytes());
    server.handle_message(Envelope {
        target_handler: app,
        code: MessageCode::MessageBundle as i32,
        payload: bundle.into_bytes(),
    });

    let reply = client_rx
        .recv_timeout(Duration::from_secs(1))
        .context("no create-view reply")?;
    let view = PayloadReader::new(&reply.payload)
        .i32()
        .context("bad create-view reply")?;
    if view < 0 {
        bail!("view creation failed");
    }

    let mut bundle = BundleWriter::new();
    let mut fill = PayloadWriter::new();
    fill.put_rect(core_geom::Rect::new(0.0, 0.0, 290.0, 190.0))
        .put_color(core_geom::Color::rgb(200, 60, 20));
    bundle.push(view, MessageCode::ViewFillRect, &fill.into_bytes());
    server.handle_message(Envelope {
        target_handler: app,
        code: MessageCode::MessageBundle as i32,
        payload: bundle.into_bytes(),
    });

    let checksum: u64 = server
        .screen
        .bitmap
        .raster()
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));
    println!(
        "screen {}x{} checksum {checksum:#018x}",
        config.screen.width, config.screen.height
    );
    Ok(())
}
