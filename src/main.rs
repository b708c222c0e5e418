use std::{
    fs::{read_dir, File},
    io::{self, Read, Write},
    process,
    sync::Arc,
};

use clap::Parser;
use log::info;

use cli::{Cli, Command};
use device::StripedDevice;
use fs::{BlockDevice, FileSystem, FsError, FsResult, DEFAULT_INODE_BITMAP_BLOCKS};
use session::{OpenFlags, Session};

mod cli;
mod device;
mod fs;
mod session;

#[cfg(test)]
mod test;

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("stripefs: {}", err);
        process::exit(err.errno());
    }
}

fn run(cli: Cli) -> FsResult<()> {
    // 缺失的后备文件先建出来, 新建过就必须格式化
    let paths = device::store_paths(&cli.root, cli.devices);
    let created = device::ensure_stores(&paths, cli.store_size)?;
    let device = Arc::new(StripedDevice::open(&paths, &cli.password)?);
    let total_blocks = device.total_blocks() as u32;
    let block_device: Arc<dyn BlockDevice> = device;

    let mut fs = match &cli.command {
        Command::Format {
            inode_bitmap_blocks,
        } => FileSystem::format(block_device, total_blocks, *inode_bitmap_blocks)?,
        _ if created => {
            FileSystem::format(block_device, total_blocks, DEFAULT_INODE_BITMAP_BLOCKS)?
        }
        _ => FileSystem::open(block_device)?,
    };
    fs.set_user(cli.uid, cli.gid);
    let session = Session::new(fs);

    match cli.command {
        Command::Format { .. } => {}
        Command::Pack { source } => {
            for entry in read_dir(&source)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let mut host_file = File::open(entry.path())?;
                let mut all_data: Vec<u8> = Vec::new();
                host_file.read_to_end(&mut all_data)?;
                put(&session, &format!("/{}", name), &all_data)?;
                info!("packed {} ({} bytes)", name, all_data.len());
            }
            for (name, _) in session.readdir(&session.opendir("/")?)? {
                println!("{}", name);
            }
        }
        Command::Ls { path } => {
            let dir = session.opendir(&path)?;
            for (name, stat) in session.readdir(&dir)? {
                println!(
                    "{:o} {:>3} {:>5} {:>5} {:>10} {}",
                    stat.mode, stat.nlink, stat.uid, stat.gid, stat.size, name
                );
            }
            session.releasedir(dir);
        }
        Command::Cat { path } => {
            let file = session.open(&path, OpenFlags::read_only())?;
            let mut out = io::stdout().lock();
            let mut buffer = [0u8; 4096];
            let mut offset = 0usize;
            loop {
                let len = session.read(&file, offset, &mut buffer)?;
                if len == 0 {
                    break;
                }
                out.write_all(&buffer[..len])?;
                offset += len;
            }
            session.release(file);
        }
        Command::Put { host, path } => {
            let mut all_data: Vec<u8> = Vec::new();
            File::open(&host)?.read_to_end(&mut all_data)?;
            put(&session, &path, &all_data)?;
        }
        Command::Mkdir { path, mode } => session.mkdir(&path, mode)?,
        Command::Rm { path } => {
            if session.getattr(&path)?.is_dir() {
                session.rmdir(&path)?;
            } else {
                session.unlink(&path)?;
            }
        }
        Command::Stat { path } => {
            let stat = session.getattr(&path)?;
            println!("{:#?}", stat);
        }
    }

    session.sync_all();
    Ok(())
}

/// 写入一个完整的文件, 已存在时先截断
fn put(session: &Session, path: &str, data: &[u8]) -> FsResult<()> {
    let file = match session.create(path, 0o644) {
        Ok(file) => file,
        Err(FsError::AlreadyExists) => session.open(
            path,
            OpenFlags {
                truncate: true,
                ..OpenFlags::read_write()
            },
        )?,
        Err(err) => return Err(err),
    };
    session.write(&file, 0, data)?;
    session.release(file);
    Ok(())
}
