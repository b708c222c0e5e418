use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::fs::DEFAULT_INODE_BITMAP_BLOCKS;

#[derive(Parser)]
#[command(name = "stripefs", about = "Striped, encrypted block filesystem")]
pub struct Cli {
    /// Store path prefix, stores are <root>0 .. <root>N-1
    #[arg(long, default_value = "/tmp/disk")]
    pub root: String,

    /// Number of backing stores
    #[arg(long, default_value_t = 4)]
    pub devices: usize,

    /// Size in bytes of each newly created store
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    pub store_size: u64,

    /// Passphrase the block key is derived from
    #[arg(long, short, default_value = "")]
    pub password: String,

    /// Caller uid for permission checks
    #[arg(long, default_value_t = 0)]
    pub uid: u32,

    /// Caller gid for permission checks
    #[arg(long, default_value_t = 0)]
    pub gid: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Format the stores, destroying their contents
    Format {
        #[arg(long, default_value_t = DEFAULT_INODE_BITMAP_BLOCKS)]
        inode_bitmap_blocks: u32,
    },
    /// Copy every regular file of a host directory into the root directory
    Pack {
        #[arg(long, short)]
        source: PathBuf,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Copy a host file in
    Put { host: PathBuf, path: String },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(long, default_value_t = 0o755)]
        mode: u32,
    },
    /// Remove a file or an empty directory
    Rm { path: String },
    /// Show attributes
    Stat { path: String },
}
