mod bitmap;
mod block_cache;
mod block_dev;
mod efs;
mod error;
mod layout;
mod vfs;

extern crate log;

/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// 块缓存分组(shard)的数量, 块号对其取模决定落在哪个组
pub const BLOCK_CACHE_GROUP: usize = 4096;
/// 每个组中最多同时驻留的块缓存数量
pub const BLOCK_CACHE_WAY: usize = 16;
/// Magic number for sanity check
pub const EFS_MAGIC: u32 = 0x3b800001;
/// The max number of direct inodes
pub const INODE_DIRECT_COUNT: usize = 19;
/// The max length of inode name
pub const NAME_LENGTH_LIMIT: usize = 27;
/// The max number of indirect1 inodes
pub const INODE_INDIRECT1_COUNT: usize = BLOCK_SIZE / 4;
/// The max number of indirect2 inodes
pub const INODE_INDIRECT2_COUNT: usize = INODE_INDIRECT1_COUNT * INODE_INDIRECT1_COUNT;
/// The upper bound of direct inode index
pub const DIRECT_BOUND: usize = INODE_DIRECT_COUNT;
/// The upper bound of indirect1 inode index
pub const INDIRECT1_BOUND: usize = DIRECT_BOUND + INODE_INDIRECT1_COUNT;
/// The upper bound of indirect2 inode index
pub const INDIRECT2_BOUND: usize = INDIRECT1_BOUND + INODE_INDIRECT2_COUNT;
/// 单个文件能够寻址的最大字节数
pub const MAX_FILE_SIZE: usize = INDIRECT2_BOUND * BLOCK_SIZE;
/// 块的 bit 数量
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 目录项的大小
pub const DIRENT_SIZE: usize = 32;
/// 磁盘上 inode 的大小, 每个块容纳 4 个
pub const DISK_INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / DISK_INODE_SIZE;
/// 格式化时 inode 位图默认占用的块数
pub const DEFAULT_INODE_BITMAP_BLOCKS: u32 = 16;

pub use bitmap::Bitmap;
pub use block_cache::{
    block_cache_release, block_cache_sync_all, get_block_cache, DataBlock, OnDisk,
    BLOCK_CACHE_MANAGER,
};
pub use block_dev::BlockDevice;
pub use efs::FileSystem;
pub use error::{FsError, FsResult};
pub use layout::*;
pub use vfs::{Inode, Stat};

#[cfg(test)]
pub use block_dev::MemoryDevice;
