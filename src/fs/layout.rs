//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 三个数据结构 [`SuperBlock`], [`DiskInode`], [`DirEntry`]
//!
//! 在 fs 磁盘布局中, 按照块编号从小到大顺序地分成 5 个不同属性的连续区域:
//!
//! - 最开始的区域的长度为一个块, 其内容是超级块 ([`SuperBlock`])
//!   超级块内以 魔数 的形式提供了文件系统合法性检查功能, 同时还可以定位其他连续区域的位置
//!
//! - 第二个区域是一个索引节点位图, 长度为若干个块
//!
//! - 第三个区域是索引节点区域, 长度为若干个块, 其中的每个块都存储了 4 个索引节点
//!
//! - 第四个区域是一个数据块位图, 长度为若干个块
//!
//! - 最后的区域则是数据块区域
//!   其中的每一个已经分配出去的块保存了文件或目录中的具体数据内容, 或者是索引块.
//!
//! 所有结构都以小端序显式编解码 (见 [`OnDisk`]), 不依赖内存布局.

use std::sync::Arc;

use chrono::Utc;

use super::{
    get_block_cache, BlockDevice, DataBlock, OnDisk, BLOCK_SIZE, DIRENT_SIZE, DISK_INODE_SIZE,
    EFS_MAGIC, INDIRECT1_BOUND, INDIRECT2_BOUND, INODE_DIRECT_COUNT, INODE_INDIRECT1_COUNT,
    MAX_FILE_SIZE, NAME_LENGTH_LIMIT,
};

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

fn write_i64(bytes: &mut [u8], offset: usize, value: i64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// 单个块号, 用于只读写索引块中的某一项
impl OnDisk for u32 {
    const SIZE: usize = 4;

    fn decode(bytes: &[u8]) -> Self {
        read_u32(bytes, 0)
    }

    fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, *self);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperBlock {
    magic: u32, // 用于文件系统合法性验证的魔数
    pub total_blocks: u32,
    pub inode_bitmap_blocks: u32,
    pub inode_area_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub data_area_blocks: u32,
}

/// SuperBlock 是一个磁盘上数据结构, 它就存放在磁盘上编号为 0 的块的起始处
impl SuperBlock {
    /// 各个区域的块数是以参数的形式传入进来的, 它们的划分由 FileSystem::format 完成
    pub fn initialize(
        &mut self,
        total_blocks: u32,
        inode_bitmap_blocks: u32,
        inode_area_blocks: u32,
        data_bitmap_blocks: u32,
        data_area_blocks: u32,
    ) {
        *self = Self {
            magic: EFS_MAGIC,
            total_blocks,
            inode_bitmap_blocks,
            inode_area_blocks,
            data_bitmap_blocks,
            data_area_blocks,
        };
    }

    /// is_valid 可以通过魔数判断超级块所在的文件系统是否合法
    pub fn is_valid(&self) -> bool {
        self.magic == EFS_MAGIC
    }

    pub fn inode_area_start_block(&self) -> u32 {
        1 + self.inode_bitmap_blocks
    }

    pub fn data_bitmap_start_block(&self) -> u32 {
        self.inode_area_start_block() + self.inode_area_blocks
    }

    pub fn data_area_start_block(&self) -> u32 {
        self.data_bitmap_start_block() + self.data_bitmap_blocks
    }
}

impl OnDisk for SuperBlock {
    const SIZE: usize = 24;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            magic: read_u32(bytes, 0),
            total_blocks: read_u32(bytes, 4),
            inode_bitmap_blocks: read_u32(bytes, 8),
            inode_area_blocks: read_u32(bytes, 12),
            data_bitmap_blocks: read_u32(bytes, 16),
            data_area_blocks: read_u32(bytes, 20),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.magic);
        write_u32(bytes, 4, self.total_blocks);
        write_u32(bytes, 8, self.inode_bitmap_blocks);
        write_u32(bytes, 12, self.inode_area_blocks);
        write_u32(bytes, 16, self.data_bitmap_blocks);
        write_u32(bytes, 20, self.data_area_blocks);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiskInodeType {
    File,
    Directory,
}

/// 索引块 IndirectBlock 实质上是一个 u32 数组, 每个都指向一个下一级索引块或者数据块
pub type IndirectBlock = [u32; INODE_INDIRECT1_COUNT]; // size = 512B / 4B(u32) = 128

impl OnDisk for IndirectBlock {
    const SIZE: usize = BLOCK_SIZE;

    fn decode(bytes: &[u8]) -> Self {
        let mut block = [0u32; INODE_INDIRECT1_COUNT];
        for (i, id) in block.iter_mut().enumerate() {
            *id = read_u32(bytes, i * 4);
        }
        block
    }

    fn encode(&self, bytes: &mut [u8]) {
        for (i, id) in self.iter().enumerate() {
            write_u32(bytes, i * 4, *id);
        }
    }
}

/// 权限检查的种类
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// (属主, 同组, 其他) 三类用户对应的权限位
    fn bits(self) -> (u32, u32, u32) {
        match self {
            Access::Read => (
                libc::S_IRUSR as u32,
                libc::S_IRGRP as u32,
                libc::S_IROTH as u32,
            ),
            Access::Write => (
                libc::S_IWUSR as u32,
                libc::S_IWGRP as u32,
                libc::S_IWOTH as u32,
            ),
            Access::Execute => (
                libc::S_IXUSR as u32,
                libc::S_IXGRP as u32,
                libc::S_IXOTH as u32,
            ),
        }
    }
}

/// root 总是放行; 否则按 属主 -> 同组 -> 其他 选出唯一匹配的一类, 看这一类的权限位
pub fn have_permission(
    mode: u32,
    owner_uid: u32,
    owner_gid: u32,
    uid: u32,
    gid: u32,
    access: Access,
) -> bool {
    if uid == 0 {
        return true;
    }
    let (usr, grp, oth) = access.bits();
    let bit = if uid == owner_uid {
        usr
    } else if gid == owner_gid {
        grp
    } else {
        oth
    };
    mode & bit != 0
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// 每个 文件/目录 在磁盘上均以一个 DiskInode 的形式存储, 大小固定为 128 字节:
///
/// | 偏移 | 字段 |
/// |---|---|
/// | 0 | size |
/// | 4 | direct[19] |
/// | 80 | indirect1 |
/// | 84 | indirect2 |
/// | 88 | nlink, uid, gid, mode, type, dirent_num |
/// | 112 | atime |
/// | 120 | ctime |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskInode {
    /// 文件/目录内容的字节数
    pub size: u32,
    /// 直接索引块(号组), 最多指向 INODE_DIRECT_COUNT 个数据块
    pub direct: [u32; INODE_DIRECT_COUNT],
    /// 一级间接索引块(号), 它指向的索引块中最多有 128 个数据块号
    pub indirect1: u32,
    /// 二级间接索引块(号), 它指向的索引块中每一项又指向一个一级索引块
    pub indirect2: u32,
    /// 硬链接数
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// 权限位 (不含文件类型位)
    pub mode: u32,
    pub type_: DiskInodeType,
    /// 目录中仍然有效的目录项数量, 只对目录有意义
    pub dirent_num: u32,
    pub atime: i64,
    pub ctime: i64,
}

impl OnDisk for DiskInode {
    const SIZE: usize = DISK_INODE_SIZE;

    fn decode(bytes: &[u8]) -> Self {
        let mut direct = [0u32; INODE_DIRECT_COUNT];
        for (i, id) in direct.iter_mut().enumerate() {
            *id = read_u32(bytes, 4 + i * 4);
        }
        Self {
            size: read_u32(bytes, 0),
            direct,
            indirect1: read_u32(bytes, 80),
            indirect2: read_u32(bytes, 84),
            nlink: read_u32(bytes, 88),
            uid: read_u32(bytes, 92),
            gid: read_u32(bytes, 96),
            mode: read_u32(bytes, 100),
            type_: match read_u32(bytes, 104) {
                1 => DiskInodeType::Directory,
                _ => DiskInodeType::File,
            },
            dirent_num: read_u32(bytes, 108),
            atime: read_i64(bytes, 112),
            ctime: read_i64(bytes, 120),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        write_u32(bytes, 0, self.size);
        for (i, id) in self.direct.iter().enumerate() {
            write_u32(bytes, 4 + i * 4, *id);
        }
        write_u32(bytes, 80, self.indirect1);
        write_u32(bytes, 84, self.indirect2);
        write_u32(bytes, 88, self.nlink);
        write_u32(bytes, 92, self.uid);
        write_u32(bytes, 96, self.gid);
        write_u32(bytes, 100, self.mode);
        let type_ = match self.type_ {
            DiskInodeType::File => 0,
            DiskInodeType::Directory => 1,
        };
        write_u32(bytes, 104, type_);
        write_u32(bytes, 108, self.dirent_num);
        write_i64(bytes, 112, self.atime);
        write_i64(bytes, 120, self.ctime);
    }
}

impl DiskInode {
    pub fn initialize(&mut self, type_: DiskInodeType) {
        let time = now();
        self.size = 0;
        self.direct.iter_mut().for_each(|x| *x = 0);
        self.indirect1 = 0;
        self.indirect2 = 0;
        self.nlink = 1;
        self.uid = 0;
        self.gid = 0;
        self.mode = 0o777;
        self.type_ = type_;
        self.dirent_num = 0;
        self.atime = time;
        self.ctime = time;
    }

    pub fn is_dir(&self) -> bool {
        self.type_ == DiskInodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.type_ == DiskInodeType::File
    }

    pub fn refresh_atime(&mut self) {
        self.atime = now();
    }

    pub fn refresh_ctime(&mut self) {
        self.ctime = now();
    }

    pub fn permit(&self, uid: u32, gid: u32, access: Access) -> bool {
        have_permission(self.mode, self.uid, self.gid, uid, gid, access)
    }

    /// 计算为了容纳自身 size 字节的内容需要多少个数据块
    pub fn data_blocks(&self) -> u32 {
        Self::_data_blocks(self.size)
    }

    fn _data_blocks(size: u32) -> u32 {
        (size as usize).div_ceil(BLOCK_SIZE) as u32
    }

    /// 容纳 size 字节所需的全部块数: 数据块加上索引块
    pub fn total_blocks(size: u32) -> u32 {
        let data_blocks = Self::_data_blocks(size) as usize;
        let mut total = data_blocks;
        if data_blocks > INODE_DIRECT_COUNT {
            // 一级索引
            total += 1;
        }
        if data_blocks > INDIRECT1_BOUND {
            // 二级索引, 以及挂在它下面的一级子索引
            total += 1;
            total += (data_blocks - INDIRECT1_BOUND).div_ceil(INODE_INDIRECT1_COUNT);
        }
        total as u32
    }

    /// 把 size 扩到 new_size 额外需要多少个数据和索引块
    pub fn blocks_needed_for(&self, new_size: u32) -> u32 {
        assert!(new_size >= self.size);
        Self::total_blocks(new_size) - Self::total_blocks(self.size)
    }

    /// 文件内第 inner_id 个数据块在设备上的块编号
    pub fn resolve_block(&self, inner_id: u32, block_device: &Arc<dyn BlockDevice>) -> u32 {
        let inner_id = inner_id as usize;
        if inner_id < INODE_DIRECT_COUNT {
            self.direct[inner_id]
        } else if inner_id < INDIRECT1_BOUND {
            get_block_cache(self.indirect1 as usize, block_device, None)
                .read((inner_id - INODE_DIRECT_COUNT) * 4, |id: &u32| *id)
        } else {
            assert!(inner_id < INDIRECT2_BOUND, "block index {} unreachable", inner_id);
            let last = inner_id - INDIRECT1_BOUND;
            // 先查二级索引块找到挂在它下面的一级子索引块, 再通过一级子索引块找到数据块
            let indirect1 = get_block_cache(self.indirect2 as usize, block_device, None)
                .read(last / INODE_INDIRECT1_COUNT * 4, |id: &u32| *id);
            get_block_cache(indirect1 as usize, block_device, None)
                .read(last % INODE_INDIRECT1_COUNT * 4, |id: &u32| *id)
        }
    }

    /// 扩容到 new_size.
    ///
    /// new_blocks 由上层事先分配好, 数量恰为 blocks_needed_for(new_size),
    /// 按 直接索引 -> 一级索引块 -> 一级索引项 -> 二级索引块 -> (一级子索引块, 其索引项)... 的顺序消耗.
    pub fn grow(
        &mut self,
        new_size: u32,
        new_blocks: Vec<u32>,
        block_device: &Arc<dyn BlockDevice>,
    ) {
        assert!(new_size >= self.size && new_size as usize <= MAX_FILE_SIZE);
        let mut current_blocks = self.data_blocks() as usize;
        self.size = new_size;
        let mut total_blocks = self.data_blocks() as usize;
        let mut new_blocks = new_blocks.into_iter();
        let mut next = move || new_blocks.next().expect("not enough blocks for growth");

        // 填充直接索引
        while current_blocks < total_blocks.min(INODE_DIRECT_COUNT) {
            self.direct[current_blocks] = next();
            current_blocks += 1;
        }

        // 分配一级索引
        if total_blocks <= INODE_DIRECT_COUNT {
            return;
        }
        if current_blocks == INODE_DIRECT_COUNT {
            self.indirect1 = next();
        }
        current_blocks -= INODE_DIRECT_COUNT;
        total_blocks -= INODE_DIRECT_COUNT;

        // 填充一级索引
        if current_blocks < total_blocks.min(INODE_INDIRECT1_COUNT) {
            get_block_cache(self.indirect1 as usize, block_device, None).modify_and_sync(
                0,
                |indirect1: &mut IndirectBlock| {
                    while current_blocks < total_blocks.min(INODE_INDIRECT1_COUNT) {
                        indirect1[current_blocks] = next();
                        current_blocks += 1;
                    }
                },
            );
        }

        // 分配二级索引
        if total_blocks <= INODE_INDIRECT1_COUNT {
            return;
        }
        if current_blocks == INODE_INDIRECT1_COUNT {
            self.indirect2 = next();
        }
        current_blocks -= INODE_INDIRECT1_COUNT;
        total_blocks -= INODE_INDIRECT1_COUNT;

        // 填充二级索引: 从 (a0, b0) 填到 (a1, b1)
        let mut a0 = current_blocks / INODE_INDIRECT1_COUNT;
        let mut b0 = current_blocks % INODE_INDIRECT1_COUNT;
        let a1 = total_blocks / INODE_INDIRECT1_COUNT;
        let b1 = total_blocks % INODE_INDIRECT1_COUNT;
        let indirect2 = get_block_cache(self.indirect2 as usize, block_device, None);
        while a0 < a1 || (a0 == a1 && b0 < b1) {
            let child = if b0 == 0 {
                // 新的一级子索引块
                let child = next();
                indirect2.modify_and_sync(a0 * 4, |id: &mut u32| *id = child);
                child
            } else {
                indirect2.read(a0 * 4, |id: &u32| *id)
            };
            let end = if a0 < a1 { INODE_INDIRECT1_COUNT } else { b1 };
            get_block_cache(child as usize, block_device, None).modify_and_sync(
                0,
                |indirect1: &mut IndirectBlock| {
                    while b0 < end {
                        indirect1[b0] = next();
                        b0 += 1;
                    }
                },
            );
            if b0 == INODE_INDIRECT1_COUNT {
                b0 = 0;
                a0 += 1;
            }
        }
    }

    /// 清空文件的内容: 大小清零, 所有数据块和索引块的编号收集起来交给上层回收
    pub fn shrink_to_zero(&mut self, block_device: &Arc<dyn BlockDevice>) -> Vec<u32> {
        let mut v: Vec<u32> = Vec::new();
        let mut data_blocks = self.data_blocks() as usize;
        self.size = 0;

        // 回收直接索引
        for id in self.direct.iter_mut().take(data_blocks) {
            v.push(*id);
            *id = 0;
        }

        // 回收一级索引块
        if data_blocks <= INODE_DIRECT_COUNT {
            return v;
        }
        v.push(self.indirect1);
        data_blocks -= INODE_DIRECT_COUNT;
        get_block_cache(self.indirect1 as usize, block_device, None).read(
            0,
            |indirect1: &IndirectBlock| {
                v.extend_from_slice(&indirect1[..data_blocks.min(INODE_INDIRECT1_COUNT)]);
            },
        );
        self.indirect1 = 0;

        // 回收二级索引块
        if data_blocks <= INODE_INDIRECT1_COUNT {
            return v;
        }
        v.push(self.indirect2);
        data_blocks -= INODE_INDIRECT1_COUNT;
        let children = get_block_cache(self.indirect2 as usize, block_device, None)
            .read(0, |indirect2: &IndirectBlock| *indirect2);
        let mut remaining = data_blocks;
        for child in children.iter().take(data_blocks.div_ceil(INODE_INDIRECT1_COUNT)) {
            let count = remaining.min(INODE_INDIRECT1_COUNT);
            v.push(*child);
            get_block_cache(*child as usize, block_device, None).read(
                0,
                |indirect1: &IndirectBlock| v.extend_from_slice(&indirect1[..count]),
            );
            remaining -= count;
        }
        self.indirect2 = 0;
        v
    }

    /// 将文件内容从 offset 字节开始的部分读到内存中的缓冲区 buf 中, 并返回实际读到的字节数
    ///
    /// 如果文件剩下的内容还足够多, 那么缓冲区会被填满;否则文件剩下的全部内容都会被读到缓冲区中
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
        block_device: &Arc<dyn BlockDevice>,
        owner: Option<u32>,
    ) -> usize {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.size as usize);
        if start >= end {
            return 0;
        }
        let mut start_block = start / BLOCK_SIZE;
        let mut read_size = 0usize;

        // 遍历位于字节区间 [start, end) 中间的那些块, 将其中的部分内容复制到缓冲区 buf 中适当的区域
        loop {
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_read_size = end_current_block - start;
            let dst = &mut buf[read_size..read_size + block_read_size];
            get_block_cache(
                self.resolve_block(start_block as u32, block_device) as usize,
                block_device,
                owner,
            )
            .read(0, |data_block: &DataBlock| {
                let src = &data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_read_size];
                dst.copy_from_slice(src);
            });
            read_size += block_read_size;

            if end_current_block == end {
                break;
            }
            start_block += 1;
            start = end_current_block;
        }
        read_size
    }

    /// 将数据写入已经分配好的范围, 超出 size 的部分会被截掉,
    /// 需要调用者在调用 write_at 之前提前 grow.
    ///
    /// owner 为 None 时 (目录内容等元数据) 每块立刻写回, 否则只标记为脏, 留给 fsync/替换时写回.
    pub fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        block_device: &Arc<dyn BlockDevice>,
        owner: Option<u32>,
    ) -> usize {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.size as usize);
        if start >= end {
            return 0;
        }
        let mut start_block = start / BLOCK_SIZE;
        let mut write_size = 0usize;

        loop {
            let end_current_block = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_write_size = end_current_block - start;
            let src = &buf[write_size..write_size + block_write_size];
            let copy = |data_block: &mut DataBlock| {
                data_block[start % BLOCK_SIZE..start % BLOCK_SIZE + block_write_size]
                    .copy_from_slice(src);
            };
            let cache = get_block_cache(
                self.resolve_block(start_block as u32, block_device) as usize,
                block_device,
                owner,
            );
            match owner {
                None => cache.modify_and_sync(0, copy),
                Some(_) => cache.modify(0, copy),
            }
            write_size += block_write_size;

            if end_current_block == end {
                break;
            }
            start_block += 1;
            start = end_current_block;
        }
        self.refresh_ctime();
        write_size
    }
}

/// 目录项
///
/// 它自身占据空间 32 字节, 每个数据块可以存储 16 个目录项.
/// 名字为空的目录项是被删除后留下的空位, 遍历时需要跳过.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DirEntry {
    /// 最大允许保存长度为 27 的文件/目录名 (数组 name 中最末的一个字节留给 '\0')
    name: [u8; NAME_LENGTH_LIMIT + 1], // 28B
    inode_id: u32, // 4B
}

impl OnDisk for DirEntry {
    const SIZE: usize = DIRENT_SIZE;

    fn decode(bytes: &[u8]) -> Self {
        let mut name = [0u8; NAME_LENGTH_LIMIT + 1];
        name.copy_from_slice(&bytes[..NAME_LENGTH_LIMIT + 1]);
        Self {
            name,
            inode_id: read_u32(bytes, NAME_LENGTH_LIMIT + 1),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..NAME_LENGTH_LIMIT + 1].copy_from_slice(&self.name);
        write_u32(bytes, NAME_LENGTH_LIMIT + 1, self.inode_id);
    }
}

impl DirEntry {
    /// 创建一个空的目录项
    pub fn create_empty() -> Self {
        Self {
            name: [0; NAME_LENGTH_LIMIT + 1],
            inode_id: 0,
        }
    }

    /// 通过文件名和 inode 编号创建一个目录项, 名字长度由调用者事先检查
    pub fn new(name: &str, inode_id: u32) -> Self {
        assert!(name.len() <= NAME_LENGTH_LIMIT, "name {:?} too long", name);
        let mut name_bytes = [0; NAME_LENGTH_LIMIT + 1];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: name_bytes,
            inode_id,
        }
    }

    /// 序列化成 read_at/write_at 所需的字节形式
    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut bytes = [0u8; DIRENT_SIZE];
        self.encode(&mut bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DIRENT_SIZE]) -> Self {
        Self::decode(bytes)
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LENGTH_LIMIT);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    pub fn inode_id(&self) -> u32 {
        self.inode_id
    }
}
