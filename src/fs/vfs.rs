//! FileSystem 实现了磁盘布局并能够将磁盘块有效的管理起来.
//! 但是对于文件系统的使用者而言, 他们往往不关心磁盘布局是如何实现的, 而是更希望能够直接看到目录树结构中逻辑上的文件和目录.
//! 为此需要设计索引节点 Inode 暴露给文件系统的使用者, 让他们能够直接对文件和目录进行操作.
//!
//! DiskInode 放在磁盘块中比较固定的位置, 而 Inode 是放在内存中的记录文件索引节点信息的数据结构.
//! Inode 只是一个轻量的句柄 (inode 编号 + 所在位置), 不持有文件系统的引用,
//! 需要分配或回收块的操作由调用者把 [`FileSystem`] 显式传进来.

use std::sync::Arc;

use log::error;

use super::{
    get_block_cache, Access, BlockDevice, DirEntry, DiskInode, DiskInodeType, FileSystem,
    FsError, FsResult, BLOCK_CACHE_MANAGER, BLOCK_SIZE, DIRENT_SIZE, MAX_FILE_SIZE,
    NAME_LENGTH_LIMIT,
};

/// POSIX 风格的文件属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    /// 权限位与 S_IFDIR / S_IFREG 的组合
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blksize: u32,
    /// 占用的块数, 包括索引块
    pub blocks: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

#[derive(Clone)]
pub struct Inode {
    inode_id: u32,
    /// 位于哪个盘块
    block_id: usize,
    /// 盘块上的偏移
    block_offset: usize,
    block_device: Arc<dyn BlockDevice>,
}

impl Inode {
    pub fn new(
        inode_id: u32,
        block_id: u32,
        block_offset: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            inode_id,
            block_id: block_id as usize,
            block_offset,
            block_device,
        }
    }

    pub fn inode_id(&self) -> u32 {
        self.inode_id
    }

    // 仿照 BlockCache::read/modify,
    // 用两个方法来简化对于 Inode 对应的磁盘上的 DiskInode 的访问流程

    /// 在磁盘 inode 上调用一个函数来读取它
    fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        get_block_cache(self.block_id, &self.block_device, None).read(self.block_offset, f)
    }

    /// 在磁盘 inode 上调用一个函数来修改它, 返回前写回磁盘
    fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        get_block_cache(self.block_id, &self.block_device, None)
            .modify_and_sync(self.block_offset, f)
    }

    /// 取一份 DiskInode 的快照, 之后的读取不必再持有 inode 所在块的锁
    fn disk_inode(&self) -> DiskInode {
        self.read_disk_inode(|disk_inode| disk_inode.clone())
    }

    pub fn is_dir(&self) -> bool {
        self.read_disk_inode(|disk_inode| disk_inode.is_dir())
    }

    pub fn is_file(&self) -> bool {
        self.read_disk_inode(|disk_inode| disk_inode.is_file())
    }

    pub fn size(&self) -> usize {
        self.read_disk_inode(|disk_inode| disk_inode.size as usize)
    }

    pub fn get_nlink(&self) -> u32 {
        self.read_disk_inode(|disk_inode| disk_inode.nlink)
    }

    pub fn get_dirent_num(&self) -> u32 {
        self.read_disk_inode(|disk_inode| disk_inode.dirent_num)
    }

    /// (mode, uid, gid)
    pub fn get_permission(&self) -> (u32, u32, u32) {
        self.read_disk_inode(|disk_inode| (disk_inode.mode, disk_inode.uid, disk_inode.gid))
    }

    pub fn permit(&self, uid: u32, gid: u32, access: Access) -> bool {
        self.read_disk_inode(|disk_inode| disk_inode.permit(uid, gid, access))
    }

    pub fn permit_r(&self, uid: u32, gid: u32) -> bool {
        self.permit(uid, gid, Access::Read)
    }

    pub fn permit_w(&self, uid: u32, gid: u32) -> bool {
        self.permit(uid, gid, Access::Write)
    }

    pub fn permit_x(&self, uid: u32, gid: u32) -> bool {
        self.permit(uid, gid, Access::Execute)
    }

    /// 依次读出目录中每一个槽位 (包括已删除留下的空位) 的目录项
    fn dir_entries<'a>(
        &'a self,
        disk_inode: &'a DiskInode,
    ) -> impl Iterator<Item = (usize, DirEntry)> + 'a {
        assert!(disk_inode.is_dir()); // 一定是目录
        let file_count = (disk_inode.size as usize) / DIRENT_SIZE;
        (0..file_count).map(move |i| {
            let mut bytes = [0u8; DIRENT_SIZE];
            assert_eq!(
                disk_inode.read_at(DIRENT_SIZE * i, &mut bytes, &self.block_device, None),
                DIRENT_SIZE,
            );
            (i, DirEntry::from_bytes(&bytes))
        })
    }

    /// 根据名称查找磁盘 inode 下的 inode, 返回其编号和所在槽位
    fn find_dir_entry(&self, name: &str, disk_inode: &DiskInode) -> Option<(usize, u32)> {
        if name.is_empty() {
            return None;
        }
        self.dir_entries(disk_inode)
            .find(|(_, dir_entry)| dir_entry.name() == name)
            .map(|(i, dir_entry)| (i, dir_entry.inode_id()))
    }

    /// 在目录中按名字查找, 找到后生成一个新的 Inode 句柄用于后续对文件的访问
    pub fn find(&self, name: &str, fs: &FileSystem) -> Option<Inode> {
        let disk_inode = self.disk_inode();
        self.find_dir_entry(name, &disk_inode)
            .map(|(_, inode_id)| fs.get_inode(inode_id))
    }

    /// 把文件扩大到 new_size, 所需的块全部分配成功之后才真正修改 disk_inode
    fn increase_size(
        &self,
        new_size: usize,
        disk_inode: &mut DiskInode,
        fs: &FileSystem,
    ) -> FsResult<()> {
        if new_size <= disk_inode.size as usize {
            return Ok(());
        }
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let blocks_needed = disk_inode.blocks_needed_for(new_size as u32);
        let mut v: Vec<u32> = Vec::with_capacity(blocks_needed as usize);
        for _ in 0..blocks_needed {
            match fs.alloc_data() {
                Ok(block_id) => v.push(block_id),
                Err(err) => {
                    // 已经拿到的块原样还回去
                    for block_id in v {
                        fs.dealloc_data(block_id);
                    }
                    return Err(err);
                }
            }
        }
        disk_inode.grow(new_size as u32, v, &self.block_device);
        Ok(())
    }

    /// 在目录末尾追加一个目录项
    pub fn link(&self, name: &str, inode_id: u32, fs: &FileSystem) -> FsResult<()> {
        if name.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong);
        }
        self.modify_disk_inode(|dir_inode| {
            assert!(dir_inode.is_dir());
            let file_count = (dir_inode.size as usize) / DIRENT_SIZE;
            let new_size = (file_count + 1) * DIRENT_SIZE;
            self.increase_size(new_size, dir_inode, fs)?;
            let dir_entry = DirEntry::new(name, inode_id);
            dir_inode.write_at(
                file_count * DIRENT_SIZE,
                &dir_entry.to_bytes(),
                &self.block_device,
                None,
            );
            dir_inode.dirent_num += 1;
            Ok(())
        })
    }

    /// 文件创建: 分配 inode, 初始化, 再把目录项挂到当前目录下
    pub fn create(
        &self,
        name: &str,
        kind: DiskInodeType,
        uid: u32,
        gid: u32,
        mode: u32,
        fs: &FileSystem,
    ) -> FsResult<Inode> {
        if name.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong);
        }
        if self.find_dir_entry(name, &self.disk_inode()).is_some() {
            return Err(FsError::AlreadyExists);
        }

        // 为新文件分配一个 inode 编号, 先把新 inode 初始化好, 再修改目录
        let new_inode_id = fs.alloc_inode()?;
        let new_inode = fs.get_inode(new_inode_id);
        new_inode.modify_disk_inode(|disk_inode| {
            disk_inode.initialize(kind);
            disk_inode.uid = uid;
            disk_inode.gid = gid;
            disk_inode.mode = mode & 0o7777;
        });

        if let Err(err) = self.link(name, new_inode_id, fs) {
            fs.dealloc_inode(new_inode_id);
            return Err(err);
        }
        Ok(new_inode)
    }

    /// 把名为 name 的目录项原地改成空记录, 目录大小不变. 返回被摘下的 inode 编号
    pub fn remove(&self, name: &str) -> FsResult<u32> {
        self.modify_disk_inode(|dir_inode| {
            let (pos, inode_id) = self
                .find_dir_entry(name, dir_inode)
                .ok_or(FsError::NotFound)?;
            dir_inode.write_at(
                pos * DIRENT_SIZE,
                &DirEntry::create_empty().to_bytes(),
                &self.block_device,
                None,
            );
            dir_inode.dirent_num -= 1;
            Ok(inode_id)
        })
    }

    /// 将该文件占据的索引块和数据块回收
    pub fn clear(&self, fs: &FileSystem) {
        let data_blocks_dealloc = self.modify_disk_inode(|disk_inode| {
            let size = disk_inode.size;
            let data_blocks_dealloc = disk_inode.shrink_to_zero(&self.block_device);
            assert_eq!(
                data_blocks_dealloc.len(),
                DiskInode::total_blocks(size) as usize
            );
            disk_inode.refresh_ctime();
            data_blocks_dealloc
        });
        for data_block in data_blocks_dealloc.into_iter() {
            fs.dealloc_data(data_block);
        }
    }

    pub fn add_nlink(&self) {
        self.modify_disk_inode(|disk_inode| disk_inode.nlink += 1);
    }

    /// 链接数减一, 返回是否已经降到 0
    pub fn sub_nlink(&self) -> bool {
        self.modify_disk_inode(|disk_inode| {
            disk_inode.nlink = disk_inode.nlink.saturating_sub(1);
            disk_inode.nlink == 0
        })
    }

    /// 列出目录下所有有效的 (名字, inode 编号)
    pub fn ls(&self) -> Vec<(String, u32)> {
        self.read_disk_inode(|disk_inode| {
            self.dir_entries(disk_inode)
                .filter(|(_, dir_entry)| !dir_entry.is_empty())
                .map(|(_, dir_entry)| (String::from(dir_entry.name()), dir_entry.inode_id()))
                .collect()
        })
    }

    pub fn get_stat(&self) -> Stat {
        self.read_disk_inode(|disk_inode| {
            let kind = if disk_inode.is_dir() {
                libc::S_IFDIR
            } else {
                libc::S_IFREG
            };
            Stat {
                ino: self.inode_id,
                mode: disk_inode.mode | kind as u32,
                nlink: disk_inode.nlink,
                uid: disk_inode.uid,
                gid: disk_inode.gid,
                size: disk_inode.size,
                blksize: BLOCK_SIZE as u32,
                blocks: DiskInode::total_blocks(disk_inode.size),
                atime: disk_inode.atime,
                mtime: disk_inode.ctime,
                ctime: disk_inode.ctime,
            }
        })
    }

    /// 文件内容读写的属主: 目录内容属于元数据
    fn owner(&self, disk_inode: &DiskInode) -> Option<u32> {
        disk_inode.is_file().then_some(self.inode_id)
    }

    // 文件读写
    // 和 DiskInode 一样, 这里的读写作用在字节序列的一段区间上

    /// 读取期间一直持有 inode 所在块的锁, 数据块不会被并发的 clear 回收
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.modify_disk_inode(|disk_inode| {
            let owner = self.owner(disk_inode);
            let read_size = disk_inode.read_at(offset, buf, &self.block_device, owner);
            disk_inode.refresh_atime();
            read_size
        })
    }

    /// 写文件, 必要时先扩容. 数据块只标记为脏, 由 sync 或替换时写回
    ///
    /// 扩容和写数据都在 inode 所在块的写锁下完成, 与 clear 互斥
    pub fn write_at(&self, offset: usize, buf: &[u8], fs: &FileSystem) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.modify_disk_inode(|disk_inode| {
            if !disk_inode.is_file() {
                error!("write to a non-file inode {}", self.inode_id);
                return Err(FsError::IsADirectory);
            }
            self.increase_size(offset.saturating_add(buf.len()), disk_inode, fs)?;
            Ok(disk_inode.write_at(offset, buf, &self.block_device, Some(self.inode_id)))
        })
    }

    pub fn set_mode(&self, mode: u32) {
        self.modify_disk_inode(|disk_inode| {
            disk_inode.mode = mode & 0o7777;
            disk_inode.refresh_ctime();
        });
    }

    pub fn set_owner(&self, uid: u32, gid: u32) {
        self.modify_disk_inode(|disk_inode| {
            disk_inode.uid = uid;
            disk_inode.gid = gid;
            disk_inode.refresh_ctime();
        });
    }

    pub fn set_times(&self, atime: i64, ctime: i64) {
        self.modify_disk_inode(|disk_inode| {
            disk_inode.atime = atime;
            disk_inode.ctime = ctime;
        });
    }

    /// 写回这个文件所有的脏数据块, 连同 inode 所在的块
    pub fn sync(&self) {
        BLOCK_CACHE_MANAGER.flush_owner(&self.block_device, self.inode_id);
        BLOCK_CACHE_MANAGER.flush(self.block_id, &self.block_device);
    }
}
