//! 各整合段区域及磁盘数据结构结构, 实现 fs 的整体磁盘布局
//!
//! [`FileSystem`] 知道每个布局区域所在的位置, 磁盘块的分配和回收也需要经过它才能完成,
//! 因此某种意义上讲它可以看成一个磁盘块管理器.
//! 它同时负责按路径逐级查找, 并在每一级做权限检查.
//!
//! 从这一层开始, 所有的数据结构放在内存上

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::{
    block_cache_release, block_cache_sync_all, get_block_cache, Bitmap, BlockDevice, DataBlock,
    DiskInode, DiskInodeType, FsError, FsResult, Inode, SuperBlock, BLOCK_BITS, BLOCK_SIZE,
    DISK_INODE_SIZE, INODES_PER_BLOCK, NAME_LENGTH_LIMIT,
};

/// 文件系统 (磁盘块管理器)
///
/// Blocks: Super Block(0) -> Inode Bit Map Blocks -> Inode Blocks -> Data Bit Map Blocks -> Data Blocks
pub struct FileSystem {
    /// 保留块设备的一个指针 block_device,
    /// 在进行后续操作的时候, 该指针会被拷贝并传递给下层的数据结构,
    /// 让它们也能够直接访问块设备.
    pub block_device: Arc<dyn BlockDevice>,
    /// 索引节点位图
    /// 一位代表一个索引节点, 一个块中存放4个索引节点
    inode_bitmap: Bitmap,
    /// 数据块位图
    /// 一位代表一个数据块
    data_bitmap: Bitmap,
    /// 索引区域起始块号
    inode_area_start_block: u32,
    /// 数据区域起始块号
    data_area_start_block: u32,
    /// 数据区域块数, 数据块位图的位数可能比它多
    data_area_blocks: u32,
    /// 本次会话的调用者身份, 所有权限检查都以它为准
    uid: u32,
    gid: u32,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|name| !name.is_empty()).collect()
}

impl FileSystem {
    fn from_super_block(block_device: Arc<dyn BlockDevice>, super_block: &SuperBlock) -> Self {
        Self {
            block_device,
            // note: inode 位图的起始块号是 1 (0 是超级块)
            inode_bitmap: Bitmap::new(1, super_block.inode_bitmap_blocks as usize),
            data_bitmap: Bitmap::new(
                super_block.data_bitmap_start_block() as usize,
                super_block.data_bitmap_blocks as usize,
            ),
            inode_area_start_block: super_block.inode_area_start_block(),
            data_area_start_block: super_block.data_area_start_block(),
            data_area_blocks: super_block.data_area_blocks,
            uid: 0,
            gid: 0,
        }
    }

    /// 在块设备上创建并初始化一个文件系统
    pub fn format(
        block_device: Arc<dyn BlockDevice>,
        total_blocks: u32,        // 磁盘总块数
        inode_bitmap_blocks: u32, // 索引节点位图占用的块数
    ) -> FsResult<Self> {
        // 根据 inode 位图的大小计算 inode 区域至少需要多少个块,
        // 使 inode 位图中的每个bit都能够有一个实际的 inode 可以对应
        let inode_num = inode_bitmap_blocks as usize * BLOCK_BITS;
        let inode_area_blocks = (inode_num * DISK_INODE_SIZE).div_ceil(BLOCK_SIZE) as u32;
        let inode_total_blocks = inode_bitmap_blocks + inode_area_blocks;

        // 剩下的块 (再减去超级块) 都分配给 数据块位图区域 和 数据块区域
        if total_blocks < inode_total_blocks + 3 {
            warn!(
                "{} blocks cannot hold {} inode blocks plus data",
                total_blocks, inode_total_blocks
            );
            return Err(FsError::NoSpace);
        }
        let data_total_blocks = total_blocks - 1 - inode_total_blocks;

        // 设数据的位图占据 x 个块, 则该位图能管理的数据块不超过 4096 * x,
        // 位图管理的数据块为 data_total_blocks - x 个块.
        // 于是有不等式 data_total_blocks - x <= 4096 * x, 取 x 的最小整数解,
        // 也就是 data_total_blocks / 4097 上取整.
        let data_bitmap_blocks = (data_total_blocks + BLOCK_BITS as u32) / (BLOCK_BITS as u32 + 1);
        let data_area_blocks = data_total_blocks - data_bitmap_blocks;

        // 初始化超级块
        let mut super_block = SuperBlock::default();
        super_block.initialize(
            total_blocks,
            inode_bitmap_blocks,
            inode_area_blocks,
            data_bitmap_blocks,
            data_area_blocks,
        );
        let fs = Self::from_super_block(Arc::clone(&block_device), &super_block);

        // 设备上原有的内容 (解密后就是噪声) 不可信, 两张位图必须清零.
        // 其余的块在分配出去时才清零
        fs.inode_bitmap.clear(&block_device);
        fs.data_bitmap.clear(&block_device);

        get_block_cache(0, &block_device, None).modify_and_sync(
            0,
            |disk_super_block: &mut SuperBlock| *disk_super_block = super_block.clone(),
        );

        // 为根目录 "/" 创建一个 inode, 第一次分配的编号固定是 0
        assert_eq!(fs.alloc_inode()?, 0);
        let (root_inode_block_id, root_inode_offset) = fs.get_disk_inode_pos(0);
        get_block_cache(root_inode_block_id as usize, &block_device, None).modify_and_sync(
            root_inode_offset,
            |disk_inode: &mut DiskInode| {
                disk_inode.initialize(DiskInodeType::Directory);
            },
        );

        block_cache_sync_all();
        info!(
            "format: {} blocks, {} inodes, {} data blocks starting at {}",
            total_blocks, inode_num, data_area_blocks, fs.data_area_start_block
        );
        Ok(fs)
    }

    /// 通过 open 方法可以从一个已写入了 fs 镜像的块设备上打开 fs
    pub fn open(block_device: Arc<dyn BlockDevice>) -> FsResult<Self> {
        // 读超级块: 超级块的索引 id 为 0
        let super_block =
            get_block_cache(0, &block_device, None).read(0, |super_block: &SuperBlock| {
                super_block.clone()
            });
        if !super_block.is_valid() {
            error!("Open failed: incorrect password or file corrupted");
            block_cache_release(&block_device);
            return Err(FsError::InvalidFilesystem);
        }

        let fs = Self::from_super_block(block_device, &super_block);
        if !fs.root_inode().is_dir() {
            error!("Open failed: root inode is not a directory");
            return Err(FsError::InvalidFilesystem);
        }
        info!(
            "open: {} blocks, {} data blocks starting at {}",
            super_block.total_blocks, fs.data_area_blocks, fs.data_area_start_block
        );
        Ok(fs)
    }

    /// 设定本次会话的调用者身份
    pub fn set_user(&mut self, uid: u32, gid: u32) {
        self.uid = uid;
        self.gid = gid;
    }

    pub fn user(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    /// 通过 inode_id 返回 block_id 和 offset
    pub fn get_disk_inode_pos(&self, inode_id: u32) -> (u32, usize) {
        let inodes_per_block = INODES_PER_BLOCK as u32;
        let block_id = self.inode_area_start_block + inode_id / inodes_per_block;
        (
            block_id,
            (inode_id % inodes_per_block) as usize * DISK_INODE_SIZE,
        )
    }

    // alloc_data 和 dealloc_data 分配/回收数据块传入/返回的参数都表示数据块在块设备上的编号,
    // 而不是在数据块位图中分配的bit编号

    /// 分配索引
    pub fn alloc_inode(&self) -> FsResult<u32> {
        match self.inode_bitmap.alloc(&self.block_device) {
            Some(inode_id) => Ok(inode_id as u32),
            None => {
                warn!("inode bitmap exhausted");
                Err(FsError::NoSpace)
            }
        }
    }

    /// 分配数据块, 新块的内容清零
    pub fn alloc_data(&self) -> FsResult<u32> {
        let bit = match self.data_bitmap.alloc(&self.block_device) {
            Some(bit) => bit,
            None => {
                warn!("data bitmap exhausted");
                return Err(FsError::NoSpace);
            }
        };
        // 位图最后一块中超出数据区域的位不对应任何数据块
        if bit >= self.data_area_blocks as usize {
            self.data_bitmap.dealloc(&self.block_device, bit);
            warn!("data area exhausted");
            return Err(FsError::NoSpace);
        }
        let block_id = bit as u32 + self.data_area_start_block;
        // 清零直接写穿到设备, 空洞块不会出现在任何属主的脏块里
        get_block_cache(block_id as usize, &self.block_device, None)
            .modify_and_sync(0, |data_block: &mut DataBlock| data_block.fill(0));
        Ok(block_id)
    }

    /// 回收 inode, 调用者负责事先回收它的数据块
    pub fn dealloc_inode(&self, inode_id: u32) {
        self.inode_bitmap
            .dealloc(&self.block_device, inode_id as usize)
    }

    /// 回收数据块
    pub fn dealloc_data(&self, block_id: u32) {
        assert!(block_id >= self.data_area_start_block);
        self.data_bitmap.dealloc(
            &self.block_device,
            (block_id - self.data_area_start_block) as usize,
        )
    }

    pub fn get_inode(&self, inode_id: u32) -> Inode {
        let (block_id, block_offset) = self.get_disk_inode_pos(inode_id);
        Inode::new(
            inode_id,
            block_id,
            block_offset,
            Arc::clone(&self.block_device),
        )
    }

    /// 获取文件系统的根inode
    ///
    /// 根目录对应于文件系统中第一个分配的 inode, 因此它的 inode_id 总会是 0
    pub fn root_inode(&self) -> Inode {
        self.get_inode(0)
    }

    /// 从 dir 往下走一级: dir 必须是目录, 调用者对它有读和执行权限
    fn descend(&self, dir: &Inode, name: &str) -> FsResult<Inode> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !(dir.permit_r(self.uid, self.gid) && dir.permit_x(self.uid, self.gid)) {
            warn!("search permission denied on inode {}", dir.inode_id());
            return Err(FsError::AccessDenied);
        }
        dir.find(name, self).ok_or(FsError::NotFound)
    }

    /// 沿路径走到最后一段的父目录, 返回 (父目录, 最后一段名字).
    /// 路径就是根目录时返回 None
    fn walk_to_parent<'p>(&self, path: &'p str) -> FsResult<Option<(Inode, &'p str)>> {
        let names = split_path(path);
        let Some((last, dirs)) = names.split_last() else {
            return Ok(None);
        };
        let mut parent = self.root_inode();
        for name in dirs {
            parent = self.descend(&parent, name)?;
        }
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Some((parent, *last)))
    }

    /// 父目录需要有写权限
    fn check_writable(&self, parent: &Inode) -> FsResult<()> {
        if parent.permit_w(self.uid, self.gid) {
            Ok(())
        } else {
            warn!("write permission denied on inode {}", parent.inode_id());
            Err(FsError::AccessDenied)
        }
    }

    /// 按绝对路径查找
    pub fn find(&self, path: &str) -> FsResult<Inode> {
        match self.walk_to_parent(path)? {
            None => Ok(self.root_inode()),
            Some((parent, name)) => parent.find(name, self).ok_or(FsError::NotFound),
        }
    }

    /// 按路径创建文件或目录, 属主为当前调用者
    pub fn create(&self, path: &str, kind: DiskInodeType, mode: u32) -> FsResult<Inode> {
        let (parent, name) = self.walk_to_parent(path)?.ok_or(FsError::AlreadyExists)?;
        self.check_writable(&parent)?;
        if name.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong);
        }
        if parent.find(name, self).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let inode = parent.create(name, kind, self.uid, self.gid, mode, self)?;
        debug!("create {} ({:?}) as inode {}", path, kind, inode.inode_id());
        Ok(inode)
    }

    /// 删除一个名字; 链接数降到 0 时回收 inode 和它的块
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self
            .walk_to_parent(path)?
            .ok_or(FsError::OperationNotPermitted)?;
        self.check_writable(&parent)?;
        let child = parent.find(name, self).ok_or(FsError::NotFound)?;
        if child.is_dir() && child.get_dirent_num() > 0 {
            return Err(FsError::DirectoryNotEmpty);
        }
        parent.remove(name)?;
        if child.sub_nlink() {
            child.clear(self);
            self.dealloc_inode(child.inode_id());
            debug!("unlink {}: inode {} freed", path, child.inode_id());
        } else {
            debug!("unlink {}", path);
        }
        Ok(())
    }

    /// rename 和 link 共用: 找到源文件 (不能是目录) 和目标的父目录 (目标名字必须不存在)
    fn resolve_pair<'p>(
        &self,
        from: &'p str,
        to: &'p str,
    ) -> FsResult<((Inode, &'p str, Inode), (Inode, &'p str))> {
        let (parent_from, name_from) = self
            .walk_to_parent(from)?
            .ok_or(FsError::OperationNotPermitted)?;
        let child_from = parent_from
            .find(name_from, self)
            .ok_or(FsError::NotFound)?;
        if child_from.is_dir() {
            warn!("refuse to rename or link directory {}", from);
            return Err(FsError::OperationNotPermitted);
        }
        let (parent_to, name_to) = self.walk_to_parent(to)?.ok_or(FsError::AlreadyExists)?;
        self.check_writable(&parent_to)?;
        if name_to.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong);
        }
        if parent_to.find(name_to, self).is_some() {
            return Err(FsError::AlreadyExists);
        }
        Ok(((parent_from, name_from, child_from), (parent_to, name_to)))
    }

    /// 改名: 先在目标目录挂上新名字, 再摘掉旧名字, inode 和数据不动
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let ((parent_from, name_from, child), (parent_to, name_to)) =
            self.resolve_pair(from, to)?;
        self.check_writable(&parent_from)?;
        parent_to.link(name_to, child.inode_id(), self)?;
        parent_from.remove(name_from)?;
        debug!("rename {} -> {}", from, to);
        Ok(())
    }

    /// 硬链接: 链接数加一, 再在目标目录挂上新名字
    pub fn link(&self, from: &str, to: &str) -> FsResult<()> {
        let ((_, _, child), (parent_to, name_to)) = self.resolve_pair(from, to)?;
        child.add_nlink();
        if let Err(err) = parent_to.link(name_to, child.inode_id(), self) {
            child.sub_nlink();
            return Err(err);
        }
        debug!("link {} -> {}", from, to);
        Ok(())
    }

    /// 写回所有脏块
    pub fn sync_all(&self) {
        block_cache_sync_all();
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // 写回并丢弃这个设备的全部块缓存, 之后可以从后备存储重新打开
        block_cache_release(&self.block_device);
        info!("close: cache of device released");
    }
}
