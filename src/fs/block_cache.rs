//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 先通过 read_block 将一个块上的数据从磁盘读到内存中的一个缓冲区 [`BlockCache`] 中,
//! 后续对这个数据块的大部分访问就可以在内存中完成了.
//! 如果缓冲区中的内容被修改了, 那么后续还需要通过 write_block 将缓冲区中的内容写回到磁盘块中.
//!
//! 缓冲区统一由 [`BlockCacheManager`] 管理: 同一个块在内存中最多只有一份缓存,
//! 所有对该块的读写都发生在这唯一的缓冲区上, 这解决了同步性问题.
//!
//! 并发上采用两级锁:
//! - 管理器按 `block_id % 组数` 分成若干组 (shard), 每组一把锁, 只在查找/插入/替换期间持有;
//! - 每个块缓存自带一把读写锁, 在读写块内容期间持有.
//! 因此访问不同块的线程几乎不会互相阻塞, 读同一个块的线程也可以并行.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use lazy_static::*;
use log::debug;
use spin::{Mutex, RwLock};

use super::{BlockDevice, BLOCK_CACHE_GROUP, BLOCK_CACHE_WAY, BLOCK_SIZE};

/// 能够以固定布局编码进块缓冲区的磁盘数据结构.
///
/// 缓存不再把缓冲区强转成 `&T`, 而是在读时 `decode` 出一份值, 在改时再 `encode` 回去,
/// 偏移量和长度都会被检查.
pub trait OnDisk: Sized {
    /// 编码后占用的字节数
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Self;

    fn encode(&self, bytes: &mut [u8]);
}

/// 一个完整的数据块, 内容没有任何既定格式
pub type DataBlock = [u8; BLOCK_SIZE];

/// 任意长度的字节数组, 数据块 [`DataBlock`] 是其中 N = BLOCK_SIZE 的情形
impl<const N: usize> OnDisk for [u8; N] {
    const SIZE: usize = N;

    fn decode(bytes: &[u8]) -> Self {
        let mut block = [0u8; N];
        block.copy_from_slice(&bytes[..N]);
        block
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes[..N].copy_from_slice(self);
    }
}

/// 没有单一属主时 owner 字段的取值
const NO_OWNER: u64 = u64::MAX;

/// 缓冲区本体, 由 BlockCache 内部的读写锁保护
struct CacheBuffer {
    /// cache 是一个 512 字节的数组(恰好为一个块), 表示位于内存中的缓冲区
    cache: DataBlock,
    /// modified 记录这个块从磁盘载入内存缓存之后, 它有没有被修改过
    modified: bool,
}

/// Cached block inside memory
pub struct BlockCache {
    /// block_id 记录了这个块缓存来自于磁盘中的块的编号
    block_id: usize,
    /// block_device 是一个底层块设备的引用, 可通过它进行块读写
    block_device: Arc<dyn BlockDevice>,
    /// 最近一次以文件身份访问该块的 inode 编号, 用于 fsync 时只写回该文件的数据块
    owner: AtomicU64,
    buffer: RwLock<CacheBuffer>,
}

impl BlockCache {
    /// 创建一个 BlockCache: 这将触发一次 read_block 将一个块上的数据从磁盘读到缓冲区 cache
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>, owner: Option<u32>) -> Self {
        let mut cache = [0u8; BLOCK_SIZE];
        block_device.read_block(block_id, &mut cache);
        Self {
            block_id,
            block_device,
            owner: AtomicU64::new(owner.map_or(NO_OWNER, u64::from)),
            buffer: RwLock::new(CacheBuffer {
                cache,
                modified: false,
            }),
        }
    }

    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(id as u32),
        }
    }

    fn set_owner(&self, owner: u32) {
        self.owner.store(u64::from(owner), Ordering::Release);
    }

    fn belongs_to(&self, block_device: &Arc<dyn BlockDevice>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.block_device), Arc::as_ptr(block_device))
    }

    fn range_of<T: OnDisk>(offset: usize) -> std::ops::Range<usize> {
        // 确认 T 被整个包含在磁盘块及其缓冲区之内
        assert!(
            offset + T::SIZE <= BLOCK_SIZE,
            "record at offset {} overflows block",
            offset
        );
        offset..offset + T::SIZE
    }

    /// 在读锁保护下, 把偏移量 offset 处的数据解析为 T 并交给闭包 f
    pub fn read<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let buffer = self.buffer.read();
        let value = T::decode(&buffer.cache[Self::range_of::<T>(offset)]);
        f(&value)
    }

    /// 在写锁保护下修改偏移量 offset 处的 T, 修改结果编码回缓冲区并标记为脏
    pub fn modify<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let mut buffer = self.buffer.write();
        Self::modify_locked(&mut buffer, offset, f)
    }

    /// 与 modify 相同, 但在释放写锁之前就把缓冲区写回设备,
    /// 下一个读者看到的一定是已经落盘的内容
    pub fn modify_and_sync<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let mut buffer = self.buffer.write();
        let v = Self::modify_locked(&mut buffer, offset, f);
        self.write_back(&mut buffer);
        v
    }

    fn modify_locked<T: OnDisk, V>(
        buffer: &mut CacheBuffer,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> V {
        let range = Self::range_of::<T>(offset);
        let mut value = T::decode(&buffer.cache[range.clone()]);
        let v = f(&mut value);
        value.encode(&mut buffer.cache[range]);
        buffer.modified = true;
        v
    }

    fn write_back(&self, buffer: &mut CacheBuffer) {
        if buffer.modified {
            self.block_device.write_block(self.block_id, &buffer.cache);
            buffer.modified = false;
        }
    }

    /// If modified, write back to disk.
    pub fn sync(&self) {
        let mut buffer = self.buffer.write();
        self.write_back(&mut buffer);
    }

    /// 不等待的 sync: 块正被别人持锁时返回 false
    fn try_sync(&self) -> bool {
        match self.buffer.try_write() {
            Some(mut buffer) => {
                self.write_back(&mut buffer);
                true
            }
            None => false,
        }
    }
}

impl Drop for BlockCache {
    /// 缓冲区生命周期结束 (被替换或管理器释放) 时, 脏数据写回磁盘
    fn drop(&mut self) {
        let buffer = self.buffer.get_mut();
        if buffer.modified {
            self.block_device.write_block(self.block_id, &buffer.cache);
            buffer.modified = false;
        }
    }
}

/// 块缓存全局管理器
///
/// 当我们要对一个磁盘块进行读写时, 首先看它是否已经被载入到内存缓存中了,
/// 如果已经被载入的话则直接返回, 否则需要先读取磁盘块的数据到内存缓存中.
/// 此时如果该块所在的组已满, 需要先替换掉组里的某个块缓存.
pub struct BlockCacheManager {
    /// 每组是一个 (块号 -> 块缓存) 的线性表, 组内按块号线性查找
    groups: Vec<Mutex<Vec<Arc<BlockCache>>>>,
    /// 每组的容量
    way: usize,
}

impl BlockCacheManager {
    pub fn new(group_count: usize, way: usize) -> Self {
        assert!(group_count > 0 && way > 0);
        Self {
            groups: (0..group_count).map(|_| Mutex::new(Vec::new())).collect(),
            way,
        }
    }

    fn group_of(&self, block_id: usize) -> &Mutex<Vec<Arc<BlockCache>>> {
        &self.groups[block_id % self.groups.len()]
    }

    /// 尝试从块缓存管理器中获取一个编号为 block_id 的块的块缓存,
    /// 如果找不到, 会从磁盘读取到内存中, 还有可能会发生缓存替换.
    ///
    /// owner 为访问该块的文件的 inode 编号, 元数据访问传 None.
    pub fn get_block_cache(
        &self,
        block_id: usize,
        block_device: &Arc<dyn BlockDevice>,
        owner: Option<u32>,
    ) -> Arc<BlockCache> {
        let mut group = self.group_of(block_id).lock();
        if let Some(cache) = group
            .iter()
            .find(|cache| cache.block_id == block_id && cache.belongs_to(block_device))
        {
            if let Some(owner) = owner {
                cache.set_owner(owner);
            }
            return Arc::clone(cache);
        }

        if group.len() >= self.way {
            // 从前往后找到第一个只被管理器自己持有 (强引用计数恰好为 1) 的块缓存替换出去.
            // 只要组容量远大于同时在用的块数, 就不会出现整组都被占用的情况.
            let idx = group
                .iter()
                .position(|cache| Arc::strong_count(cache) == 1)
                .unwrap_or_else(|| panic!("Run out of BlockCache in group of block {}", block_id));
            let victim = group.remove(idx);
            debug!("evict block {} from cache", victim.block_id);
            // victim 在这里被 drop, 脏数据同步写回
        }

        let cache = Arc::new(BlockCache::new(block_id, Arc::clone(block_device), owner));
        group.push(Arc::clone(&cache));
        cache
    }

    /// 在组锁下写回组内满足 filter 的块.
    ///
    /// 持有某个块的锁的线程可能正在等这把组锁, 所以组锁下只做 try_sync,
    /// 正忙的块放开组锁之后再等.
    fn sync_group(
        group: &Mutex<Vec<Arc<BlockCache>>>,
        filter: impl Fn(&BlockCache) -> bool,
    ) {
        let busy: Vec<Arc<BlockCache>> = group
            .lock()
            .iter()
            .filter(|cache| {
                let cache: &BlockCache = cache;
                filter(cache) && !cache.try_sync()
            })
            .cloned()
            .collect();
        for cache in busy {
            cache.sync();
        }
    }

    /// 写回指定设备上编号为 block_id 的块 (如果它在缓存中)
    pub fn flush(&self, block_id: usize, block_device: &Arc<dyn BlockDevice>) {
        Self::sync_group(self.group_of(block_id), |cache| {
            cache.block_id == block_id && cache.belongs_to(block_device)
        });
    }

    /// 写回所有脏块
    pub fn flush_all(&self) {
        for group in self.groups.iter() {
            Self::sync_group(group, |_| true);
        }
    }

    /// 写回指定设备上属于某个 inode 的所有脏块
    pub fn flush_owner(&self, block_device: &Arc<dyn BlockDevice>, inode_id: u32) {
        for group in self.groups.iter() {
            Self::sync_group(group, |cache| {
                cache.owner() == Some(inode_id) && cache.belongs_to(block_device)
            });
        }
    }

    /// 移除某个设备的全部块缓存, 文件系统关闭时调用.
    /// 被移除的块缓存在最后一个持有者放手时 (通常就是这里) 由 drop 写回.
    pub fn release(&self, block_device: &Arc<dyn BlockDevice>) {
        for group in self.groups.iter() {
            group
                .lock()
                .retain(|cache| !cache.belongs_to(block_device));
        }
    }

    /// 当前缓存中的块数量
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|group| group.lock().len()).sum()
    }
}

lazy_static! {
    pub static ref BLOCK_CACHE_MANAGER: BlockCacheManager =
        BlockCacheManager::new(BLOCK_CACHE_GROUP, BLOCK_CACHE_WAY);
}

/// 对于其他模块而言, 可以直接通过 get_block_cache 方法来请求块缓存.
///
/// 返回的 `Arc<BlockCache>` 通过 read/modify 访问缓冲区里面的磁盘数据结构,
/// 锁由 BlockCache 自己在这些方法内部获取.
pub fn get_block_cache(
    block_id: usize,
    block_device: &Arc<dyn BlockDevice>,
    owner: Option<u32>,
) -> Arc<BlockCache> {
    BLOCK_CACHE_MANAGER.get_block_cache(block_id, block_device, owner)
}

pub fn block_cache_sync_all() {
    BLOCK_CACHE_MANAGER.flush_all();
}

pub fn block_cache_release(block_device: &Arc<dyn BlockDevice>) {
    BLOCK_CACHE_MANAGER.release(block_device);
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::fs::MemoryDevice;

    fn device(blocks: usize) -> (Arc<MemoryDevice>, Arc<dyn BlockDevice>) {
        let mem = Arc::new(MemoryDevice::new(blocks));
        let dev: Arc<dyn BlockDevice> = mem.clone();
        (mem, dev)
    }

    #[test]
    fn same_block_is_a_single_instance() {
        let manager = Arc::new(BlockCacheManager::new(4, 4));
        let (mem, dev) = device(16);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let dev = Arc::clone(&dev);
                thread::spawn(move || {
                    let cache = manager.get_block_cache(5, &dev, None);
                    cache.modify(i, |byte: &mut [u8; 1]| byte[0] = i as u8 + 1);
                    cache
                })
            })
            .collect();
        let caches: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for cache in caches.iter() {
            assert!(Arc::ptr_eq(cache, &caches[0]));
        }
        // 所有修改都在同一个缓冲区上, 且没有再次读设备
        caches[0].read(0, |bytes: &[u8; 8]| {
            assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
        });
        assert_eq!(mem.reads(), 1);
        assert_eq!(mem.writes(), 0);
    }

    #[test]
    fn modify_and_sync_writes_through() {
        let manager = BlockCacheManager::new(1, 2);
        let (mem, dev) = device(4);

        let cache = manager.get_block_cache(1, &dev, None);
        cache.modify_and_sync(8, |value: &mut [u8; 4]| *value = [9, 8, 7, 6]);
        assert_eq!(mem.writes(), 1);
        assert_eq!(&mem.raw(1)[8..12], &[9, 8, 7, 6]);

        cache.modify(0, |value: &mut [u8; 1]| value[0] = 1);
        assert_eq!(mem.raw(1)[0], 0);
        manager.flush(1, &dev);
        assert_eq!(mem.raw(1)[0], 1);
    }

    #[test]
    fn eviction_writes_back_dirty_block() {
        let manager = BlockCacheManager::new(1, 2);
        let (mem, dev) = device(4);

        manager
            .get_block_cache(0, &dev, None)
            .modify(0, |data: &mut DataBlock| data.fill(0xaa));
        let pinned = manager.get_block_cache(1, &dev, None);
        // 组已满, 块 0 没有外部持有者, 会被替换并写回
        let _third = manager.get_block_cache(2, &dev, None);
        assert_eq!(manager.len(), 2);
        assert!(mem.raw(0).iter().all(|b| *b == 0xaa));
        drop(pinned);
    }

    #[test]
    #[should_panic(expected = "Run out of BlockCache")]
    fn full_group_of_pinned_blocks_panics() {
        let manager = BlockCacheManager::new(1, 2);
        let (_mem, dev) = device(4);
        let _a = manager.get_block_cache(0, &dev, None);
        let _b = manager.get_block_cache(1, &dev, None);
        manager.get_block_cache(2, &dev, None);
    }

    #[test]
    fn flush_owner_only_touches_owned_blocks() {
        let manager = BlockCacheManager::new(4, 4);
        let (mem, dev) = device(8);

        let mine = manager.get_block_cache(2, &dev, Some(7));
        let other = manager.get_block_cache(3, &dev, Some(8));
        mine.modify(0, |b: &mut [u8; 1]| b[0] = 1);
        other.modify(0, |b: &mut [u8; 1]| b[0] = 2);

        manager.flush_owner(&dev, 7);
        assert_eq!(mem.raw(2)[0], 1);
        assert_eq!(mem.raw(3)[0], 0);

        // 块被另一个文件重新访问后, 属主随之改变
        manager.get_block_cache(3, &dev, Some(7));
        manager.flush_owner(&dev, 7);
        assert_eq!(mem.raw(3)[0], 2);
    }

    #[test]
    fn devices_do_not_share_entries() {
        let manager = BlockCacheManager::new(2, 4);
        let (mem_a, dev_a) = device(2);
        let (mem_b, dev_b) = device(2);

        manager
            .get_block_cache(0, &dev_a, None)
            .modify_and_sync(0, |b: &mut [u8; 1]| b[0] = 0x11);
        manager
            .get_block_cache(0, &dev_b, None)
            .read(0, |b: &[u8; 1]| assert_eq!(b[0], 0));
        assert_eq!(mem_a.raw(0)[0], 0x11);
        assert_eq!(mem_b.raw(0)[0], 0);

        manager.release(&dev_a);
        assert_eq!(manager.len(), 1);
    }
}
