//! 在 fs 布局中存在两类不同的位图, 分别对索引节点和数据块进行管理
//!
//! 每个位图都由若干个块组成, 每个块大小为 512 bytes, 即 4096 bits
//! 每个 bit 都代表一个索引节点/数据块的分配状态,  0 意味着未分配, 而 1 则意味着已经分配出去
//!
//! 位图所要做的事情是通过基于 bit 为单位的分配(寻找一个为 0 的 bit 位并设置为 1)
//! 和回收(将bit位清零)来进行索引节点/数据块的分配和回收.
//! 所有修改都通过 modify_and_sync 立刻落盘.

use std::sync::Arc;

use spin::Mutex;

use super::{get_block_cache, BlockDevice, OnDisk, BLOCK_BITS, BLOCK_SIZE};

/// BitmapBlock 将位图区域中的一个磁盘块解释为长度为 64 的一个 u64 数组,
/// 每个 u64 打包了一组 64 bits, 于是整个数组包含 64 * 64 = 4096 bits
type BitmapBlock = [u64; BLOCK_SIZE / 8];

impl OnDisk for BitmapBlock {
    const SIZE: usize = BLOCK_SIZE;

    fn decode(bytes: &[u8]) -> Self {
        let mut block = [0u64; BLOCK_SIZE / 8];
        for (word, chunk) in block.iter_mut().zip(bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        block
    }

    fn encode(&self, bytes: &mut [u8]) {
        for (word, chunk) in self.iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Bitmap 自身是驻留在内存中的,
/// 但是它能够表示索引节点/数据块区域中的那些磁盘块的分配情况.
pub struct Bitmap {
    /// 位图所在区域的起始块编号
    start_block_id: usize,
    /// 位图索引使用的磁盘块数
    blocks_counts: usize,
    /// 保证并发的 alloc 不会拿到同一个 bit
    lock: Mutex<()>,
}

impl Bitmap {
    pub fn new(start_block_id: usize, blocks_counts: usize) -> Self {
        Self {
            start_block_id,
            blocks_counts,
            lock: Mutex::new(()),
        }
    }

    /// 分配一个 bit
    ///
    /// 遍历区域中的每个块, 再在每个块中以 bit 组(每组 64 bits)为单位进行遍历,
    /// 找到一个尚未被全部分配出去的组, 最后在里面分配最低的空闲 bit.
    ///
    /// 如果所有bit均已经被分配出去了, 则返回 None .
    pub fn alloc(&self, block_device: &Arc<dyn BlockDevice>) -> Option<usize> {
        let _guard = self.lock.lock();
        for block_id in 0..self.blocks_counts {
            let cache = get_block_cache(block_id + self.start_block_id, block_device, None);
            // 先只读地看一眼, 满的块不必再写回
            let full = cache.read(0, |bitmap_block: &BitmapBlock| {
                bitmap_block.iter().all(|bits64| *bits64 == u64::MAX)
            });
            if full {
                continue;
            }
            let pos = cache.modify_and_sync(0, |bitmap_block: &mut BitmapBlock| {
                bitmap_block
                    .iter()
                    .position(|bits64| *bits64 != u64::MAX)
                    .map(|bits64_pos| {
                        // 取反后的 trailing_zeros 即最低的 0 的位置
                        let inner_pos = (!bitmap_block[bits64_pos]).trailing_zeros() as usize;
                        bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                        block_id * BLOCK_BITS + bits64_pos * 64 + inner_pos
                    })
            });
            if pos.is_some() {
                return pos;
            }
        }
        None
    }

    /// 回收一个 bit, 回收一个未分配的 bit 意味着重复释放, 直接 panic
    pub fn dealloc(&self, block_device: &Arc<dyn BlockDevice>, bit: usize) {
        assert!(bit < self.maximum(), "bit {} out of bitmap", bit);
        let _guard = self.lock.lock();
        let (block_pos, bits64_pos, inner_pos) = decomposition(bit);
        get_block_cache(block_pos + self.start_block_id, block_device, None).modify_and_sync(
            0,
            |bitmap_block: &mut BitmapBlock| {
                assert!(
                    bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0,
                    "double free of bit {}",
                    bit
                );
                bitmap_block[bits64_pos] &= !(1u64 << inner_pos);
            },
        );
    }

    /// 格式化时把整个位图清零
    pub fn clear(&self, block_device: &Arc<dyn BlockDevice>) {
        let _guard = self.lock.lock();
        for block_id in 0..self.blocks_counts {
            get_block_cache(block_id + self.start_block_id, block_device, None)
                .modify_and_sync(0, |bitmap_block: &mut BitmapBlock| bitmap_block.fill(0));
        }
    }

    /// 获取可分配块的最大数量
    pub fn maximum(&self) -> usize {
        self.blocks_counts * BLOCK_BITS
    }
}

/// 将bit编号 bit 分解为区域中的块编号 block_pos , 块内的组编号 bits64_pos 以及组内编号 inner_pos 的三元组
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let block_pos = bit / BLOCK_BITS;
    bit %= BLOCK_BITS;
    (block_pos, bit / 64, bit % 64)
}
