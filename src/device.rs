use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::RwLock,
};

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::info;
use sha3::{Digest, Sha3_256};

use crate::fs::{BlockDevice, BLOCK_SIZE};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// 每个块独立做一次 AES-128-CBC.
///
/// 密钥和 IV 都由口令的 SHA3-256 摘要导出: 前 16 字节是密钥, 后 16 字节是 IV.
/// IV 对所有块都相同, 所以相同明文的块会得到相同的密文.
#[derive(Clone)]
pub struct BlockCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl BlockCipher {
    pub fn from_password(password: &str) -> Self {
        let digest = Sha3_256::digest(password.as_bytes());
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        iv.copy_from_slice(&digest[16..32]);
        Self { key, iv }
    }

    pub fn encrypt(&self, block: &mut [u8]) {
        assert_eq!(block.len(), BLOCK_SIZE);
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_mut::<NoPadding>(block, BLOCK_SIZE)
            .expect("block is a whole number of cipher blocks");
    }

    pub fn decrypt(&self, block: &mut [u8]) {
        assert_eq!(block.len(), BLOCK_SIZE);
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_mut::<NoPadding>(block)
            .expect("block is a whole number of cipher blocks");
    }
}

/// 由若干个等长的宿主文件模拟的一块磁盘.
///
/// 第 id 块落在第 id % N 个文件里, 文件内偏移为 (id / N) * BLOCK_SIZE.
/// 每个文件一把读写锁: 同一个文件允许多个读者或一个写者, 不同文件之间互不影响.
pub struct StripedDevice {
    stores: Vec<RwLock<File>>,
    cipher: BlockCipher,
    blocks_per_store: usize,
}

impl StripedDevice {
    /// 打开已经分配好大小的后备文件
    pub fn open<P: AsRef<Path>>(paths: &[P], password: &str) -> io::Result<Self> {
        if paths.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one store is required",
            ));
        }
        let mut stores = Vec::with_capacity(paths.len());
        let mut store_len = None;
        for path in paths {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let len = file.metadata()?.len();
            match store_len {
                None => store_len = Some(len),
                Some(expected) if expected != len => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "store {} has {} bytes, expected {}",
                            path.as_ref().display(),
                            len,
                            expected
                        ),
                    ));
                }
                Some(_) => {}
            }
            stores.push(RwLock::new(file));
        }
        let blocks_per_store = store_len.unwrap_or(0) as usize / BLOCK_SIZE;
        info!(
            "striped device: {} stores x {} blocks",
            stores.len(),
            blocks_per_store
        );
        Ok(Self {
            stores,
            cipher: BlockCipher::from_password(password),
            blocks_per_store,
        })
    }

    pub fn total_blocks(&self) -> usize {
        self.stores.len() * self.blocks_per_store
    }

    /// (文件下标, 文件内字节偏移)
    fn locate(&self, block_id: usize) -> (usize, u64) {
        assert!(
            block_id < self.total_blocks(),
            "block {} out of device",
            block_id
        );
        let n = self.stores.len();
        (block_id % n, ((block_id / n) * BLOCK_SIZE) as u64)
    }
}

impl BlockDevice for StripedDevice {
    /// 读出一块后解密
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "Not a complete block");
        let (store, offset) = self.locate(block_id);
        {
            let file = self.stores[store].read().unwrap();
            file.read_exact_at(buf, offset)
                .expect("Error when reading block!");
        }
        self.cipher.decrypt(buf);
    }

    /// 加密后写入一块, 返回时已经交给宿主文件系统
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "Not a complete block");
        let (store, offset) = self.locate(block_id);
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(buf);
        self.cipher.encrypt(&mut block);
        let file = self.stores[store].write().unwrap();
        file.write_all_at(&block, offset)
            .expect("Error when writing block!");
    }
}

/// `<prefix>0`, `<prefix>1`, ... 共 count 个后备文件
pub fn store_paths(prefix: &str, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| PathBuf::from(format!("{}{}", prefix, i)))
        .collect()
}

/// 创建并分配缺失的后备文件, 大小向下取整到块的整数倍.
/// 返回是否新建了文件 (新建过就需要格式化)
pub fn ensure_stores<P: AsRef<Path>>(paths: &[P], store_size: u64) -> io::Result<bool> {
    let store_size = store_size / BLOCK_SIZE as u64 * BLOCK_SIZE as u64;
    let mut created = false;
    for path in paths {
        let path = path.as_ref();
        if path.exists() {
            continue;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(store_size)?;
        info!("created store {} ({} bytes)", path.display(), store_size);
        created = true;
    }
    Ok(created)
}
