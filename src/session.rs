//! 挂载层看到的文件系统操作: 按路径取属性, 打开/遍历目录, 打开文件并按句柄读写,
//! 以及创建/删除/改名/链接/改权限.
//!
//! 所有改动名字空间的操作 (以及为 open 做的查找) 都在同一把互斥锁下串行执行,
//! 已打开文件的 read/write/fsync 不拿这把锁, 只依赖块缓存的逐块读写锁.

use log::debug;
use spin::Mutex;

use crate::fs::{Access, DiskInodeType, FileSystem, FsError, FsResult, Inode, Stat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    /// 打开时把文件截断为空
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            truncate: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            access: AccessMode::ReadWrite,
            truncate: false,
        }
    }
}

/// 已打开的文件
pub struct FileHandle {
    inode: Inode,
    access: AccessMode,
}

/// 已打开的目录
pub struct DirHandle {
    inode: Inode,
}

pub struct Session {
    fs: FileSystem,
    namespace_lock: Mutex<()>,
}

impl Session {
    pub fn new(fs: FileSystem) -> Self {
        Self {
            fs,
            namespace_lock: Mutex::new(()),
        }
    }

    fn require(&self, inode: &Inode, access: Access) -> FsResult<()> {
        let (uid, gid) = self.fs.user();
        if inode.permit(uid, gid, access) {
            Ok(())
        } else {
            Err(FsError::AccessDenied)
        }
    }

    /// 只有属主和 root 可以修改 inode 的属性
    fn require_owner(&self, inode: &Inode) -> FsResult<()> {
        let (uid, _) = self.fs.user();
        let (_, owner, _) = inode.get_permission();
        if uid == 0 || uid == owner {
            Ok(())
        } else {
            Err(FsError::OperationNotPermitted)
        }
    }

    pub fn getattr(&self, path: &str) -> FsResult<Stat> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        self.require(&inode, Access::Read)?;
        Ok(inode.get_stat())
    }

    pub fn opendir(&self, path: &str) -> FsResult<DirHandle> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.require(&inode, Access::Read)?;
        Ok(DirHandle { inode })
    }

    /// 目录下每个有效目录项的名字和属性
    pub fn readdir(&self, dir: &DirHandle) -> FsResult<Vec<(String, Stat)>> {
        let _guard = self.namespace_lock.lock();
        Ok(dir
            .inode
            .ls()
            .into_iter()
            .map(|(name, inode_id)| (name, self.fs.get_inode(inode_id).get_stat()))
            .collect())
    }

    pub fn releasedir(&self, dir: DirHandle) {
        drop(dir);
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<FileHandle> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if flags.access.readable() {
            self.require(&inode, Access::Read)?;
        }
        if flags.access.writable() {
            self.require(&inode, Access::Write)?;
        }
        if flags.truncate && flags.access.writable() {
            inode.clear(&self.fs);
        }
        Ok(FileHandle {
            inode,
            access: flags.access,
        })
    }

    pub fn read(&self, file: &FileHandle, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        if !file.access.readable() {
            return Err(FsError::BadDescriptor);
        }
        Ok(file.inode.read_at(offset, buf))
    }

    pub fn write(&self, file: &FileHandle, offset: usize, buf: &[u8]) -> FsResult<usize> {
        if !file.access.writable() {
            return Err(FsError::BadDescriptor);
        }
        file.inode.write_at(offset, buf, &self.fs)
    }

    pub fn fsync(&self, file: &FileHandle) {
        file.inode.sync();
    }

    /// 关闭文件, 脏数据随之写回
    pub fn release(&self, file: FileHandle) {
        file.inode.sync();
    }

    /// 创建并以读写方式打开一个文件
    pub fn create(&self, path: &str, mode: u32) -> FsResult<FileHandle> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.create(path, DiskInodeType::File, mode)?;
        Ok(FileHandle {
            inode,
            access: AccessMode::ReadWrite,
        })
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        self.fs.create(path, DiskInodeType::Directory, mode)?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        if self.fs.find(path)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.fs.unlink(path)
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        if !self.fs.find(path)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.fs.unlink(path)
    }

    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        self.fs.rename(from, to)
    }

    pub fn link(&self, from: &str, to: &str) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        self.fs.link(from, to)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        self.require_owner(&inode)?;
        inode.set_mode(mode);
        debug!("chmod {} {:o}", path, mode);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        if self.fs.user().0 != 0 {
            return Err(FsError::OperationNotPermitted);
        }
        inode.set_owner(uid, gid);
        debug!("chown {} {}:{}", path, uid, gid);
        Ok(())
    }

    /// 修改时间戳, 磁盘上只有 atime 和 ctime, mtime 记在 ctime 里
    pub fn utimens(&self, path: &str, atime: i64, mtime: i64) -> FsResult<()> {
        let _guard = self.namespace_lock.lock();
        let inode = self.fs.find(path)?;
        self.require_owner(&inode)?;
        inode.set_times(atime, mtime);
        Ok(())
    }

    pub fn sync_all(&self) {
        self.fs.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;
    use crate::fs::{BlockDevice, MemoryDevice, BLOCK_SIZE};

    fn session(uid: u32, gid: u32) -> Session {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(8192));
        let mut fs = FileSystem::format(dev, 8192, 1).unwrap();
        fs.set_user(uid, gid);
        Session::new(fs)
    }

    #[test]
    fn open_flags_gate_handles() {
        let s = session(0, 0);
        let file = s.create("/f", 0o644).unwrap();
        s.write(&file, 0, b"hello world").unwrap();
        s.release(file);

        let ro = s.open("/f", OpenFlags::read_only()).unwrap();
        assert!(matches!(s.write(&ro, 0, b"x"), Err(FsError::BadDescriptor)));
        let mut buf = [0u8; 5];
        assert_eq!(s.read(&ro, 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        let wo = s
            .open(
                "/f",
                OpenFlags {
                    access: AccessMode::WriteOnly,
                    truncate: true,
                },
            )
            .unwrap();
        assert!(matches!(
            s.read(&wo, 0, &mut buf),
            Err(FsError::BadDescriptor)
        ));
        assert_eq!(s.getattr("/f").unwrap().size, 0);

        s.mkdir("/d", 0o755).unwrap();
        assert!(matches!(
            s.open("/d", OpenFlags::read_only()),
            Err(FsError::IsADirectory)
        ));
        assert!(matches!(
            s.opendir("/f"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn unlink_and_rmdir_check_kind() {
        let s = session(0, 0);
        s.mkdir("/d", 0o755).unwrap();
        s.create("/d/f", 0o644).unwrap();
        assert!(matches!(s.unlink("/d"), Err(FsError::IsADirectory)));
        assert!(matches!(s.rmdir("/d/f"), Err(FsError::NotADirectory)));
        assert!(matches!(s.rmdir("/d"), Err(FsError::DirectoryNotEmpty)));
        s.unlink("/d/f").unwrap();
        s.rmdir("/d").unwrap();
        assert!(matches!(s.getattr("/d"), Err(FsError::NotFound)));
    }

    #[test]
    fn readdir_reports_stats() {
        let s = session(0, 0);
        s.mkdir("/d", 0o750).unwrap();
        let file = s.create("/d/a", 0o600).unwrap();
        s.write(&file, 0, &[1u8; 700]).unwrap();
        s.create("/d/b", 0o644).unwrap();

        let dir = s.opendir("/d").unwrap();
        let entries = s.readdir(&dir).unwrap();
        s.releasedir(dir);
        let names: Vec<_> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let a = &entries[0].1;
        assert_eq!(a.size, 700);
        assert_eq!(a.blocks, 2);
        assert_eq!(a.blksize, BLOCK_SIZE as u32);
        assert_eq!(a.mode, 0o600 | libc::S_IFREG as u32);
        assert!(s.getattr("/d").unwrap().is_dir());
    }

    #[test]
    fn attributes_need_ownership() {
        let root = session(0, 0);
        root.create("/theirs", 0o666).unwrap();
        root.chown("/theirs", 7, 7).unwrap();
        let stat = root.getattr("/theirs").unwrap();
        assert_eq!((stat.uid, stat.gid), (7, 7));

        let mut fs = root.fs;
        fs.set_user(8, 8);
        let user = Session::new(fs);
        assert!(matches!(
            user.chmod("/theirs", 0o777),
            Err(FsError::OperationNotPermitted)
        ));
        assert!(matches!(
            user.chown("/theirs", 8, 8),
            Err(FsError::OperationNotPermitted)
        ));
        let mine = user.create("/mine", 0o600).unwrap();
        user.release(mine);
        user.chmod("/mine", 0o400).unwrap();
        assert_eq!(user.getattr("/mine").unwrap().mode & 0o777, 0o400);
        assert!(matches!(
            user.open("/mine", OpenFlags::read_write()),
            Err(FsError::AccessDenied)
        ));
        user.utimens("/mine", 10, 20).unwrap();
        let stat = user.getattr("/mine").unwrap();
        assert_eq!((stat.atime, stat.mtime), (10, 20));
    }

    #[test]
    fn getattr_requires_read_permission() {
        let root = session(0, 0);
        root.create("/secret", 0o600).unwrap();
        let mut fs = root.fs;
        fs.set_user(5, 5);
        let user = Session::new(fs);
        assert!(matches!(
            user.getattr("/secret"),
            Err(FsError::AccessDenied)
        ));
    }

    #[test]
    fn concurrent_writers_on_different_files() {
        let s = Arc::new(session(0, 0));
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    let path = format!("/file{}", i);
                    let file = s.create(&path, 0o644).unwrap();
                    let data = vec![i; 40 * BLOCK_SIZE + 3];
                    for chunk in 0..4 {
                        let offset = chunk * 10 * BLOCK_SIZE;
                        s.write(&file, offset, &data[offset..]).unwrap();
                    }
                    s.release(file);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..4u8 {
            let file = s.open(&format!("/file{}", i), OpenFlags::read_only()).unwrap();
            let mut buf = vec![0u8; 40 * BLOCK_SIZE + 3];
            assert_eq!(s.read(&file, 0, &mut buf).unwrap(), buf.len());
            assert!(buf.iter().all(|b| *b == i));
        }
    }

    #[test]
    fn truncate_while_writing_keeps_files_apart() {
        const LEN: usize = 64 * BLOCK_SIZE;
        let s = Arc::new(session(0, 0));
        s.release(s.create("/f", 0o644).unwrap());
        s.release(s.create("/g", 0o644).unwrap());
        let truncate = OpenFlags {
            truncate: true,
            ..OpenFlags::read_write()
        };

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let s = Arc::clone(&s);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let file = s.open("/f", OpenFlags::read_write()).unwrap();
                let data = vec![0x11u8; LEN];
                while !stop.load(Ordering::Relaxed) {
                    s.write(&file, 0, &data).unwrap();
                    thread::yield_now();
                }
                s.release(file);
            })
        };

        let data = vec![0x22u8; LEN];
        let mut back = vec![0u8; LEN];
        for _ in 0..200 {
            s.release(s.open("/f", truncate).unwrap());
            let g = s.open("/g", truncate).unwrap();
            assert_eq!(s.write(&g, 0, &data).unwrap(), LEN);
            assert_eq!(s.read(&g, 0, &mut back).unwrap(), LEN);
            assert!(back.iter().all(|b| *b == 0x22));
            s.release(g);
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        let f = s.open("/f", OpenFlags::read_only()).unwrap();
        let size = s.getattr("/f").unwrap().size as usize;
        let mut tail = vec![0u8; size];
        assert_eq!(s.read(&f, 0, &mut tail).unwrap(), size);
        assert!(tail.iter().all(|b| *b == 0x11));
    }
}
