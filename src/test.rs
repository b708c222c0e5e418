#![allow(unused)]
use std::{fs::remove_file, path::PathBuf, sync::Arc};

use super::device::{ensure_stores, store_paths, StripedDevice};
use super::fs::{
    BlockDevice, DiskInodeType, FileSystem, FsError, FsResult, BLOCK_SIZE, DIRENT_SIZE,
};
use super::session::{OpenFlags, Session};

/// 在 target/ 下准备 count 个全新的后备文件, 每个 blocks_per_store 块
fn fresh_stores(name: &str, count: usize, blocks_per_store: usize) -> Vec<PathBuf> {
    let paths = store_paths(&format!("target/{}-", name), count);
    for path in paths.iter() {
        let _ = remove_file(path);
    }
    ensure_stores(&paths, (blocks_per_store * BLOCK_SIZE) as u64).unwrap();
    paths
}

fn open_device(paths: &[PathBuf], password: &str) -> Arc<dyn BlockDevice> {
    Arc::new(StripedDevice::open(paths, password).unwrap())
}

fn format(paths: &[PathBuf], password: &str) -> FileSystem {
    let device = StripedDevice::open(paths, password).unwrap();
    let total_blocks = device.total_blocks() as u32;
    FileSystem::format(Arc::new(device), total_blocks, 1).unwrap()
}

fn reopen(paths: &[PathBuf], password: &str) -> FsResult<FileSystem> {
    FileSystem::open(open_device(paths, password))
}

#[test]
fn efs_test() {
    let paths = fresh_stores("efs", 4, 2048);
    let fs = format(&paths, "");
    let root_inode = fs.root_inode();

    fs.create("/filea", DiskInodeType::File, 0o644).unwrap();
    fs.create("/fileb", DiskInodeType::File, 0o644).unwrap();
    let names: Vec<_> = root_inode.ls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["filea", "fileb"]);

    let filea = fs.find("/filea").unwrap();

    let greet_str = "Hello, world!";
    filea.write_at(0, greet_str.as_bytes(), &fs).unwrap();
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer);
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    let random_str_test = |len: usize| {
        filea.clear(&fs);
        assert_eq!(filea.read_at(0, &mut [0u8; 233]), 0);
        let mut str = String::new();
        // random digit
        for _ in 0..len {
            str.push(char::from(b'0' + rand::random::<u8>() % 10));
        }
        filea.write_at(0, str.as_bytes(), &fs).unwrap();
        let mut read_buffer = [0u8; 127];
        let mut offset = 0usize;
        let mut read_str = String::new();
        loop {
            let len = filea.read_at(offset, &mut read_buffer);
            if len == 0 {
                break;
            }
            offset += len;
            read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
        }
        assert_eq!(str, read_str);
    };

    random_str_test(4 * BLOCK_SIZE);
    random_str_test(8 * BLOCK_SIZE + BLOCK_SIZE / 2);
    random_str_test(100 * BLOCK_SIZE);
    random_str_test(70 * BLOCK_SIZE + BLOCK_SIZE / 7);
    random_str_test((12 + 128) * BLOCK_SIZE);
    random_str_test(400 * BLOCK_SIZE);
    random_str_test(1000 * BLOCK_SIZE);
    random_str_test(2000 * BLOCK_SIZE);
}

#[test]
fn big_file_survives_reopen() {
    const LEN: usize = 8 * 1024 * 1024;
    let paths = fresh_stores("big", 4, 6144);
    {
        let fs = format(&paths, "passphrase");
        let file = fs.create("/test", DiskInodeType::File, 0o644).unwrap();
        let data: Vec<u8> = (0..LEN).map(|i| (i % 256) as u8).collect();
        assert_eq!(file.write_at(0, &data, &fs).unwrap(), LEN);
        // 关闭时写回全部脏块
    }

    let fs = reopen(&paths, "passphrase").unwrap();
    let file = fs.find("/test").unwrap();
    assert_eq!(file.size(), LEN);
    let mut data = vec![0u8; LEN];
    assert_eq!(file.read_at(0, &mut data), LEN);
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(*byte, (i % 256) as u8, "byte {} differs", i);
    }
}

#[test]
fn wrong_password_is_rejected() {
    let paths = fresh_stores("password", 2, 1536);
    drop(format(&paths, "right"));
    assert!(matches!(
        reopen(&paths, "wrong"),
        Err(FsError::InvalidFilesystem)
    ));
    // 失败的尝试不影响正确的口令
    assert!(reopen(&paths, "right").is_ok());
}

#[test]
fn directory_listing_excludes_tombstones() {
    let paths = fresh_stores("tombstone", 4, 1024);
    let fs = format(&paths, "");
    fs.create("/dir", DiskInodeType::Directory, 0o755).unwrap();
    for name in ["one", "two", "three"] {
        fs.create(&format!("/dir/{}", name), DiskInodeType::File, 0o644)
            .unwrap();
    }
    fs.unlink("/dir/two").unwrap();

    let dir = fs.find("/dir").unwrap();
    let names: Vec<_> = dir.ls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["one", "three"]);
    assert_eq!(dir.size(), 3 * DIRENT_SIZE);
    assert_eq!(dir.get_dirent_num(), 2);

    // 重新创建同名文件: 追加新的槽位, 旧槽位保持为空
    fs.create("/dir/two", DiskInodeType::File, 0o644).unwrap();
    let names: Vec<_> = dir.ls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["one", "three", "two"]);
    assert_eq!(dir.size(), 4 * DIRENT_SIZE);
}

#[test]
fn hard_links_share_data_until_last_name() {
    let paths = fresh_stores("links", 4, 1024);
    let session = Session::new(format(&paths, ""));
    let file = session.create("/orig", 0o644).unwrap();
    session.write(&file, 0, b"shared bytes").unwrap();
    session.release(file);

    session.mkdir("/sub", 0o755).unwrap();
    session.link("/orig", "/sub/alias").unwrap();
    assert_eq!(session.getattr("/orig").unwrap().nlink, 2);
    assert_eq!(
        session.getattr("/orig").unwrap().ino,
        session.getattr("/sub/alias").unwrap().ino
    );
    assert!(matches!(
        session.link("/orig", "/sub/alias"),
        Err(FsError::AlreadyExists)
    ));

    session.unlink("/orig").unwrap();
    let alias = session
        .open("/sub/alias", OpenFlags::read_only())
        .unwrap();
    let mut buf = [0u8; 12];
    assert_eq!(session.read(&alias, 0, &mut buf).unwrap(), 12);
    assert_eq!(&buf, b"shared bytes");
    session.release(alias);

    session.rename("/sub/alias", "/back").unwrap();
    assert_eq!(session.getattr("/back").unwrap().nlink, 1);
    session.unlink("/back").unwrap();
    assert!(matches!(session.getattr("/back"), Err(FsError::NotFound)));
    assert!(matches!(
        session.rename("/sub", "/other"),
        Err(FsError::OperationNotPermitted)
    ));
}

#[test]
fn full_device_reports_no_space() {
    // 数据区只有几十块
    let paths = fresh_stores("full", 2, 540);
    let session = Session::new(format(&paths, ""));
    let file = session.create("/fill", 0o644).unwrap();
    let chunk = vec![0x5au8; 8 * BLOCK_SIZE];
    let mut offset = 0;
    let err = loop {
        match session.write(&file, offset, &chunk) {
            Ok(len) => offset += len,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, FsError::NoSpace));
    assert_eq!(err.errno(), libc::ENOSPC);
    assert_eq!(session.getattr("/fill").unwrap().size as usize, offset);

    // 删除之后空间回来了
    session.release(file);
    session.unlink("/fill").unwrap();
    let again = session.create("/again", 0o644).unwrap();
    assert_eq!(
        session.write(&again, 0, &chunk).unwrap(),
        chunk.len()
    );
}

#[test]
fn tree_survives_reopen() {
    let paths = fresh_stores("tree", 4, 1024);
    {
        let session = Session::new(format(&paths, "k"));
        session.mkdir("/a", 0o755).unwrap();
        session.mkdir("/a/b", 0o700).unwrap();
        let file = session.create("/a/b/c", 0o600).unwrap();
        session.write(&file, 100, b"tail").unwrap();
        session.release(file);
        session.chmod("/a", 0o711).unwrap();
    }
    let session = Session::new(reopen(&paths, "k").unwrap());
    assert_eq!(session.getattr("/a").unwrap().mode & 0o777, 0o711);
    let stat = session.getattr("/a/b/c").unwrap();
    assert_eq!(stat.size, 104);
    let file = session.open("/a/b/c", OpenFlags::read_only()).unwrap();
    let mut buf = [0xffu8; 104];
    assert_eq!(session.read(&file, 0, &mut buf).unwrap(), 104);
    assert!(buf[..100].iter().all(|b| *b == 0));
    assert_eq!(&buf[100..], b"tail");
}
