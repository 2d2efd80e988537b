use silt::{update_inode, Inode, Transaction, TYPE_REG};
use std::time::Duration;
use test_log::test;

#[test]
fn background_flush_keeps_reads_consistent() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;

    // Tiny thresholds and a fast tick so the flusher actually runs
    // during the test.
    let fs = silt::Config::new(dir.path().join("img"))
        .memtable_size(2 * 1024)
        .tier0_size(16 * 1024)
        .flusher_tick(Duration::from_millis(20))
        .commit_interval(Duration::from_millis(50))
        .format()?;

    const COUNT: u64 = 2000;

    for i in 0..COUNT {
        let ino = 100 + i;
        let mut inode = Inode::new(ino, TYPE_REG);
        inode.links = 1;
        inode.size = i;

        let mut trans = Transaction::new();
        update_inode(&mut trans, &inode);
        let handle = fs.submit(trans);

        // Ack every write so the WAL keeps pace with the flusher.
        handle.wait()?;

        if i % 97 == 0 {
            // Reads interleave with background flushes and merges.
            let read = fs.read_inode(100 + i / 2)?.expect("inode visible");
            assert_eq!(i / 2, read.size);
        }
    }

    // Let the flusher catch up, then verify everything.
    std::thread::sleep(Duration::from_millis(200));
    for i in 0..COUNT {
        let read = fs.read_inode(100 + i)?.expect("inode survived flushing");
        assert_eq!(i, read.size);
    }

    assert!(fs.generation() > 1, "checkpoints were written");
    fs.close()
}

#[test]
fn overwrites_keep_newest_version_across_layers() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = silt::Config::new(dir.path().join("img"))
        .memtable_size(1024)
        .format()?;

    let ino = fs.allocate_ino();

    for version in 1u64..=10 {
        let mut inode = Inode::new(ino, TYPE_REG);
        inode.links = 1;
        inode.size = version;

        let mut trans = Transaction::new();
        update_inode(&mut trans, &inode);
        fs.submit(trans).wait()?;

        if version % 3 == 0 {
            // Spread versions of the same key across tiers.
            fs.commit()?;
        }

        let read = fs.read_inode(ino)?.expect("inode present");
        assert_eq!(version, read.size, "version {version} visible");
    }
    fs.close()
}
