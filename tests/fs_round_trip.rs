use silt::{update_dentry, update_inode, Dentry, Inode, Transaction, TYPE_DIR, TYPE_REG};
use test_log::test;

#[test]
fn create_and_read_back() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = silt::Config::new(dir.path().join("img")).format()?;

    // The root directory exists on a fresh image.
    let root = fs.read_inode(silt::ROOT_INO)?.expect("root inode");
    assert_eq!(TYPE_DIR, root.kind);
    assert_eq!(1, root.links);

    let ino = fs.allocate_ino();
    let mut inode = Inode::new(ino, TYPE_REG);
    inode.links = 1;
    inode.size = 4096;
    inode.perm = 0o644;

    let dentry = Dentry::new(silt::ROOT_INO, b"hello.txt", ino, TYPE_REG);

    let mut trans = Transaction::new();
    update_inode(&mut trans, &inode);
    update_dentry(&mut trans, &dentry);
    fs.submit(trans).wait()?;

    assert_eq!(Some(inode.clone()), fs.read_inode(ino)?);
    let found = fs.read_dentry(silt::ROOT_INO, b"hello.txt")?.expect("dentry");
    assert_eq!(ino, found.ino);

    let listing = fs.read_dir(silt::ROOT_INO)?;
    assert_eq!(1, listing.len());
    assert_eq!(b"hello.txt".to_vec(), listing[0].name);

    assert_eq!(None, fs.read_dentry(silt::ROOT_INO, b"missing.txt")?);
    fs.close()
}

#[test]
fn close_and_reopen() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("img");

    let ino;
    {
        let fs = silt::Config::new(&path).format()?;
        ino = fs.allocate_ino();

        let mut inode = Inode::new(ino, TYPE_REG);
        inode.links = 1;

        let mut trans = Transaction::new();
        update_inode(&mut trans, &inode);
        update_dentry(
            &mut trans,
            &Dentry::new(silt::ROOT_INO, b"kept", ino, TYPE_REG),
        );
        fs.submit(trans).wait()?;
        fs.close()?;
    }

    let fs = silt::Config::new(&path).open()?;
    assert!(fs.read_inode(ino)?.is_some());
    assert!(fs.read_dentry(silt::ROOT_INO, b"kept")?.is_some());
    fs.close()
}

#[test]
fn unlink_hides_the_entry() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = silt::Config::new(dir.path().join("img")).format()?;

    let ino = fs.allocate_ino();
    let mut inode = Inode::new(ino, TYPE_REG);
    inode.links = 1;

    let mut trans = Transaction::new();
    update_inode(&mut trans, &inode);
    update_dentry(
        &mut trans,
        &Dentry::new(silt::ROOT_INO, b"victim", ino, TYPE_REG),
    );
    fs.submit(trans).wait()?;

    // Unlink: tombstone both records in one transaction.
    let mut dead_dentry = Dentry::new(silt::ROOT_INO, b"victim", ino, TYPE_REG);
    dead_dentry.mark_deleted();
    inode.links = 0;
    inode.mark_deleted();

    let mut trans = Transaction::new();
    update_inode(&mut trans, &inode);
    update_dentry(&mut trans, &dead_dentry);
    fs.submit(trans).wait()?;

    assert_eq!(None, fs.read_inode(ino)?);
    assert_eq!(None, fs.read_dentry(silt::ROOT_INO, b"victim")?);
    assert!(fs.read_dir(silt::ROOT_INO)?.is_empty());

    // Still gone after the tombstones move through a flush.
    fs.commit()?;
    assert_eq!(None, fs.read_inode(ino)?);
    assert_eq!(None, fs.read_dentry(silt::ROOT_INO, b"victim")?);
    fs.close()
}

#[test]
fn rename_moves_the_entry() -> silt::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = silt::Config::new(dir.path().join("img")).format()?;

    let ino = fs.allocate_ino();
    let mut inode = Inode::new(ino, TYPE_REG);
    inode.links = 1;

    let mut trans = Transaction::new();
    update_inode(&mut trans, &inode);
    update_dentry(
        &mut trans,
        &Dentry::new(silt::ROOT_INO, b"before", ino, TYPE_REG),
    );
    fs.submit(trans).wait()?;

    // Rename is one transaction: link the new name, tombstone the old.
    let mut old = Dentry::new(silt::ROOT_INO, b"before", ino, TYPE_REG);
    old.mark_deleted();

    let mut trans = Transaction::new();
    update_dentry(&mut trans, &Dentry::new(silt::ROOT_INO, b"after", ino, TYPE_REG));
    update_dentry(&mut trans, &old);
    fs.submit(trans).wait()?;

    assert_eq!(None, fs.read_dentry(silt::ROOT_INO, b"before")?);
    assert_eq!(
        Some(ino),
        fs.read_dentry(silt::ROOT_INO, b"after")?.map(|d| d.ino)
    );

    let listing = fs.read_dir(silt::ROOT_INO)?;
    assert_eq!(1, listing.len());
    assert_eq!(b"after".to_vec(), listing[0].name);
    fs.close()
}
