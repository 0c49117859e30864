use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// The narrow seam between the session layer and whatever holds the
/// files. A receive handle only becomes the real file on [`commit`]; a
/// transfer that dies mid-way leaves nothing in place.
///
/// [`commit`]: FileStore::commit
pub trait FileStore {
    type Source: Read + Seek;
    type Dest: Write + Seek;

    /// Open `path` for sending: the handle, its size and its mode.
    fn open_send(&mut self, path: &str) -> io::Result<(Self::Source, u64, u32)>;

    fn open_recv(&mut self, path: &str, mode: u32) -> io::Result<Self::Dest>;

    /// Move a fully received file into place.
    fn commit(&mut self, dest: Self::Dest) -> io::Result<()>;

    /// Throw away a partial receive.
    fn discard(&mut self, dest: Self::Dest);
}

/// [`FileStore`] on the local filesystem. Receives go to `<path>.tmp`
/// first and are renamed into place on commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[derive(Debug)]
pub struct LocalDest {
    file: File,
    tmp: PathBuf,
    path: PathBuf,
    mode: u32,
}

impl Write for LocalDest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LocalDest {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl FileStore for LocalFs {
    type Source = File;
    type Dest = LocalDest;

    fn open_send(&mut self, path: &str) -> io::Result<(File, u64, u32)> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            meta.mode() & 0o777
        };
        #[cfg(not(unix))]
        let mode = 0o644;
        Ok((file, meta.len(), mode))
    }

    fn open_recv(&mut self, path: &str, mode: u32) -> io::Result<LocalDest> {
        let path = PathBuf::from(path);
        let tmp = tmp_name(&path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        Ok(LocalDest { file, tmp, path, mode })
    }

    fn commit(&mut self, dest: LocalDest) -> io::Result<()> {
        let LocalDest { file, tmp, path, mode } = dest;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        #[cfg(unix)]
        if mode != 0 {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn discard(&mut self, dest: LocalDest) {
        let LocalDest { file, tmp, .. } = dest;
        drop(file);
        let _ = fs::remove_file(&tmp);
    }
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("courier-fs-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn commit_renames_into_place() {
        let dir = scratch("commit");
        let path = dir.join("in.dat");
        let mut fs_ = LocalFs;
        let mut dest = fs_.open_recv(path.to_str().unwrap(), 0o600).unwrap();
        dest.write_all(b"payload").unwrap();
        assert!(!path.exists());
        fs_.commit(dest).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        assert!(!path.with_extension("dat.tmp").exists());
    }

    #[test]
    fn discard_leaves_nothing() {
        let dir = scratch("discard");
        let path = dir.join("gone.dat");
        let mut fs_ = LocalFs;
        let mut dest = fs_.open_recv(path.to_str().unwrap(), 0o644).unwrap();
        dest.write_all(b"half").unwrap();
        fs_.discard(dest);
        assert!(!path.exists());
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
    }
}
