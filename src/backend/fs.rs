//! Filesystem-backed blob store.
//!
//! Layout under the repository directory:
//!
//! ```text
//! CONFIG
//! states/<mac>
//! packfiles/<mac>
//! locks/<mac>
//! ```
//!
//! Puts stream to a temp file in the repository directory and rename into
//! place, so readers never observe a partial blob.

use std::fs::{self, File};
use std::io::prelude::*;
use std::io::{self, SeekFrom};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use super::{Backend, Kind};
use crate::error::{Error, Result};
use crate::mac::Mac;

const CONFIG_NAME: &str = "CONFIG";

pub struct FilesystemBackend {
    base: Utf8PathBuf,
}

impl FilesystemBackend {
    pub fn new<P: Into<Utf8PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    fn path_of(&self, kind: Kind, mac: &Mac) -> Utf8PathBuf {
        let mut path = self.base.clone();
        path.push(kind.namespace());
        path.push(mac.to_string());
        path
    }

    fn open_packfile(&self, mac: &Mac) -> Result<File> {
        let path = self.path_of(Kind::Packfile, mac);
        File::open(&path).map_err(|e| not_found(e, Kind::Packfile, mac))
    }
}

fn not_found(e: io::Error, kind: Kind, mac: &Mac) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("{}/{mac}", kind.namespace()))
    } else {
        Error::Io(e)
    }
}

impl Backend for FilesystemBackend {
    fn create(&self, config: &[u8]) -> Result<()> {
        let config_path = self.base.join(CONFIG_NAME);
        if config_path.exists() {
            return Err(Error::InvalidArgument(format!(
                "{} already holds a repository",
                self.base
            )));
        }
        fs::create_dir_all(&self.base)?;
        for kind in [Kind::State, Kind::Packfile, Kind::Lock] {
            fs::create_dir_all(self.base.join(kind.namespace()))?;
        }
        write_atomically(&self.base, &config_path, &mut io::Cursor::new(config))?;
        info!("Initialized repository at {}", self.base);
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        fs::read(self.base.join(CONFIG_NAME))
            .map_err(|e| not_found_named(e, &format!("repository at {}", self.base)))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn list(&self, kind: Kind) -> Result<Vec<Mac>> {
        let dir = self.base.join(kind.namespace());
        let mut macs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("Ignoring non-UTF-8 name in {dir}");
                continue;
            };
            // Stray temp files from a crashed writer aren't blobs.
            match Mac::from_str(name) {
                Ok(mac) => macs.push(mac),
                Err(_) => trace!("Ignoring {name} in {dir}"),
            }
        }
        macs.sort();
        Ok(macs)
    }

    fn put(&self, kind: Kind, mac: &Mac, from: &mut dyn Read) -> Result<()> {
        let to = self.path_of(kind, mac);
        if to.exists() {
            // Content-addressed: same MAC, same bytes.
            trace!("{}/{mac} already present, skipping put", kind.namespace());
            return Ok(());
        }
        write_atomically(&self.base, &to, from)
    }

    fn get(&self, kind: Kind, mac: &Mac) -> Result<Box<dyn Read + Send>> {
        let path = self.path_of(kind, mac);
        let fh = File::open(&path).map_err(|e| not_found(e, kind, mac))?;
        Ok(Box::new(fh))
    }

    fn delete(&self, kind: Kind, mac: &Mac) -> Result<()> {
        match fs::remove_file(self.path_of(kind, mac)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn get_packfile_blob(&self, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut fh = self.open_packfile(mac)?;
        fh.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; length as usize];
        fh.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Corrupt(format!(
                    "packfile {mac} too short for blob at {offset}+{length}"
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }
}

fn not_found_named(e: io::Error, what: &str) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(what.to_owned())
    } else {
        Error::Io(e)
    }
}

/// Stream to a temp file in `base`, sync, then rename to `to`.
fn write_atomically(base: &Utf8Path, to: &Utf8Path, from: &mut dyn Read) -> Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix("temp-kloset-")
        .tempfile_in(base)
        .map_err(Error::Io)?;
    io::copy(from, &mut temp)?;
    temp.as_file().sync_all()?;
    temp.persist(to)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_mac(fill: u8) -> Mac {
        Mac::from_bytes([fill; 32])
    }

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::new(Utf8Path::from_path(dir.path()).unwrap());
        backend.create(b"config bytes")?;
        assert_eq!(backend.open()?, b"config bytes");

        let mac = test_mac(1);
        backend.put(Kind::Packfile, &mac, &mut io::Cursor::new(b"0123456789"))?;
        let b: &dyn Backend = &backend;
        assert_eq!(b.read_all(Kind::Packfile, &mac)?, b"0123456789");
        assert_eq!(b.packfiles()?, vec![mac]);

        assert_eq!(backend.get_packfile_blob(&mac, 2, 3)?, b"234");

        backend.delete(Kind::Packfile, &mac)?;
        assert!(matches!(
            backend.get(Kind::Packfile, &mac),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn duplicate_put_is_a_noop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::new(Utf8Path::from_path(dir.path()).unwrap());
        backend.create(b"")?;

        let mac = test_mac(2);
        backend.put(Kind::State, &mac, &mut io::Cursor::new(b"first"))?;
        backend.put(Kind::State, &mac, &mut io::Cursor::new(b"first"))?;
        let b: &dyn Backend = &backend;
        assert_eq!(b.states()?.len(), 1);
        Ok(())
    }

    #[test]
    fn create_refuses_to_clobber() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FilesystemBackend::new(Utf8Path::from_path(dir.path()).unwrap());
        backend.create(b"")?;
        assert!(matches!(
            backend.create(b""),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
