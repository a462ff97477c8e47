use std::{
    ffi::OsString,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use super::{VaultRecords, VaultStore};
use crate::{
    constants::STORE_FORMAT_VERSION,
    error::{Error, Result},
};

/// Vault records kept as one JSON document on disk.
///
/// Commits write a sibling temp file, sync it and rename it over the
/// document, so a crash leaves either the old or the new state.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() && !create_if_missing {
            return Err(Error::StoreOpenError(format!(
                "{} does not exist",
                path.display()
            )));
        }
        if path.is_dir() {
            return Err(Error::StoreOpenError(format!(
                "{} is a directory",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl VaultStore for FileStore {
    fn load(&mut self) -> Result<Option<VaultRecords>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::StoreOpenError(format!("{}: {e}", self.path.display())))?;
        let records: VaultRecords = serde_json::from_str(&content)
            .map_err(|e| Error::StoreOpenError(format!("{}: {e}", self.path.display())))?;
        if records.version() != STORE_FORMAT_VERSION {
            return Err(Error::StoreOpenError(format!(
                "{}: unsupported format version {}",
                self.path.display(),
                records.version()
            )));
        }
        Ok(Some(records))
    }

    fn commit(&mut self, records: &VaultRecords) -> Result<()> {
        let json = serde_json::to_vec(records)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        log::debug!("committed {} bytes to {}", json.len(), self.path.display());
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
