use crate::{Error, Result, StorageAdapter};
use std::fs;
use std::path::PathBuf;

/// One file per key under `base_path`.
///
/// File names are the hex encoding of the key, so keys containing `/`, `:` or
/// `@` (user ids, device ids) map to valid names and can be listed back
/// exactly.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", hex::encode(key)))
    }

    fn path_to_key(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(".json")?;
        let bytes = hex::decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_to_path(key);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);
        let tmp_path = path.with_extension("tmp");

        // Write-then-rename keeps readers from ever seeing a truncated record.
        fs::write(&tmp_path, value)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| Error::Storage(format!("Failed to replace file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to read directory: {}", e)))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?;

            let file_name = entry.file_name();
            let Some(key) = Self::path_to_key(&file_name.to_string_lossy()) else {
                continue;
            };

            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        Ok(keys)
    }
}
