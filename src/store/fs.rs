use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use parking_lot::Mutex;
use tracing::debug;

use super::{CrlStore, KeyStorage, SerialAllocator};
use crate::error::StoreError;
use crate::pair::KeyCertPair;

const ORDER_FILE: &str = "order";

fn not_found_or_io(e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::Io(e)
    }
}

/// Writes `content` next to `path` and renames it into place, so readers see
/// either the old or the new file, never a torn one.
fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Directory-backed key storage.
///
/// Layout: `<root>/<cn>/<serial-hex>_cert.pem`, `<root>/<cn>/<serial-hex>_pkey.pem`
/// and `<root>/<cn>/order`, which lists serials in insertion order.
pub struct DirKeyStorage {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirKeyStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn cn_dir(&self, common_name: &str) -> Result<PathBuf, StoreError> {
        let valid = !common_name.is_empty()
            && common_name != "."
            && common_name != ".."
            && !common_name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::Invalid(format!(
                "common name {common_name:?} can not be used as a directory"
            )));
        }
        Ok(self.root.join(common_name))
    }

    fn serials(&self, dir: &Path) -> Result<Vec<BigUint>, StoreError> {
        let order = fs::read_to_string(dir.join(ORDER_FILE)).map_err(not_found_or_io)?;
        order
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                BigUint::parse_bytes(line.trim().as_bytes(), 16)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad serial {line:?} in index")))
            })
            .collect()
    }

    fn load(&self, dir: &Path, common_name: &str, serial: BigUint) -> Result<KeyCertPair, StoreError> {
        let stem = serial.to_str_radix(16);
        KeyCertPair::load(
            dir.join(format!("{stem}_cert.pem")),
            dir.join(format!("{stem}_pkey.pem")),
            common_name,
            serial,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                StoreError::Corrupt(format!("indexed pair {stem} for {common_name} is missing"))
            }
            _ => StoreError::Io(e),
        })
    }
}

impl KeyStorage for DirKeyStorage {
    fn put(&self, pair: &KeyCertPair) -> Result<(), StoreError> {
        let dir = self.cn_dir(pair.common_name())?;
        let stem = pair.serial().to_str_radix(16);
        let _guard = self.lock.lock();
        if dir.join(format!("{stem}_cert.pem")).exists() {
            return Err(StoreError::Invalid(format!("serial {stem} already stored")));
        }
        pair.save(&dir, &stem)?;
        let mut order = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ORDER_FILE))?;
        writeln!(order, "{stem}")?;
        order.sync_all()?;
        debug!(common_name = pair.common_name(), serial = %stem, "stored pair");
        Ok(())
    }

    fn get_last_by_cn(&self, common_name: &str) -> Result<KeyCertPair, StoreError> {
        let dir = self.cn_dir(common_name)?;
        let serial = self.serials(&dir)?.pop().ok_or(StoreError::NotFound)?;
        self.load(&dir, common_name, serial)
    }

    fn get_by_cn(&self, common_name: &str) -> Result<Vec<KeyCertPair>, StoreError> {
        let dir = self.cn_dir(common_name)?;
        let serials = self.serials(&dir)?;
        if serials.is_empty() {
            return Err(StoreError::NotFound);
        }
        serials
            .into_iter()
            .map(|serial| self.load(&dir, common_name, serial))
            .collect()
    }
}

/// Allocator persisting the next free serial (hex) in a file.
///
/// The file is advanced before a serial is handed out, so a crash can skip a
/// value but never reissue one.
pub struct FileSerialAllocator {
    path: PathBuf,
    first: BigUint,
    lock: Mutex<()>,
}

impl FileSerialAllocator {
    /// `first` is used only when the counter file does not exist yet.
    pub fn new<P: AsRef<Path>>(path: P, first: BigUint) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            first,
            lock: Mutex::new(()),
        }
    }
}

impl SerialAllocator for FileSerialAllocator {
    fn next(&self) -> Result<BigUint, StoreError> {
        let _guard = self.lock.lock();
        let serial = match fs::read_to_string(&self.path) {
            Ok(text) => BigUint::parse_bytes(text.trim().as_bytes(), 16).ok_or_else(|| {
                StoreError::Corrupt(format!("serial file {} is not hex", self.path.display()))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => self.first.clone(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let following = &serial + 1u32;
        write_atomically(&self.path, following.to_str_radix(16).as_bytes())?;
        Ok(serial)
    }
}

/// Single-file CRL holder. Writes go through a temporary file and a rename.
///
/// `compare_and_put` is atomic among users of the same `FileCrlStore` value only.
pub struct FileCrlStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCrlStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

impl CrlStore for FileCrlStore {
    fn get(&self) -> Result<Vec<u8>, StoreError> {
        fs::read(&self.path).map_err(not_found_or_io)
    }

    fn put(&self, crl_pem: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        write_atomically(&self.path, &crl_pem)?;
        Ok(())
    }

    fn compare_and_put(&self, expected: Option<&[u8]>, crl_pem: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let current = match fs::read(&self.path) {
            Ok(current) => Some(current),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::Io(e)),
        };
        if current.as_deref() != expected {
            return Err(StoreError::Conflict);
        }
        write_atomically(&self.path, &crl_pem)?;
        Ok(())
    }
}
