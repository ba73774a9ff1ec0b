//! Allocation store
//!
//! Durable record of which container owns which address in one subnet.
//!
//! Every plugin invocation is a fresh process, so the data file is the only
//! shared state. Callers bracket each load/mutate/save sequence with
//! [`AllocationStore::lock`] and [`AllocationStore::unlock`]; the lock is an
//! `flock` on `<root>/<network>/lock`, so different networks never contend.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IpamError;

/// Default root under which each network gets its own directory
pub const DEFAULT_STORE_DIR: &str = "/var/lib/bridgenet";

/// Name of the lock file inside a network directory
pub const LOCK_FILE: &str = "lock";

/// Owner of one allocated address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetInfo {
    pub container_id: String,
    pub if_name: String,
}

/// One allocation, as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub container_id: String,
    pub if_name: String,
}

/// On-disk document: `{"ips": {"<ip>": {...}}, "last": "<ip>"}`
///
/// `last` is written as `""` before the first allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub ips: BTreeMap<Ipv4Addr, ContainerNetInfo>,

    #[serde(default, with = "cursor")]
    pub last: Option<Ipv4Addr>,
}

impl StoreData {
    fn find_by_container(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.ips
            .iter()
            .find(|(_, info)| info.container_id == container_id)
            .map(|(ip, _)| *ip)
    }

    fn insert(&mut self, ip: Ipv4Addr, container_id: &str, if_name: &str) -> Result<(), IpamError> {
        if ip.is_unspecified() {
            return Err(IpamError::InvalidAddress(ip));
        }

        self.ips.insert(
            ip,
            ContainerNetInfo {
                container_id: container_id.to_string(),
                if_name: if_name.to_string(),
            },
        );
        self.last = Some(ip);
        Ok(())
    }

    fn remove_by_container(&mut self, container_id: &str) -> Option<Ipv4Addr> {
        let ip = self.find_by_container(container_id)?;
        self.ips.remove(&ip);
        Some(ip)
    }

    fn records(&self) -> Vec<Allocation> {
        self.ips
            .iter()
            .map(|(ip, info)| Allocation {
                ip: *ip,
                container_id: info.container_id.clone(),
                if_name: info.if_name.clone(),
            })
            .collect()
    }
}

/// Cursor (de)serialization: empty string means "nothing allocated yet"
mod cursor {
    use std::net::Ipv4Addr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(last: &Option<Ipv4Addr>, s: S) -> Result<S::Ok, S::Error> {
        match last {
            Some(ip) => s.collect_str(ip),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Ipv4Addr>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(de::Error::custom)
    }
}

/// Storage capability the allocator needs
///
/// Queries and mutations operate on the data loaded by the most recent
/// [`load_data`](Self::load_data). Anything that must be atomic with respect to
/// other processes has to run between `lock` and `unlock`.
pub trait AllocationStore {
    /// Block until this process holds the store's exclusive lock
    fn lock(&mut self) -> Result<(), IpamError>;

    fn unlock(&mut self) -> Result<(), IpamError>;

    /// Replace in-memory state with what is currently persisted
    fn load_data(&mut self) -> Result<(), IpamError>;

    /// Persist the full in-memory document
    fn save(&mut self) -> Result<(), IpamError>;

    fn contains(&self, ip: Ipv4Addr) -> bool;

    fn find_by_container(&self, container_id: &str) -> Option<Ipv4Addr>;

    fn last_allocated(&self) -> Option<Ipv4Addr>;

    /// All records, ordered by address
    fn records(&self) -> Vec<Allocation>;

    /// Record `ip` as owned by the container, move the cursor to it, and persist
    fn add_record(&mut self, ip: Ipv4Addr, container_id: &str, if_name: &str) -> Result<(), IpamError>;

    /// Drop the container's record and persist. Returns the freed address;
    /// a container with no record is not an error.
    fn remove_by_container(&mut self, container_id: &str) -> Result<Option<Ipv4Addr>, IpamError>;
}

/// Run `f` on freshly loaded data while holding the store lock
///
/// For callers that work on records without an allocator, such as manual
/// cleanup. An error from `f` wins over a failure to unlock.
pub fn with_lock<S, T, F>(store: &mut S, f: F) -> Result<T, IpamError>
where
    S: AllocationStore,
    F: FnOnce(&mut S) -> Result<T, IpamError>,
{
    store.lock()?;

    let result = store.load_data().and_then(|()| f(store));

    match store.unlock() {
        Ok(()) => result,
        Err(unlock_err) => match result {
            Ok(_) => Err(unlock_err),
            Err(e) => {
                warn!(error = %unlock_err, "failed to release store lock after error");
                Err(e)
            }
        },
    }
}

/// File-backed store shared by every process on the host
pub struct FileStore {
    dir: PathBuf,
    data_file: PathBuf,
    lock_file: File,
    data: StoreData,
    loaded: bool,
    locked: bool,
}

impl FileStore {
    /// Open the store for `network` under `store_dir`
    ///
    /// Creates `<store_dir>/<network>/` and its lock file if needed but does not
    /// take the lock and never touches the data file. An empty `store_dir`
    /// selects [`DEFAULT_STORE_DIR`].
    pub fn open(store_dir: impl AsRef<Path>, network: &str) -> Result<Self, IpamError> {
        let store_dir = store_dir.as_ref();
        let root = if store_dir.as_os_str().is_empty() {
            Path::new(DEFAULT_STORE_DIR)
        } else {
            store_dir
        };

        let dir = root.join(network);
        fs::create_dir_all(&dir).map_err(|e| {
            IpamError::io(format!("failed to create store directory {}", dir.display()), e)
        })?;

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                IpamError::io(format!("failed to open lock file {}", lock_path.display()), e)
            })?;

        let data_file = dir.join(format!("{}.json", network));

        Ok(Self {
            dir,
            data_file,
            lock_file,
            data: StoreData::default(),
            loaded: false,
            locked: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    fn tmp_file(&self) -> PathBuf {
        let name = self
            .data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!(".{}.tmp", name))
    }

    /// Write `data` to a temp file, fsync it, then rename over the data file
    fn write_atomic(&self, data: &StoreData) -> Result<(), IpamError> {
        let json = serde_json::to_vec(data).map_err(IpamError::Encode)?;
        let tmp_path = self.tmp_file();

        let mut file = File::create(&tmp_path)
            .map_err(|e| IpamError::io("failed to create store temp file", e))?;
        file.write_all(&json)
            .map_err(|e| IpamError::io("failed to write store temp file", e))?;
        file.sync_all()
            .map_err(|e| IpamError::io("failed to sync store temp file", e))?;

        fs::rename(&tmp_path, &self.data_file).map_err(|e| {
            IpamError::io(
                format!("failed to replace store file {}", self.data_file.display()),
                e,
            )
        })?;

        sync_dir(&self.dir)
    }
}

/// Flush a directory so a rename inside it survives power loss
fn sync_dir(dir: &Path) -> Result<(), IpamError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| IpamError::io(format!("failed to sync store directory {}", dir.display()), e))
}

impl AllocationStore for FileStore {
    fn lock(&mut self) -> Result<(), IpamError> {
        self.lock_file
            .lock_exclusive()
            .map_err(|e| IpamError::io("failed to acquire store lock", e))?;
        self.locked = true;
        debug!(dir = %self.dir.display(), "store lock acquired");
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), IpamError> {
        // State loaded under this lock is stale once another process can get in.
        self.loaded = false;
        if !self.locked {
            return Ok(());
        }
        FileExt::unlock(&self.lock_file)
            .map_err(|e| IpamError::io("failed to release store lock", e))?;
        self.locked = false;
        debug!(dir = %self.dir.display(), "store lock released");
        Ok(())
    }

    fn load_data(&mut self) -> Result<(), IpamError> {
        let data = match fs::read(&self.data_file) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| IpamError::Corrupt {
                path: self.data_file.clone(),
                source,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let empty = StoreData::default();
                self.write_atomic(&empty)?;
                debug!(file = %self.data_file.display(), "created empty allocation store");
                empty
            }
            Err(e) => {
                return Err(IpamError::io(
                    format!("failed to read store file {}", self.data_file.display()),
                    e,
                ))
            }
        };

        self.data = data;
        self.loaded = true;
        Ok(())
    }

    fn save(&mut self) -> Result<(), IpamError> {
        if !self.loaded {
            return Err(IpamError::NotLoaded);
        }
        self.write_atomic(&self.data)
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        self.data.ips.contains_key(&ip)
    }

    fn find_by_container(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.data.find_by_container(container_id)
    }

    fn last_allocated(&self) -> Option<Ipv4Addr> {
        self.data.last
    }

    fn records(&self) -> Vec<Allocation> {
        self.data.records()
    }

    fn add_record(&mut self, ip: Ipv4Addr, container_id: &str, if_name: &str) -> Result<(), IpamError> {
        if !self.loaded {
            return Err(IpamError::NotLoaded);
        }
        self.data.insert(ip, container_id, if_name)?;
        self.save()
    }

    fn remove_by_container(&mut self, container_id: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        if !self.loaded {
            return Err(IpamError::NotLoaded);
        }
        match self.data.remove_by_container(container_id) {
            Some(ip) => {
                self.save()?;
                Ok(Some(ip))
            }
            None => Ok(None),
        }
    }
}

/// In-process store with the same semantics as [`FileStore`] minus durability
///
/// Locking is a no-op; only suitable when a single process owns the subnet.
#[derive(Debug, Default)]
pub struct MemoryStore {
    persisted: StoreData,
    data: StoreData,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the document has been persisted
    pub fn saves(&self) -> usize {
        self.saves
    }

    /// The last persisted document
    pub fn persisted(&self) -> &StoreData {
        &self.persisted
    }
}

impl AllocationStore for MemoryStore {
    fn lock(&mut self) -> Result<(), IpamError> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), IpamError> {
        Ok(())
    }

    fn load_data(&mut self) -> Result<(), IpamError> {
        self.data = self.persisted.clone();
        Ok(())
    }

    fn save(&mut self) -> Result<(), IpamError> {
        self.persisted = self.data.clone();
        self.saves += 1;
        Ok(())
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        self.data.ips.contains_key(&ip)
    }

    fn find_by_container(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.data.find_by_container(container_id)
    }

    fn last_allocated(&self) -> Option<Ipv4Addr> {
        self.data.last
    }

    fn records(&self) -> Vec<Allocation> {
        self.data.records()
    }

    fn add_record(&mut self, ip: Ipv4Addr, container_id: &str, if_name: &str) -> Result<(), IpamError> {
        self.data.insert(ip, container_id, if_name)?;
        self.save()
    }

    fn remove_by_container(&mut self, container_id: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        match self.data.remove_by_container(container_id) {
            Some(ip) => {
                self.save()?;
                Ok(Some(ip))
            }
            None => Ok(None),
        }
    }
}
