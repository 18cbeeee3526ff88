use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// What `stat` reports about a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub len: u64,
    pub is_dir: bool,
}

/// A directory the store keeps its files in. Names passed to the methods are
/// relative to the directory and may contain `/` separators.
///
/// Every mutating call is durable when it returns: writes are synced before
/// the future resolves.
pub trait StoreDir: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn cd(&self, name: &str) -> Self;

    /// Names of the immediate children, sorted. A missing directory is empty.
    fn ls(&self) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;

    fn stat(&self, name: &str) -> impl Future<Output = anyhow::Result<Option<Stat>>> + Send;

    fn read(&self, name: &str) -> impl Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send;

    /// Reads at most `len` bytes from the start of the file.
    fn read_prefix(
        &self,
        name: &str,
        len: usize,
    ) -> impl Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send;

    /// Creates or truncates `name` and writes `data` to it.
    fn write(&self, name: &str, data: &[u8]) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Appends `data`, creating the file if needed.
    fn append(&self, name: &str, data: &[u8]) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn truncate(&self, name: &str, len: u64) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Creates `name` only if nothing exists there yet. Returns `false` if
    /// the name was already taken.
    fn create_new(
        &self,
        name: &str,
        data: &[u8],
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    fn unlink(&self, name: &str) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Renames a file or a whole directory.
    fn rename(&self, from: &str, to: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Recursively removes a child directory. Returns whether it existed.
    fn remove_dir(&self, name: &str) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Creates this directory and any missing ancestors.
    fn mkdir(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

// Real implementation

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P>(root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        OsDir { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StoreDir for OsDir {
    fn cd(&self, name: &str) -> Self {
        OsDir {
            root: self.join(name),
        }
    }

    async fn ls(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", self.root.display()));
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, name: &str) -> anyhow::Result<Option<Stat>> {
        let path = self.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(Stat {
                len: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
        }
    }

    async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn read_prefix(&self, name: &str, len: usize) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.join(name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
        };
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(buf))
    }

    async fn write(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.join(name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.join(name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {} for append", path.display()))?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn truncate(&self, name: &str, len: u64) -> anyhow::Result<()> {
        let path = self.join(name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {} for truncate", path.display()))?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn create_new(&self, name: &str, data: &[u8]) -> anyhow::Result<bool> {
        let path = self.join(name);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("creating {}", path.display())),
        };
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(true)
    }

    async fn unlink(&self, name: &str) -> anyhow::Result<bool> {
        let path = self.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("unlinking {}", path.display())),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let (from, to) = (self.join(from), self.join(to));
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
    }

    async fn remove_dir(&self, name: &str) -> anyhow::Result<bool> {
        let path = self.join(name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    async fn mkdir(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))
    }
}

// Mock Implementation

#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Arc<Mutex<MockFs>>,
    prefix: Vec<String>,
}

impl MockDir {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        MockDir {
            fs: Arc::new(Mutex::new(MockFs::new())),
            prefix: Vec::new(),
        }
    }

    pub fn fs(&self) -> MutexGuard<'_, MockFs> {
        self.fs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn full_path(&self, name: &str) -> String {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(name.split('/').filter(|s| !s.is_empty()))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl StoreDir for MockDir {
    fn cd(&self, name: &str) -> Self {
        MockDir {
            fs: self.fs.clone(),
            prefix: self
                .prefix
                .iter()
                .cloned()
                .chain(
                    name.split('/')
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned),
                )
                .collect(),
        }
    }

    async fn ls(&self) -> anyhow::Result<Vec<String>> {
        let path = self.full_path("");
        Ok(self.fs().ls(&path))
    }

    async fn stat(&self, name: &str) -> anyhow::Result<Option<Stat>> {
        let path = self.full_path(name);
        Ok(self.fs().stat(&path))
    }

    async fn read(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.full_path(name);
        Ok(self.fs().read(&path))
    }

    async fn read_prefix(&self, name: &str, len: usize) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.full_path(name);
        Ok(self.fs().read(&path).map(|mut data| {
            data.truncate(len);
            data
        }))
    }

    async fn write(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.full_path(name);
        self.fs().write(&path, data)
    }

    async fn append(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.full_path(name);
        self.fs().append(&path, data)
    }

    async fn truncate(&self, name: &str, len: u64) -> anyhow::Result<()> {
        let path = self.full_path(name);
        self.fs().truncate(&path, len as usize)
    }

    async fn create_new(&self, name: &str, data: &[u8]) -> anyhow::Result<bool> {
        let path = self.full_path(name);
        self.fs().create_new(&path, data)
    }

    async fn unlink(&self, name: &str) -> anyhow::Result<bool> {
        let path = self.full_path(name);
        self.fs().unlink(&path)
    }

    async fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let (from, to) = (self.full_path(from), self.full_path(to));
        self.fs().rename(&from, &to)
    }

    async fn remove_dir(&self, name: &str) -> anyhow::Result<bool> {
        let path = self.full_path(name);
        self.fs().remove_dir(&path)
    }

    async fn mkdir(&self) -> anyhow::Result<()> {
        let path = self.full_path("");
        self.fs().mkdir(&path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Create(String),
    Write(String, usize),
    Append(String, usize),
    Truncate(String, usize),
    Rename(String, String),
    Unlink(String),
    RemoveDir(String),
    Mkdir(String),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name) => write!(w, "Create({})", name),
            Event::Write(name, len) => write!(w, "Write({}, {})", name, len),
            Event::Append(name, len) => write!(w, "Append({}, {})", name, len),
            Event::Truncate(name, len) => write!(w, "Truncate({}, {})", name, len),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::RemoveDir(name) => write!(w, "RemoveDir({})", name),
            Event::Mkdir(name) => write!(w, "Mkdir({})", name),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    events: Vec<Event>,

    // After this many mutations, "crash" the FS, meaning stop accepting
    // mutations until `reboot`.
    time_to_crash: Option<usize>,

    // Renames out of these paths, and exclusive creates of them, fail the
    // given number of times.
    failing_renames: HashMap<String, usize>,
    failing_creates: HashMap<String, usize>,

    // Writes and appends to these paths fail; a failed append is torn and
    // lands the first half of its data.
    failing_writes: HashMap<String, usize>,
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}

fn is_under(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || (path.len() > dir.len()
            && path.starts_with(dir)
            && path.as_bytes()[dir.len()] == b'/')
}

impl MockFs {
    fn new() -> Self {
        MockFs {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            events: Vec::new(),
            time_to_crash: None,
            failing_renames: HashMap::new(),
            failing_creates: HashMap::new(),
            failing_writes: HashMap::new(),
        }
    }

    pub fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }

    pub fn reboot(&mut self) {
        self.time_to_crash = None;
    }

    /// Makes the next `times` renames whose source is `from` fail.
    pub fn fail_renames_from(&mut self, from: &str, times: usize) {
        self.failing_renames.insert(from.to_owned(), times);
    }

    /// Makes the next `times` exclusive creates of `path` fail.
    pub fn fail_creates_of(&mut self, path: &str, times: usize) {
        self.failing_creates.insert(path.to_owned(), times);
    }

    /// Makes the next `times` writes or appends to `path` fail.
    pub fn fail_writes_to(&mut self, path: &str, times: usize) {
        self.failing_writes.insert(path.to_owned(), times);
    }

    pub fn iter_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Total bytes held in files at or below `dir`.
    pub fn usage(&self, dir: &str) -> usize {
        self.files
            .iter()
            .filter(|(name, _)| is_under(name, dir))
            .map(|(_, data)| data.len())
            .sum()
    }

    fn perform_op(&mut self) -> anyhow::Result<()> {
        match self.time_to_crash {
            Some(0) => bail!("filesystem is down"),
            Some(x) => self.time_to_crash = Some(x - 1),
            None => {}
        }
        Ok(())
    }

    fn injected_failure(failures: &mut HashMap<String, usize>, path: &str) -> bool {
        match failures.get_mut(path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    fn dir_exists(&self, dir: &str) -> bool {
        dir.is_empty()
            || self.dirs.contains(dir)
            || self.files.keys().any(|f| is_under(f, dir))
            || self.dirs.iter().any(|d| is_under(d, dir))
    }

    fn check_parent(&self, path: &str) -> anyhow::Result<()> {
        match parent_of(path) {
            Some(parent) if !self.dir_exists(parent) => bail!("no such directory: {}", parent),
            _ => Ok(()),
        }
    }

    fn ls(&self, dir: &str) -> Vec<String> {
        let skip = if dir.is_empty() { 0 } else { dir.len() + 1 };
        self.files
            .keys()
            .chain(self.dirs.iter())
            .filter(|p| is_under(p, dir))
            .filter_map(|p| p[skip..].split('/').next())
            .map(str::to_owned)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        if let Some(data) = self.files.get(path) {
            Some(Stat {
                len: data.len() as u64,
                is_dir: false,
            })
        } else if !path.is_empty() && self.dir_exists(path) {
            Some(Stat {
                len: 0,
                is_dir: true,
            })
        } else {
            None
        }
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn write(&mut self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.perform_op()?;
        self.check_parent(path)?;
        if Self::injected_failure(&mut self.failing_writes, path) {
            bail!("write {}: no space left on device", path);
        }
        self.record(Event::Write(path.to_owned(), data.len()));
        self.files.insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn append(&mut self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.perform_op()?;
        self.check_parent(path)?;
        let torn = Self::injected_failure(&mut self.failing_writes, path);
        let landed = if torn { &data[..data.len() / 2] } else { data };
        self.record(Event::Append(path.to_owned(), landed.len()));
        self.files
            .entry(path.to_owned())
            .or_default()
            .extend_from_slice(landed);
        if torn {
            bail!("append {}: no space left on device", path);
        }
        Ok(())
    }

    fn truncate(&mut self, path: &str, len: usize) -> anyhow::Result<()> {
        self.perform_op()?;
        match self.files.get_mut(path) {
            Some(data) => data.resize(len, 0),
            None => bail!("no such file: {}", path),
        }
        self.record(Event::Truncate(path.to_owned(), len));
        Ok(())
    }

    fn create_new(&mut self, path: &str, data: &[u8]) -> anyhow::Result<bool> {
        self.perform_op()?;
        if Self::injected_failure(&mut self.failing_creates, path) {
            bail!("create {}: permission denied", path);
        }
        self.check_parent(path)?;
        if self.files.contains_key(path) || self.dirs.contains(path) {
            return Ok(false);
        }
        self.record(Event::Create(path.to_owned()));
        self.files.insert(path.to_owned(), data.to_vec());
        Ok(true)
    }

    fn unlink(&mut self, path: &str) -> anyhow::Result<bool> {
        self.perform_op()?;
        self.record(Event::Unlink(path.to_owned()));
        Ok(self.files.remove(path).is_some())
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        self.perform_op()?;
        if Self::injected_failure(&mut self.failing_renames, from) {
            bail!("rename {} to {}: resource busy", from, to);
        }
        self.check_parent(to)?;

        if let Some(data) = self.files.remove(from) {
            self.record(Event::Rename(from.to_owned(), to.to_owned()));
            self.files.insert(to.to_owned(), data);
            return Ok(());
        }

        if !self.dir_exists(from) {
            bail!("no such file or directory: {}", from);
        }
        if self.files.contains_key(to) || !self.ls(to).is_empty() {
            bail!("rename target {} is not empty", to);
        }
        self.record(Event::Rename(from.to_owned(), to.to_owned()));

        let moved_files: Vec<String> = self
            .files
            .keys()
            .filter(|f| is_under(f, from))
            .cloned()
            .collect();
        for old in moved_files {
            if let Some(data) = self.files.remove(&old) {
                self.files.insert(format!("{}{}", to, &old[from.len()..]), data);
            }
        }
        let moved_dirs: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| d.as_str() == from || is_under(d, from))
            .cloned()
            .collect();
        for old in moved_dirs {
            self.dirs.remove(&old);
            self.dirs.insert(format!("{}{}", to, &old[from.len()..]));
        }
        self.dirs.insert(to.to_owned());
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> anyhow::Result<bool> {
        self.perform_op()?;
        let existed = self.dir_exists(path);
        self.record(Event::RemoveDir(path.to_owned()));
        self.files.retain(|f, _| !is_under(f, path));
        self.dirs.retain(|d| d != path && !is_under(d, path));
        Ok(existed)
    }

    fn mkdir(&mut self, path: &str) -> anyhow::Result<()> {
        self.perform_op()?;
        if path.is_empty() || self.dir_exists(path) {
            return Ok(());
        }
        self.record(Event::Mkdir(path.to_owned()));
        let mut current = String::new();
        for component in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);
            self.dirs.insert(current.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_dir() -> anyhow::Result<()> {
        let root = MockDir::new();
        let dir = root.cd("store");

        assert!(dir.write("a", &[1, 2, 3]).await.is_err());
        dir.mkdir().await?;
        dir.write("a", &[1, 2, 3]).await?;
        dir.append("a", &[4]).await?;
        assert_eq!(Some(vec![1, 2, 3, 4]), dir.read("a").await?);
        assert_eq!(Some(vec![1, 2]), dir.read_prefix("a", 2).await?);

        assert!(!dir.create_new("a", b"x").await?);
        assert!(dir.create_new("b", b"x").await?);
        assert_eq!(vec!["a".to_owned(), "b".to_owned()], dir.ls().await?);
        assert_eq!(vec!["store".to_owned()], root.ls().await?);
        assert_eq!(
            Some(Stat {
                len: 0,
                is_dir: true
            }),
            root.stat("store").await?
        );

        root.rename("store", "moved").await?;
        assert_eq!(None, dir.read("a").await?);
        assert_eq!(Some(vec![1, 2, 3, 4]), root.cd("moved").read("a").await?);

        assert!(root.remove_dir("moved").await?);
        assert!(root.ls().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mock_crash_and_failures() -> anyhow::Result<()> {
        let dir = MockDir::new();
        dir.write("a", b"1").await?;

        dir.fs().schedule_crash(1);
        dir.write("b", b"2").await?;
        assert!(dir.write("c", b"3").await.is_err());
        dir.fs().reboot();
        dir.write("c", b"3").await?;

        dir.fs().fail_creates_of("n", 1);
        assert!(dir.create_new("n", b"").await.is_err());
        assert!(dir.create_new("n", b"").await?);

        dir.fs().fail_renames_from("a", 1);
        assert!(dir.rename("a", "z").await.is_err());
        dir.rename("a", "z").await?;
        assert_eq!(Some(b"1".to_vec()), dir.read("z").await?);

        dir.fs().fail_writes_to("z", 2);
        assert!(dir.append("z", b"2345").await.is_err());
        assert_eq!(Some(b"123".to_vec()), dir.read("z").await?);
        assert!(dir.write("z", b"x").await.is_err());
        dir.write("z", b"x").await?;
        assert_eq!(Some(b"x".to_vec()), dir.read("z").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_os_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = OsDir::new(tmp.path());
        let dir = root.cd("store");

        assert!(dir.ls().await?.is_empty());
        dir.mkdir().await?;
        dir.write("a", b"hello").await?;
        dir.append("a", b" world").await?;
        assert_eq!(Some(b"hello world".to_vec()), dir.read("a").await?);
        assert_eq!(Some(b"hello".to_vec()), dir.read_prefix("a", 5).await?);
        dir.truncate("a", 4).await?;
        assert_eq!(Some(4), dir.stat("a").await?.map(|s| s.len));

        assert!(!dir.create_new("a", b"x").await?);
        assert!(dir.unlink("a").await?);
        assert!(!dir.unlink("a").await?);

        root.rename("store", "moved").await?;
        assert!(root.remove_dir("moved").await?);
        assert!(!root.remove_dir("moved").await?);
        Ok(())
    }
}
