//! Destination pipeline
//!
//! A [`Sink`] turns relative names such as `db/t1.ibd` into destination
//! files. Sinks compose by wrapping: `Lz4Sink` over `TarSink` yields one tar
//! stream of LZ4 frames.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lz4_flex::frame::FrameEncoder;
use parking_lot::Mutex;
use tar::{Builder, Header};

use super::errors::{CopyError, CopyResult};

/// Suffix added by [`Lz4Sink`]
pub const LZ4_SUFFIX: &str = ".lz4";

/// One destination file being written
pub trait SinkFile: Send {
    fn write_all(&mut self, data: &[u8]) -> CopyResult<()>;

    /// Completes the file; it is durable (or handed on) once this returns
    fn finish(self: Box<Self>) -> CopyResult<()>;
}

pub trait Sink: Send + Sync {
    fn create(&self, name: &str) -> CopyResult<Box<dyn SinkFile>>;

    /// Writes a small file in one call
    fn write_file(&self, name: &str, data: &[u8]) -> CopyResult<()> {
        let mut file = self.create(name)?;
        file.write_all(data)?;
        file.finish()
    }

    /// Streams an existing local file into the sink
    fn import_file(&self, name: &str, path: &Path) -> CopyResult<()> {
        let mut source =
            File::open(path).map_err(|e| CopyError::source_read(path, e))?;
        let mut dest = self.create(name)?;
        let mut buf = vec![0u8; 1 << 16];
        loop {
            let n = source
                .read(&mut buf)
                .map_err(|e| CopyError::source_read(path, e))?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
        }
        dest.finish()
    }

    /// Flushes whatever the sink buffers across files
    fn finish(&self) -> CopyResult<()> {
        Ok(())
    }

    /// Whether files land directly under this local directory
    fn is_directory_at(&self, _dir: &Path) -> bool {
        false
    }
}

/// Plain files below a root directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

struct DirectoryFile {
    name: String,
    writer: BufWriter<File>,
}

impl SinkFile for DirectoryFile {
    fn write_all(&mut self, data: &[u8]) -> CopyResult<()> {
        self.writer
            .write_all(data)
            .map_err(|e| CopyError::destination(&self.name, e))
    }

    fn finish(self: Box<Self>) -> CopyResult<()> {
        let name = self.name;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| CopyError::destination(&name, e.into_error()))?;
        file.sync_all().map_err(|e| CopyError::destination(&name, e))
    }
}

impl Sink for DirectorySink {
    fn create(&self, name: &str) -> CopyResult<Box<dyn SinkFile>> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CopyError::destination(name, e))?;
        }
        let file = File::create(&path).map_err(|e| CopyError::destination(name, e))?;
        Ok(Box::new(DirectoryFile {
            name: name.to_string(),
            writer: BufWriter::new(file),
        }))
    }

    fn is_directory_at(&self, dir: &Path) -> bool {
        self.root == dir
    }
}

/// A single tar archive.
///
/// Entries need their size up front, so each file is spooled to a local
/// temporary file and appended to the archive when it finishes.
pub struct TarSink {
    path: PathBuf,
    spool_dir: PathBuf,
    builder: Arc<Mutex<Option<Builder<BufWriter<File>>>>>,
}

impl TarSink {
    pub fn create(path: &Path, spool_dir: &Path) -> CopyResult<Self> {
        let display = path.display().to_string();
        fs::create_dir_all(spool_dir).map_err(|e| CopyError::destination(&display, e))?;
        let file = File::create(path).map_err(|e| CopyError::destination(&display, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            spool_dir: spool_dir.to_path_buf(),
            builder: Arc::new(Mutex::new(Some(Builder::new(BufWriter::new(file))))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct TarEntry {
    name: String,
    spool_path: PathBuf,
    spool: BufWriter<File>,
    builder: Arc<Mutex<Option<Builder<BufWriter<File>>>>>,
}

impl SinkFile for TarEntry {
    fn write_all(&mut self, data: &[u8]) -> CopyResult<()> {
        self.spool
            .write_all(data)
            .map_err(|e| CopyError::destination(&self.name, e))
    }

    fn finish(self: Box<Self>) -> CopyResult<()> {
        let TarEntry {
            name,
            spool_path,
            spool,
            builder,
        } = *self;
        spool
            .into_inner()
            .map_err(|e| CopyError::destination(&name, e.into_error()))?;

        let mut guard = builder.lock();
        let builder = guard
            .as_mut()
            .ok_or_else(|| CopyError::aborted(format!("archive already closed for '{}'", name)))?;

        let mut spooled = File::open(&spool_path).map_err(|e| CopyError::destination(&name, e))?;
        let len = spooled
            .metadata()
            .map_err(|e| CopyError::destination(&name, e))?
            .len();
        let mut header = Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o640);
        header.set_cksum();
        builder
            .append_data(&mut header, &name, &mut spooled)
            .map_err(|e| CopyError::destination(&name, e))?;
        drop(guard);

        fs::remove_file(&spool_path).map_err(|e| CopyError::destination(&name, e))
    }
}

impl Sink for TarSink {
    fn create(&self, name: &str) -> CopyResult<Box<dyn SinkFile>> {
        let spool_path = self
            .spool_dir
            .join(format!("{}.spool", uuid::Uuid::new_v4()));
        let spool = File::create(&spool_path).map_err(|e| CopyError::destination(name, e))?;
        Ok(Box::new(TarEntry {
            name: name.to_string(),
            spool_path,
            spool: BufWriter::new(spool),
            builder: Arc::clone(&self.builder),
        }))
    }

    fn finish(&self) -> CopyResult<()> {
        let display = self.path.display().to_string();
        let Some(builder) = self.builder.lock().take() else {
            return Ok(());
        };
        let writer = builder
            .into_inner()
            .map_err(|e| CopyError::destination(&display, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| CopyError::destination(&display, e.into_error()))?;
        file.sync_all()
            .map_err(|e| CopyError::destination(&display, e))?;
        let _ = fs::remove_dir(&self.spool_dir);
        Ok(())
    }
}

/// Adapts a [`SinkFile`] to `io::Write` for the LZ4 encoder
struct SinkWriter {
    name: String,
    inner: Box<dyn SinkFile>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .write_all(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compresses every file into an LZ4 frame and appends `.lz4` to its name
pub struct Lz4Sink {
    inner: Arc<dyn Sink>,
}

impl Lz4Sink {
    pub fn new(inner: Arc<dyn Sink>) -> Self {
        Self { inner }
    }
}

struct Lz4File {
    name: String,
    encoder: FrameEncoder<SinkWriter>,
}

impl SinkFile for Lz4File {
    fn write_all(&mut self, data: &[u8]) -> CopyResult<()> {
        self.encoder
            .write_all(data)
            .map_err(|e| CopyError::destination(&self.name, e))
    }

    fn finish(self: Box<Self>) -> CopyResult<()> {
        let name = self.name;
        let writer = self.encoder.finish().map_err(|e| {
            CopyError::destination(&name, io::Error::new(io::ErrorKind::Other, e.to_string()))
        })?;
        debug_assert_eq!(writer.name, format!("{}{}", name, LZ4_SUFFIX));
        writer.inner.finish()
    }
}

impl Sink for Lz4Sink {
    fn create(&self, name: &str) -> CopyResult<Box<dyn SinkFile>> {
        let compressed_name = format!("{}{}", name, LZ4_SUFFIX);
        let inner = self.inner.create(&compressed_name)?;
        Ok(Box::new(Lz4File {
            name: name.to_string(),
            encoder: FrameEncoder::new(SinkWriter {
                name: compressed_name,
                inner,
            }),
        }))
    }

    fn finish(&self) -> CopyResult<()> {
        self.inner.finish()
    }
}

/// Keeps every file in memory; used to inspect what a run produced
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }
}

struct MemoryFile {
    name: String,
    data: Vec<u8>,
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl SinkFile for MemoryFile {
    fn write_all(&mut self, data: &[u8]) -> CopyResult<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> CopyResult<()> {
        let MemoryFile { name, data, files } = *self;
        files.lock().insert(name, data);
        Ok(())
    }
}

impl Sink for MemorySink {
    fn create(&self, name: &str) -> CopyResult<Box<dyn SinkFile>> {
        Ok(Box::new(MemoryFile {
            name: name.to_string(),
            data: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lz4_flex::frame::FrameDecoder;
    use tar::Archive;
    use tempfile::TempDir;

    #[test]
    fn test_directory_sink_creates_parents() {
        let dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(dir.path());
        sink.write_file("db/t1.del", b"").unwrap();
        sink.write_file("db/t1.ren", b"db/t1b").unwrap();
        assert!(dir.path().join("db/t1.del").exists());
        assert_eq!(fs::read(dir.path().join("db/t1.ren")).unwrap(), b"db/t1b");
        assert!(sink.is_directory_at(dir.path()));
    }

    #[test]
    fn test_tar_sink_produces_readable_archive() {
        let dir = TempDir::new().unwrap();
        let tar_path = dir.path().join("backup.tar");
        let sink = TarSink::create(&tar_path, &dir.path().join("spool")).unwrap();

        let mut file = sink.create("db/t1.ibd").unwrap();
        file.write_all(&[1u8; 1000]).unwrap();
        file.write_all(&[2u8; 24]).unwrap();
        file.finish().unwrap();
        sink.write_file("db/t2.del", b"").unwrap();
        sink.finish().unwrap();
        assert!(!dir.path().join("spool").exists());

        let mut archive = Archive::new(File::open(&tar_path).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            seen.push((name, body.len()));
        }
        assert_eq!(
            seen,
            vec![("db/t1.ibd".to_string(), 1024), ("db/t2.del".to_string(), 0)]
        );
    }

    #[test]
    fn test_lz4_sink_wraps_inner_sink() {
        let memory = Arc::new(MemorySink::new());
        let sink = Lz4Sink::new(memory.clone());
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8).collect();
        sink.write_file("db/t1.ibd", &payload).unwrap();

        assert_eq!(memory.names(), vec!["db/t1.ibd.lz4".to_string()]);
        let compressed = memory.file("db/t1.ibd.lz4").unwrap();
        assert!(compressed.len() < payload.len());

        let mut decoded = Vec::new();
        FrameDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_import_file_streams_local_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("aero_logfile0");
        fs::write(&local, vec![9u8; 70_000]).unwrap();

        let memory = MemorySink::new();
        memory.import_file("aero_logfile0", &local).unwrap();
        assert_eq!(memory.file("aero_logfile0").unwrap().len(), 70_000);
    }
}
