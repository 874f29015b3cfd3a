use crate::error::{BittorrentError, Result};
use crate::torrent::Torrent;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One contiguous run of a global write that lands inside a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    /// Offset inside that file
    pub file_offset: u64,
    /// Range of the caller's buffer that belongs to this file
    pub data_range: Range<usize>,
}

/// Split `len` bytes at global offset `offset` across the concatenation of
/// files with the given lengths, in declared order.
pub fn map_span(file_lengths: &[u64], offset: u64, len: usize) -> Vec<FileSlice> {
    let mut slices = Vec::new();
    let mut file_start = 0u64;
    let mut cursor = offset;
    let end = offset + len as u64;

    for (file_index, &length) in file_lengths.iter().enumerate() {
        let file_end = file_start + length;
        if cursor >= end {
            break;
        }
        if cursor < file_end {
            let take_until = end.min(file_end);
            let data_start = (cursor - offset) as usize;
            let data_end = (take_until - offset) as usize;
            slices.push(FileSlice {
                file_index,
                file_offset: cursor - file_start,
                data_range: data_start..data_end,
            });
            cursor = take_until;
        }
        file_start = file_end;
    }

    slices
}

struct FileEntry {
    path: PathBuf,
    length: u64,
    /// Writes to one file are serialized through its handle
    handle: Mutex<File>,
}

/// Owns the open file handles for one torrent's data
pub struct StorageManager {
    files: Vec<FileEntry>,
    total_length: u64,
}

impl StorageManager {
    /// Create every file under `download_dir`, sized to its declared length.
    ///
    /// Existing data is left in place so already-downloaded pieces can be
    /// verified and served.
    pub async fn new<P: AsRef<Path>>(download_dir: P, torrent: &Torrent) -> Result<Self> {
        let download_dir = download_dir.as_ref();
        fs::create_dir_all(download_dir).await?;

        let mut files = Vec::with_capacity(torrent.files.len());
        for file_info in &torrent.files {
            let mut path = download_dir.to_path_buf();
            for component in &file_info.path {
                let is_normal = matches!(
                    Path::new(component).components().collect::<Vec<_>>().as_slice(),
                    [Component::Normal(_)]
                );
                if !is_normal {
                    return Err(BittorrentError::StorageError(format!(
                        "Refusing path component {:?}",
                        component
                    )));
                }
                path.push(component);
            }

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            if file.metadata().await?.len() != file_info.length {
                file.set_len(file_info.length).await?;
            }

            debug!("Allocated {:?} ({} bytes)", path, file_info.length);
            files.push(FileEntry {
                path,
                length: file_info.length,
                handle: Mutex::new(file),
            });
        }

        info!(
            "Storage initialized: {} files, {} bytes total",
            files.len(),
            torrent.total_length
        );

        Ok(Self {
            files,
            total_length: torrent.total_length,
        })
    }

    fn file_lengths(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.length).collect()
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.total_length {
            return Err(BittorrentError::StorageError(format!(
                "Span {}+{} exceeds torrent length {}",
                offset, len, self.total_length
            )));
        }
        Ok(())
    }

    /// Write data at a global offset, splitting at file boundaries
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;

        for slice in map_span(&self.file_lengths(), offset, data.len()) {
            let entry = &self.files[slice.file_index];
            let mut file = entry.handle.lock().await;
            file.seek(std::io::SeekFrom::Start(slice.file_offset)).await?;
            file.write_all(&data[slice.data_range.clone()]).await?;
            file.flush().await?;

            debug!(
                "Wrote {} bytes to {:?} at offset {}",
                slice.data_range.len(),
                entry.path,
                slice.file_offset
            );
        }

        Ok(())
    }

    /// Read `len` bytes from a global offset, spanning files as needed
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut buffer = vec![0u8; len];

        for slice in map_span(&self.file_lengths(), offset, len) {
            let mut file = self.files[slice.file_index].handle.lock().await;
            file.seek(std::io::SeekFrom::Start(slice.file_offset)).await?;
            file.read_exact(&mut buffer[slice.data_range]).await?;
        }

        Ok(buffer)
    }
}
