use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::LruMap;
use crate::error::StoreError;
use crate::pool::{Record, RecordStore};

/// Target page budget; the actual page size is the largest multiple of the
/// record size that fits it.
const PAGE_BUDGET: usize = 4096;

const FORMAT_VERSION: u32 = 1;

/// Callback invoked with the page index whenever a dirty page is written back
/// on eviction.
pub(crate) type EvictionHook = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct PoolMetadata {
    version: u32,
    next_index: u64,
}

struct Page {
    bytes: Box<[u8]>,
    dirty: bool,
}

/// Paged-file record store: fixed-width records packed into fixed-size pages,
/// an LRU page cache with dirty write-back, and sidecar files for the free
/// list and the allocation frontier.
///
/// The frontier is only persisted on `flush`; allocations made after the last
/// flush are discarded by crash recovery.
pub(crate) struct PagedStore<R: Record> {
    dir: PathBuf,
    data: File,
    pages: LruMap<u64, Page>,
    next_index: u64,
    free: VecDeque<u64>,
    records_per_page: u64,
    page_size: usize,
    on_evict: Option<EvictionHook>,
    _record: PhantomData<R>,
}

impl<R: Record> PagedStore<R> {
    pub fn open(dir: &Path, cache_pages: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("data"))?;

        let next_index = match fs::File::open(dir.join("metadata")) {
            Ok(mut file) => {
                let mut raw = String::new();
                file.read_to_string(&mut raw)?;
                let meta: PoolMetadata = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corruption(format!("bad pool metadata: {e}")))?;
                if meta.version != FORMAT_VERSION {
                    return Err(StoreError::UnsupportedConfiguration(format!(
                        "pool format version {} is not supported",
                        meta.version
                    )));
                }
                meta.next_index
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let free = match fs::read(dir.join("free-list")) {
            Ok(raw) => {
                if raw.len() % 8 != 0 {
                    return Err(StoreError::Corruption("truncated free-list file".into()));
                }
                raw.chunks_exact(8)
                    .map(|chunk| {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(chunk);
                        u64::from_le_bytes(bytes)
                    })
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => return Err(err.into()),
        };

        let records_per_page = (PAGE_BUDGET / R::SIZE).max(1) as u64;
        debug!(
            dir = %dir.display(),
            next_index,
            free = free.len(),
            "opened paged node store"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            data,
            pages: LruMap::new(cache_pages),
            next_index,
            free,
            records_per_page,
            page_size: records_per_page as usize * R::SIZE,
            on_evict: None,
            _record: PhantomData,
        })
    }

    /// Installs a hook observing dirty-page write-backs.
    #[allow(dead_code)]
    pub fn set_eviction_hook(&mut self, hook: EvictionHook) {
        self.on_evict = Some(hook);
    }

    fn page_of(&self, index: u64) -> (u64, usize) {
        (
            index / self.records_per_page,
            (index % self.records_per_page) as usize * R::SIZE,
        )
    }

    fn load_page(&mut self, page_no: u64) -> Result<(), StoreError> {
        if self.pages.peek(&page_no).is_some() {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.page_size].into_boxed_slice();
        let offset = page_no * self.page_size as u64;
        let file_len = self.data.metadata()?.len();
        if offset < file_len {
            let available = ((file_len - offset) as usize).min(self.page_size);
            self.data.read_exact_at(&mut bytes[..available], offset)?;
        }
        self.pages.insert(page_no, Page { bytes, dirty: false });
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Result<(), StoreError> {
        while self.pages.is_over_capacity() {
            let Some((page_no, page)) = self.pages.pop_lru_if(|_, _| true) else {
                break;
            };
            if page.dirty {
                self.write_page(page_no, &page)?;
                if let Some(hook) = &self.on_evict {
                    hook(page_no);
                }
            }
        }
        Ok(())
    }

    fn write_page(&self, page_no: u64, page: &Page) -> Result<(), StoreError> {
        self.data
            .write_all_at(&page.bytes, page_no * self.page_size as u64)?;
        Ok(())
    }

    fn with_page<T>(
        &mut self,
        index: u64,
        f: impl FnOnce(&mut Page, usize) -> T,
    ) -> Result<T, StoreError> {
        let (page_no, offset) = self.page_of(index);
        self.load_page(page_no)?;
        let page = self
            .pages
            .get_mut(&page_no)
            .ok_or_else(|| StoreError::Corruption(format!("page {page_no} vanished from cache")))?;
        Ok(f(page, offset))
    }
}

impl<R: Record> RecordStore<R> for PagedStore<R> {
    fn create(&mut self, record: R) -> Result<u64, StoreError> {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                index
            }
        };
        self.set(index, &record)?;
        Ok(index)
    }

    fn get(&mut self, index: u64) -> Result<R, StoreError> {
        if index >= self.next_index {
            return Err(StoreError::Corruption(format!(
                "pool index {index} beyond allocation frontier {}",
                self.next_index
            )));
        }
        self.with_page(index, |page, offset| {
            R::read_record(&page.bytes[offset..offset + R::SIZE])
        })?
    }

    fn set(&mut self, index: u64, record: &R) -> Result<(), StoreError> {
        self.with_page(index, |page, offset| {
            record.write_record(&mut page.bytes[offset..offset + R::SIZE]);
            page.dirty = true;
        })
    }

    fn delete(&mut self, index: u64) -> Result<(), StoreError> {
        if index >= self.next_index {
            return Err(StoreError::Corruption(format!(
                "released pool index {index} beyond allocation frontier {}",
                self.next_index
            )));
        }
        self.free.push_back(index);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        // Dirty pages go out in ascending order to keep writes sequential.
        let mut dirty_pages = Vec::new();
        self.pages.for_each(|page_no, page| {
            if page.dirty {
                dirty_pages.push(*page_no);
            }
        });
        dirty_pages.sort_unstable();
        for page_no in dirty_pages {
            let page = self.pages.get_mut(&page_no).map(|page| {
                page.dirty = false;
                page.bytes.clone()
            });
            if let Some(bytes) = page {
                self.data
                    .write_all_at(&bytes, page_no * self.page_size as u64)?;
            }
        }
        self.data.sync_data()?;

        let mut free_bytes = Vec::with_capacity(self.free.len() * 8);
        for index in &self.free {
            free_bytes.extend_from_slice(&index.to_le_bytes());
        }
        fs::write(self.dir.join("free-list"), free_bytes)?;

        let meta = PoolMetadata {
            version: FORMAT_VERSION,
            next_index: self.next_index,
        };
        let mut file = File::create(self.dir.join("metadata"))?;
        file.write_all(
            serde_json::to_string(&meta)
                .map_err(|e| StoreError::Corruption(format!("metadata encoding failed: {e}")))?
                .as_bytes(),
        )?;
        file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.flush()
    }

    fn memory_footprint(&self) -> usize {
        self.pages.len() * self.page_size + self.free.len() * 8
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::ValueNode;
    use crate::types::Hash;

    fn value(byte: u8) -> ValueNode {
        ValueNode::new(Hash::repeat_byte(byte), Hash::repeat_byte(byte), 7)
    }

    #[test]
    fn records_survive_reopening() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut indices = Vec::new();
        {
            let mut store: PagedStore<ValueNode> =
                PagedStore::open(dir.path(), 4).expect("open");
            for byte in 1..=100u8 {
                indices.push(store.create(value(byte)).expect("create"));
            }
            store.flush().expect("flush");
        }
        let mut store: PagedStore<ValueNode> = PagedStore::open(dir.path(), 4).expect("reopen");
        for (i, index) in indices.iter().enumerate() {
            let record = store.get(*index).expect("get");
            assert_eq!(record, value(i as u8 + 1));
        }
    }

    #[test]
    fn unflushed_allocations_are_discarded_on_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let committed;
        {
            let mut store: PagedStore<ValueNode> =
                PagedStore::open(dir.path(), 4).expect("open");
            committed = store.create(value(1)).expect("create");
            store.flush().expect("flush");
            store.create(value(2)).expect("create");
            // No flush: the second allocation must not survive.
        }
        let mut store: PagedStore<ValueNode> = PagedStore::open(dir.path(), 4).expect("reopen");
        assert!(store.get(committed).is_ok());
        assert!(store.get(committed + 1).is_err());
        // The discarded index is handed out again.
        assert_eq!(store.create(value(3)).expect("create"), committed + 1);
    }

    #[test]
    fn freed_indices_are_reused_across_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store: PagedStore<ValueNode> = PagedStore::open(dir.path(), 4).expect("open");
        let a = store.create(value(1)).expect("create");
        let _b = store.create(value(2)).expect("create");
        store.delete(a).expect("delete");
        store.flush().expect("flush");
        drop(store);
        let mut store: PagedStore<ValueNode> = PagedStore::open(dir.path(), 4).expect("reopen");
        assert_eq!(store.create(value(3)).expect("create"), a);
    }

    #[test]
    fn dirty_pages_write_back_on_eviction() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().expect("tempdir");
        let mut store: PagedStore<ValueNode> = PagedStore::open(dir.path(), 1).expect("open");
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        store.set_eviction_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        // A page holds 63 value records; writing 200 spans 4 pages through a
        // single-page cache.
        for byte in 0..200 {
            store.create(value(byte as u8)).expect("create");
        }
        assert!(evictions.load(Ordering::SeqCst) > 0);
        for index in 0..200u64 {
            assert_eq!(store.get(index).expect("get"), value(index as u8));
        }
    }
}
