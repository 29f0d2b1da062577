//! File surface used by the sharing protocols.
//!
//! Reads pick their data source under the transition lock: a shared (or
//! transitioning) outer is served from its inner object. Every operation
//! that changes data or attributes of an outer first makes it private,
//! running revocation if it is shared.

use std::sync::Arc;

use tokio::sync::RwLockReadGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DedupError, DedupResult};
use crate::inode::{FileFlags, Inode, InodeGuard, ShareState};
use crate::lifecycle::LastLink;
use crate::types::{pages_for, InodeId, PAGE_SIZE};
use crate::volume::Volume;

// attempts to find an outer independent before giving up with Busy
const PRIVATE_RETRIES: usize = 3;

impl Volume {
    /// Reads up to `len` bytes at `offset`, clamped to the file size.
    pub async fn read(&self, ino: InodeId, offset: u64, len: usize) -> DedupResult<Vec<u8>> {
        let inode = self.user_inode(ino)?;
        let size = inode.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(len as u64));
        let guard = self.enter_source(&inode, false).await?;
        let source = guard.inode();

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let take = ((PAGE_SIZE - in_page) as u64).min(end - pos) as usize;
            let page = self.load_page(source, index)?;
            out.extend_from_slice(&page.lock().data[in_page..in_page + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`, growing the file as needed. A shared outer
    /// is unshared first.
    pub async fn write(&self, ino: InodeId, offset: u64, data: &[u8]) -> DedupResult<usize> {
        let inode = self.user_inode(ino)?;
        if inode.flags().data_frozen {
            return Err(DedupError::Frozen { ino });
        }
        let len = data.len() as u64;
        if offset.checked_add(len).is_none() {
            return Err(DedupError::OutOfRange { ino, offset, len });
        }
        let _private = self.lock_private(&inode).await?;

        let mut pos = offset;
        let mut src = data;
        while !src.is_empty() {
            let index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - in_page).min(src.len());
            loop {
                let page = self.load_page(&inode, index)?;
                let mut state = page.lock();
                if state.evicted {
                    continue;
                }
                state.data[in_page..in_page + take].copy_from_slice(&src[..take]);
                state.dirty = true;
                break;
            }
            pos += take as u64;
            src = &src[take..];
        }
        inode.extend_size(pos);
        inode.bump_data_version();
        debug!(%ino, offset, len = data.len(), "Write");
        Ok(data.len())
    }

    /// Sets the file size. Shrinking zeroes the tail of the last page and
    /// releases every block past it.
    pub async fn truncate(&self, ino: InodeId, size: u64) -> DedupResult<()> {
        let inode = self.user_inode(ino)?;
        if inode.flags().data_frozen {
            return Err(DedupError::Frozen { ino });
        }
        let _private = self.lock_private(&inode).await?;
        if size < inode.size() {
            let tail = (size % PAGE_SIZE as u64) as usize;
            if tail != 0 {
                let page = self.load_page(&inode, size / PAGE_SIZE as u64)?;
                let mut state = page.lock();
                state.data[tail..].fill(0);
                state.dirty = true;
            }
            let first = pages_for(size);
            inode.cache.evict_from(first);
            let freed = {
                let _txn = self.begin_txn();
                inode.map.lock().truncate(first)
            };
            for addr in &freed {
                self.store().invalidate(*addr);
            }
        }
        inode.set_size(size);
        inode.bump_data_version();
        debug!(%ino, size, "Truncated");
        Ok(())
    }

    /// Sets or clears the content-frozen attribute. An inner object can
    /// never be thawed.
    pub fn set_frozen(&self, ino: InodeId, frozen: bool) -> DedupResult<()> {
        self.ensure_writable()?;
        let inode = self.inode(ino)?;
        // designation re-checks the flag under the same lock
        let _txn = self.begin_txn();
        if inode.is_inner() && !frozen {
            return Err(DedupError::InnerObject { ino });
        }
        inode.update_flags(|f| f.data_frozen = frozen);
        Ok(())
    }

    /// Sets or clears the metadata-frozen attribute. While set, the
    /// attribute changes below are refused.
    pub fn set_meta_frozen(&self, ino: InodeId, frozen: bool) -> DedupResult<()> {
        self.ensure_writable()?;
        let inode = self.user_inode(ino)?;
        inode.update_flags(|f| f.meta_frozen = frozen);
        Ok(())
    }

    /// Pins the file's blocks in place. Unshares first.
    pub async fn set_pinned(&self, ino: InodeId, pinned: bool) -> DedupResult<()> {
        self.update_private_flags(ino, |f| f.pinned = pinned).await
    }

    /// Enables or disables compression. Unshares first.
    pub async fn set_compressed(&self, ino: InodeId, compressed: bool) -> DedupResult<()> {
        self.update_private_flags(ino, |f| f.compressed = compressed).await
    }

    /// Opens an atomic-write session. Unshares first; the file cannot be
    /// shared until [`Volume::end_atomic_write`].
    pub async fn begin_atomic_write(&self, ino: InodeId) -> DedupResult<()> {
        self.update_private_flags(ino, |f| f.atomic_write = true).await
    }

    /// Closes an atomic-write session.
    pub fn end_atomic_write(&self, ino: InodeId) -> DedupResult<()> {
        let inode = self.user_inode(ino)?;
        inode.update_flags(|f| f.atomic_write = false);
        Ok(())
    }

    /// Copies `len` bytes from `src` into `dst`. The destination is unshared
    /// first; the source may stay shared.
    pub async fn clone_range(
        &self,
        src: InodeId,
        src_offset: u64,
        dst: InodeId,
        dst_offset: u64,
        len: usize,
    ) -> DedupResult<usize> {
        let data = self.read(src, src_offset, len).await?;
        self.write(dst, dst_offset, &data).await
    }

    /// Registers an in-flight direct I/O against the data source of `ino`.
    /// Transitions wait for the returned guard to drop.
    pub async fn begin_direct_io(&self, ino: InodeId) -> DedupResult<InodeGuard> {
        let inode = self.user_inode(ino)?;
        self.enter_source(&inode, true).await
    }

    /// Number of private physical blocks of `ino`.
    pub fn physical_blocks(&self, ino: InodeId) -> DedupResult<u64> {
        Ok(self.inode(ino)?.physical_blocks())
    }

    /// Logical size of `ino`.
    pub fn file_size(&self, ino: InodeId) -> DedupResult<u64> {
        Ok(self.inode(ino)?.size())
    }

    /// Deletes a user file. A shared outer only drops its link; no content
    /// is copied.
    pub async fn remove_file(&self, ino: InodeId) -> DedupResult<()> {
        self.ensure_writable()?;
        let inode = self.user_inode(ino)?;
        let mut state = inode.share.try_write().map_err(|_| DedupError::Busy { ino })?;
        if state.in_transition() {
            return Err(DedupError::Busy { ino });
        }
        let detached = if state.is_independent() {
            None
        } else {
            Some(self.detach(&inode, &mut state, LastLink::Delete)?)
        };
        drop(state);
        self.delete_inode(&inode);
        if let Some(detached) = detached {
            self.reap_inner(detached).await;
        }
        info!(%ino, "Removed file");
        Ok(())
    }

    /// Looks up `ino` as a user-visible file; inner objects are hidden.
    fn user_inode(&self, ino: InodeId) -> DedupResult<Arc<Inode>> {
        let inode = self.inode(ino)?;
        if inode.is_inner() {
            return Err(DedupError::InnerObject { ino });
        }
        Ok(inode)
    }

    /// Picks the inode that currently holds the data of `inode` and
    /// registers with its reader gate while the transition lock is held.
    async fn enter_source(&self, inode: &Arc<Inode>, direct: bool) -> DedupResult<InodeGuard> {
        let state = inode.share.read().await;
        let source = match state.inner() {
            None => inode.clone(),
            Some(link) => link.upgrade().ok_or(DedupError::MissingInner {
                outer: inode.id(),
                inner: link.id(),
            })?,
        };
        Ok(if direct {
            InodeGuard::direct_io(source)
        } else {
            InodeGuard::reader(source)
        })
    }

    /// Returns the outer's transition lock held shared with the file
    /// independent, unsharing it first if needed. Mutations run under the
    /// returned guard so no transition can start underneath them.
    pub(crate) async fn lock_private<'a>(
        &self,
        inode: &'a Arc<Inode>,
    ) -> DedupResult<RwLockReadGuard<'a, ShareState>> {
        for _ in 0..PRIVATE_RETRIES {
            self.ensure_writable()?;
            let state = inode.share.read().await;
            if state.is_independent() {
                return Ok(state);
            }
            if state.in_transition() {
                return Err(DedupError::Busy { ino: inode.id() });
            }
            drop(state);
            debug!(ino = %inode.id(), "Implicit unshare before mutation");
            self.revoke(inode, &CancellationToken::new()).await?;
        }
        Err(DedupError::Busy { ino: inode.id() })
    }

    async fn update_private_flags(
        &self,
        ino: InodeId,
        f: impl FnOnce(&mut FileFlags),
    ) -> DedupResult<()> {
        let inode = self.user_inode(ino)?;
        if inode.flags().meta_frozen {
            return Err(DedupError::Frozen { ino });
        }
        let _private = self.lock_private(&inode).await?;
        inode.update_flags(f);
        Ok(())
    }
}
