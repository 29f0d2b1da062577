//! Content-equality verifier.
//!
//! Compares a random sample of pages of two files. Each sampled pair is
//! locked in inode-id order and re-checked for residency and ownership
//! before the bytes are compared, so a page evicted or replaced between
//! lookup and lock is never trusted.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DedupResult;
use crate::fault::FaultPoint;
use crate::inode::Inode;
use crate::page::Page;
use crate::types::{pages_for, InodeId};
use crate::volume::Volume;

/// Outcome of a sampled comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Every sampled page matched.
    Same,
    /// A sampled page differed or could not be compared.
    Different,
}

impl Volume {
    /// Samples `sample_pages` pages of `outer` and `inner` and compares them.
    ///
    /// Files of different sizes are `Different`; empty files are `Same`.
    /// Read errors are reported as `Different`, never as an error. The only
    /// side effect is populating the page cache.
    pub fn verify_content(&self, outer: InodeId, inner: InodeId) -> DedupResult<Verdict> {
        let outer = self.inode(outer)?;
        let inner = self.inode(inner)?;
        self.compare_sampled(&outer, &inner, self.config().dedup.sample_pages)
    }

    pub(crate) fn compare_sampled(
        &self,
        outer: &Arc<Inode>,
        inner: &Arc<Inode>,
        samples: usize,
    ) -> DedupResult<Verdict> {
        if let Err(e) = self.faults().check(FaultPoint::VerifyRead) {
            if e.is_crash() {
                return Err(e);
            }
            debug!(
                outer = %outer.id(),
                inner = %inner.id(),
                error = %e,
                "Verification read failed"
            );
            return Ok(Verdict::Different);
        }
        if Arc::ptr_eq(outer, inner) {
            return Ok(Verdict::Same);
        }
        let size = outer.size();
        if size != inner.size() {
            return Ok(Verdict::Different);
        }
        if size == 0 {
            return Ok(Verdict::Same);
        }

        let pages = pages_for(size);
        // small files are compared in full
        let picks: Vec<u64> = if pages <= samples as u64 {
            (0..pages).collect()
        } else {
            let mut rng = self.rng.lock();
            (0..samples.max(1)).map(|_| rng.gen_range(0..pages)).collect()
        };
        for index in picks {
            if !self.compare_page(outer, inner, index) {
                debug!(outer = %outer.id(), inner = %inner.id(), index, "Sampled page differs");
                return Ok(Verdict::Different);
            }
        }
        Ok(Verdict::Same)
    }

    fn compare_page(&self, outer: &Arc<Inode>, inner: &Arc<Inode>, index: u64) -> bool {
        let (a, b) = match (self.load_page(outer, index), self.load_page(inner, index)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return false,
        };
        let (first, second) = if outer.id() <= inner.id() { (&a, &b) } else { (&b, &a) };
        let first_state = first.lock();
        let second_state = second.lock();
        if !still_valid(&a, outer) || !still_valid(&b, inner) {
            return false;
        }
        if first_state.evicted || second_state.evicted {
            return false;
        }
        first_state.data == second_state.data
    }
}

fn still_valid(page: &Arc<Page>, owner: &Inode) -> bool {
    page.owner() == owner.id() && owner.cache.is_current(page)
}
