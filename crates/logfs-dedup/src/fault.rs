//! Deterministic fault injection for the sharing protocols.
//!
//! Every externally observable step of establishment and revocation calls
//! [`FaultInjector::check`] with its [`FaultPoint`]. Tests arm a point to fail
//! on its Nth hit with an I/O error, block exhaustion, or a simulated crash.
//! A crash aborts the protocol without any compensation so that remount
//! recovery has to resolve the leftover state.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DedupError, DedupResult};

/// A named step of the sharing protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultPoint {
    /// Reading a sampled page during content verification.
    VerifyRead,
    /// Appending an orphan-ledger entry.
    LedgerAdd,
    /// Committing the attach metadata transaction.
    AttachCommit,
    /// Waiting for in-flight readers and direct I/O to drain.
    DrainReaders,
    /// Flushing the outer's dirty pages before sentinels go in.
    FlushOuter,
    /// Rewriting one block-map entry to the sentinel.
    SentinelInstall,
    /// Committing the sentinel block map.
    SentinelCommit,
    /// Stamping the consistency epoch after establishment.
    EstablishStamp,
    /// Removing an orphan-ledger entry.
    LedgerRemove,
    /// Marking the outer as revoking.
    RevokeMark,
    /// Reading one inner page during revocation.
    RevokeReadInner,
    /// Copying one inner page into the outer's page cache.
    RevokeCopy,
    /// Allocating one fresh private block during revocation writeback.
    RevokeAllocate,
    /// Writing back one revocation batch.
    RevokeWriteback,
    /// Waiting for writeback of the whole revoked range.
    RevokeWait,
    /// Committing the detach metadata transaction.
    Detach,
    /// Stamping the consistency epoch after revocation.
    RevokeStamp,
}

impl FaultPoint {
    /// Points visited by sharing establishment, in protocol order.
    pub const ESTABLISH: &'static [FaultPoint] = &[
        FaultPoint::VerifyRead,
        FaultPoint::LedgerAdd,
        FaultPoint::AttachCommit,
        FaultPoint::DrainReaders,
        FaultPoint::FlushOuter,
        FaultPoint::SentinelInstall,
        FaultPoint::SentinelCommit,
        FaultPoint::EstablishStamp,
        FaultPoint::LedgerRemove,
    ];

    /// Points visited by revocation, in protocol order.
    pub const REVOKE: &'static [FaultPoint] = &[
        FaultPoint::LedgerAdd,
        FaultPoint::RevokeMark,
        FaultPoint::RevokeReadInner,
        FaultPoint::RevokeCopy,
        FaultPoint::RevokeAllocate,
        FaultPoint::RevokeWriteback,
        FaultPoint::RevokeWait,
        FaultPoint::Detach,
        FaultPoint::RevokeStamp,
        FaultPoint::LedgerRemove,
    ];

    /// Stable kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPoint::VerifyRead => "verify-read",
            FaultPoint::LedgerAdd => "ledger-add",
            FaultPoint::AttachCommit => "attach-commit",
            FaultPoint::DrainReaders => "drain-readers",
            FaultPoint::FlushOuter => "flush-outer",
            FaultPoint::SentinelInstall => "sentinel-install",
            FaultPoint::SentinelCommit => "sentinel-commit",
            FaultPoint::EstablishStamp => "establish-stamp",
            FaultPoint::LedgerRemove => "ledger-remove",
            FaultPoint::RevokeMark => "revoke-mark",
            FaultPoint::RevokeReadInner => "revoke-read-inner",
            FaultPoint::RevokeCopy => "revoke-copy",
            FaultPoint::RevokeAllocate => "revoke-allocate",
            FaultPoint::RevokeWriteback => "revoke-writeback",
            FaultPoint::RevokeWait => "revoke-wait",
            FaultPoint::Detach => "detach",
            FaultPoint::RevokeStamp => "revoke-stamp",
        }
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an armed fault point does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultAction {
    /// Fail with an I/O error.
    IoError,
    /// Fail with block exhaustion.
    NoSpace,
    /// Simulate power loss.
    Crash,
}

/// Arming parameters for one fault point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    /// Action taken when the fault fires.
    pub action: FaultAction,
    /// Number of hits that pass before the fault fires.
    pub skip: u64,
    /// Number of times the fault fires before disarming itself.
    pub times: u64,
}

impl FaultSpec {
    /// Fires once, on the first hit.
    pub fn once(action: FaultAction) -> Self {
        Self { action, skip: 0, times: 1 }
    }

    /// Fires once, after `skip` hits have passed.
    pub fn after(skip: u64, action: FaultAction) -> Self {
        Self { action, skip, times: 1 }
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    armed: HashMap<FaultPoint, FaultSpec>,
    hits: HashMap<FaultPoint, u64>,
    fired: HashMap<FaultPoint, u64>,
}

/// Registry of armed fault points. Thread-safe via internal mutex.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<InjectorState>,
}

impl FaultInjector {
    /// Creates an injector with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `point` with `spec`, replacing any previous arming.
    pub fn arm(&self, point: FaultPoint, spec: FaultSpec) {
        self.state.lock().armed.insert(point, spec);
    }

    /// Disarms `point`.
    pub fn disarm(&self, point: FaultPoint) {
        self.state.lock().armed.remove(&point);
    }

    /// Disarms every point and resets hit counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.armed.clear();
        state.hits.clear();
        state.fired.clear();
    }

    /// How many times `point` has been reached.
    pub fn hits(&self, point: FaultPoint) -> u64 {
        self.state.lock().hits.get(&point).copied().unwrap_or(0)
    }

    /// How many times `point` has fired.
    pub fn fired(&self, point: FaultPoint) -> u64 {
        self.state.lock().fired.get(&point).copied().unwrap_or(0)
    }

    /// Records a hit on `point` and fails if it is armed and due.
    pub fn check(&self, point: FaultPoint) -> DedupResult<()> {
        let mut state = self.state.lock();
        *state.hits.entry(point).or_insert(0) += 1;

        let Some(spec) = state.armed.get_mut(&point) else {
            return Ok(());
        };
        if spec.skip > 0 {
            spec.skip -= 1;
            return Ok(());
        }
        let action = spec.action;
        spec.times = spec.times.saturating_sub(1);
        if spec.times == 0 {
            state.armed.remove(&point);
        }
        *state.fired.entry(point).or_insert(0) += 1;
        drop(state);

        warn!(point = %point, ?action, "Injected fault fired");
        Err(match action {
            FaultAction::IoError => DedupError::other(format!("injected I/O error at {}", point)),
            FaultAction::NoSpace => DedupError::OutOfSpace,
            FaultAction::Crash => DedupError::Crashed { point },
        })
    }
}
