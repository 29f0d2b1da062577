//! Fault-injection sweeps over the sharing protocols.
//!
//! Every protocol step is failed once, both as an I/O error and as a
//! simulated power loss. After remount recovery the volume must hold no
//! ledger entries, every inner link count must match its attached outers,
//! and file content is unchanged even when the volume was flagged for fsck.

mod common;

use common::{identical_pair, init_tracing, pattern, test_volume};
use logfs_dedup::{
    FaultAction, FaultPoint, FaultSpec, FsckIssue, InodeId, SharingState, Volume, PAGE_SIZE,
};
use tokio_util::sync::CancellationToken;

const PAGES: usize = 10;

async fn assert_consistent(vol: &Volume, outer: InodeId, content: &[u8], context: &str) {
    let report = vol
        .recover()
        .await
        .unwrap_or_else(|e| panic!("{}: recovery failed: {}", context, e));
    assert!(vol.ledger().is_empty(), "{}: ledger not empty after {:?}", context, report);

    let fsck = vol.fsck().await;
    assert!(fsck.is_clean(), "{}: {:?}", context, fsck.issues);
    assert!(
        !fsck
            .issues
            .iter()
            .any(|i| matches!(i, FsckIssue::TransitionInProgress { .. })),
        "{}: transition left behind",
        context
    );

    let got = vol.read(outer, 0, content.len()).await.unwrap();
    assert!(got == content, "{}: content changed", context);
}

async fn shared_pair(vol: &Volume, content: &[u8]) -> (InodeId, InodeId) {
    let (a, b) = identical_pair(vol, content).await;
    vol.establish_sharing(a, b, &CancellationToken::new()).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_establish_fault_sweep() {
    init_tracing();
    let content = pattern(PAGES * PAGE_SIZE, 21);
    for &point in FaultPoint::ESTABLISH {
        for action in [FaultAction::IoError, FaultAction::Crash] {
            let context = format!("establish {} {:?}", point, action);
            let vol = test_volume(256);
            let (a, b) = identical_pair(&vol, &content).await;
            vol.faults().arm(point, FaultSpec::once(action));

            let result = vol.establish_sharing(a, b, &CancellationToken::new()).await;
            if action == FaultAction::Crash {
                assert!(result.as_ref().unwrap_err().is_crash(), "{}", context);
            }
            assert_eq!(vol.faults().fired(point), 1, "{}", context);
            assert_consistent(&vol, a, &content, &context).await;

            match vol.query_sharing_state(a).await.unwrap() {
                SharingState::Shared { inner, link_count } => {
                    assert_eq!(inner, b, "{}", context);
                    assert_eq!(link_count, 1, "{}", context);
                    assert_eq!(vol.physical_blocks(a).unwrap(), 0, "{}", context);
                }
                SharingState::NotShared => {
                    assert!(result.is_err(), "{}", context);
                    assert_eq!(vol.physical_blocks(a).unwrap(), PAGES as u64, "{}", context);
                    assert_eq!(
                        vol.query_sharing_state(b).await.unwrap(),
                        SharingState::NotShared,
                        "{}",
                        context
                    );
                }
                other => panic!("{}: unexpected state {:?}", context, other),
            }
        }
    }
}

#[tokio::test]
async fn test_revoke_fault_sweep() {
    init_tracing();
    let content = pattern(PAGES * PAGE_SIZE, 22);
    for &point in FaultPoint::REVOKE {
        for action in [FaultAction::IoError, FaultAction::Crash] {
            let context = format!("revoke {} {:?}", point, action);
            let vol = test_volume(256);
            let (a, b) = shared_pair(&vol, &content).await;
            // fire in the middle of the copy where the point repeats
            let skip = match point {
                FaultPoint::RevokeReadInner
                | FaultPoint::RevokeCopy
                | FaultPoint::RevokeAllocate => 5,
                FaultPoint::RevokeWriteback => 1,
                _ => 0,
            };
            vol.faults().arm(point, FaultSpec::after(skip, action));

            let result = vol.unshare(a, &CancellationToken::new()).await;
            if action == FaultAction::Crash {
                assert!(result.as_ref().unwrap_err().is_crash(), "{}", context);
            }
            assert_eq!(vol.faults().fired(point), 1, "{}", context);
            assert_consistent(&vol, a, &content, &context).await;

            match vol.query_sharing_state(a).await.unwrap() {
                SharingState::NotShared => {
                    assert!(!vol.contains(b), "{}: inner leaked", context);
                }
                SharingState::Shared { inner, link_count } => {
                    // failures before the ledger entry or at detach leave the file shared
                    assert!(
                        matches!(
                            point,
                            FaultPoint::LedgerAdd | FaultPoint::RevokeMark | FaultPoint::Detach
                        ),
                        "{}",
                        context
                    );
                    assert_eq!((inner, link_count), (b, 1), "{}", context);
                    vol.unshare(a, &CancellationToken::new()).await.unwrap();
                    assert!(!vol.contains(b), "{}", context);
                }
                other => panic!("{}: unexpected state {:?}", context, other),
            }
        }
    }
}

#[tokio::test]
async fn test_copy_failure_halfway_decrements_once() {
    init_tracing();
    let vol = test_volume(512);
    let content = pattern(PAGES * PAGE_SIZE, 23);
    let (a, inner) = shared_pair(&vol, &content).await;
    let (c, _) = identical_pair(&vol, &content).await;
    vol.establish_sharing(c, inner, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        vol.query_sharing_state(inner).await.unwrap(),
        SharingState::Inner { link_count: 2 }
    );

    vol.faults().arm(
        FaultPoint::RevokeCopy,
        FaultSpec::after(PAGES as u64 / 2, FaultAction::IoError),
    );
    let err = vol.unshare(a, &CancellationToken::new()).await.unwrap_err();
    assert!(!err.is_crash());
    assert!(vol.needs_fsck().is_some());
    // half copied: still linked and still reading the original bytes
    assert_eq!(
        vol.query_sharing_state(a).await.unwrap(),
        SharingState::Shared { inner, link_count: 2 }
    );
    assert_eq!(vol.read(a, 0, content.len()).await.unwrap(), content);
    assert_eq!(vol.ledger().len(), 1);

    // a retry before recovery must not touch the count
    assert!(vol.unshare(a, &CancellationToken::new()).await.is_err());
    assert_eq!(
        vol.query_sharing_state(inner).await.unwrap(),
        SharingState::Inner { link_count: 2 }
    );

    let report = vol.recover().await.unwrap();
    assert_eq!(report.revocations_resumed, 1);
    assert_eq!(vol.query_sharing_state(a).await.unwrap(), SharingState::NotShared);
    assert_eq!(
        vol.query_sharing_state(inner).await.unwrap(),
        SharingState::Inner { link_count: 1 }
    );
    assert_eq!(vol.read(a, 0, content.len()).await.unwrap(), content);
    assert_eq!(vol.physical_blocks(a).unwrap(), PAGES as u64);
    assert!(vol.ledger().is_empty());

    // a second remount and a retried unshare find nothing left to do
    vol.recover().await.unwrap();
    vol.clear_needs_fsck();
    vol.unshare(a, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        vol.query_sharing_state(inner).await.unwrap(),
        SharingState::Inner { link_count: 1 }
    );

    // the other outer still reads the inner content
    assert_eq!(vol.read(c, 0, content.len()).await.unwrap(), content);
    let fsck = vol.fsck().await;
    assert!(fsck.is_clean(), "{:?}", fsck.issues);
}

#[tokio::test]
async fn test_needs_fsck_blocks_new_transitions() {
    let vol = test_volume(256);
    let content = pattern(4 * PAGE_SIZE, 24);
    let (a, b) = shared_pair(&vol, &content).await;
    vol.faults()
        .arm(FaultPoint::EstablishStamp, FaultSpec::once(FaultAction::IoError));
    let (c, _) = identical_pair(&vol, &content).await;
    vol.establish_sharing(c, b, &CancellationToken::new()).await.unwrap();
    assert!(vol.needs_fsck().is_some());

    assert!(vol.write(a, 0, b"x").await.is_err());
    assert_eq!(vol.read(a, 0, content.len()).await.unwrap(), content);
    vol.clear_needs_fsck();
    vol.write(a, 0, b"x").await.unwrap();
    assert_eq!(vol.query_sharing_state(a).await.unwrap(), SharingState::NotShared);
}
