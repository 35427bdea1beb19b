//! End-to-end tests for the share store.
//!
//! These tests drive the public components together:
//! - Share creation, upload and download bookkeeping
//! - Chunked uploads, including concurrent final chunks
//! - Eviction sweeps over a mixed store
//! - Registry persistence across restarts

use std::io::{Cursor, Read};
use std::sync::Arc;

use daemon::eviction::{EvictionScheduler, EvictionSettings};
use daemon::registry::TokenRegistry;
use daemon::service::ShareService;
use daemon::store::ObjectStore;
use daemon::upload::{ChunkAssembler, ChunkOutcome};
use daemon::{ManualClock, ShareError};
use protocol::{ChunkUpload, ShareToken};
use tempfile::TempDir;

const START: i64 = 1_700_000_000;

/// All components over one temporary data directory with a manual clock.
struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    registry: Arc<TokenRegistry>,
    store: Arc<ObjectStore>,
    assembler: Arc<ChunkAssembler>,
    service: ShareService,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let registry = Arc::new(
            TokenRegistry::open(dir.path().join("shares.db"))
                .unwrap()
                .with_clock(clock.clone()),
        );
        let store = Arc::new(ObjectStore::new(dir.path().join("uploads")).unwrap());
        let assembler = Arc::new(
            ChunkAssembler::new(
                dir.path().join("staging"),
                Arc::clone(&registry),
                Arc::clone(&store),
            )
            .unwrap(),
        );
        let service = ShareService::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&assembler),
            24,
        );
        Self {
            dir,
            clock,
            registry,
            store,
            assembler,
            service,
        }
    }

    fn scheduler(&self) -> Arc<EvictionScheduler> {
        Arc::new(
            EvictionScheduler::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                EvictionSettings::default(),
            )
            .with_assembler(Arc::clone(&self.assembler)),
        )
    }

    fn stored_files(&self, token: &ShareToken) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.store.token_dir(token))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

// =============================================================================
// Share Lifecycle Tests
// =============================================================================

#[test]
fn test_created_share_is_empty_with_expected_deadline() {
    let h = Harness::new();

    let token = h.service.create_share(Some("r@example.com")).unwrap();
    let record = h.registry.get(&token).unwrap();
    assert!(record.files.is_empty());
    assert_eq!(record.recipient.as_deref(), Some("r@example.com"));
    assert_eq!(record.created_at, START);
    assert_eq!(record.expires_at, Some(START + 24 * 3600));

    let pinned = h.service.create_share(None).unwrap();
    let record = h.registry.get(&pinned).unwrap();
    assert_eq!(record.recipient, None);
    assert_eq!(record.expires_at, None);
}

#[test]
fn test_share_without_recipient_never_expires() {
    let h = Harness::new();
    let token = h.service.create_share(None).unwrap();

    for _ in 0..5 {
        h.clock.advance_hours(24 * 365);
        let record = h.registry.open_share(&token).unwrap();
        assert!(!record.is_expired_at(h.registry.now()));
    }

    h.scheduler().sweep().unwrap();
    assert!(h.registry.exists(&token).unwrap());
}

#[test]
fn test_upload_download_and_expiry() {
    let h = Harness::new();
    let token = h.service.create_share(Some("r@example.com")).unwrap();

    h.service
        .upload(&token, "report.pdf", &mut Cursor::new(b"%PDF-1.7"))
        .unwrap();
    let duplicate = h
        .service
        .upload(&token, "report.pdf", &mut Cursor::new(b"%PDF-1.4"))
        .unwrap();
    assert_eq!(duplicate, "report_1.pdf");

    let summary = h.service.open_download(&token).unwrap();
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.total_size, 16);

    let mut download = h.service.download_file(&token, "report_1.pdf").unwrap();
    let mut content = Vec::new();
    download.file.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"%PDF-1.4");

    h.clock.advance_hours(24);
    assert!(matches!(
        h.service.download_file(&token, "report.pdf"),
        Err(ShareError::Expired(_))
    ));
}

#[test]
fn test_repeated_file_download_counts_once_per_file() {
    let h = Harness::new();
    let token = h.service.create_share(None).unwrap();
    h.service
        .upload(&token, "a.txt", &mut Cursor::new(b"abc"))
        .unwrap();

    h.registry.mark_file_downloaded(&token, "a.txt").unwrap();
    h.registry.mark_file_downloaded(&token, "a.txt").unwrap();

    let record = h.registry.get(&token).unwrap();
    assert_eq!(record.downloaded_files.len(), 1);
    assert_eq!(record.download_count, 0);

    h.registry.mark_downloaded(&token).unwrap();
    assert_eq!(h.registry.get(&token).unwrap().download_count, 1);
}

#[test]
fn test_traversal_names_stay_inside_token_dir() {
    let h = Harness::new();
    let token = h.service.create_share(None).unwrap();

    match h
        .service
        .upload(&token, "../secret", &mut Cursor::new(b"x"))
    {
        Ok(stored) => {
            assert_eq!(stored, "secret");
            assert!(h.store.token_dir(&token).join("secret").is_file());
        }
        Err(e) => assert!(matches!(e, ShareError::PathTraversalRejected(_))),
    }
    assert!(!h.dir.path().join("secret").exists());
    assert!(!h.dir.path().join("uploads").join("secret").exists());
}

#[test]
fn test_registry_survives_restart() {
    let h = Harness::new();
    let token = h.service.create_share(Some("r@example.com")).unwrap();
    h.service
        .upload(&token, "a.txt", &mut Cursor::new(b"abc"))
        .unwrap();
    h.registry.mark_downloaded(&token).unwrap();

    let reopened = TokenRegistry::open(h.dir.path().join("shares.db")).unwrap();
    let record = reopened.get(&token).unwrap();
    assert_eq!(record.files, vec!["a.txt".to_string()]);
    assert_eq!(record.download_count, 1);
    assert_eq!(
        reopened.schema_version().unwrap(),
        daemon::registry::LATEST_SCHEMA_VERSION
    );
}

// =============================================================================
// Chunked Upload Tests
// =============================================================================

#[test]
fn test_redelivered_chunk_does_not_duplicate_data() {
    let h = Harness::new();
    let token = h.service.create_share(None).unwrap();
    let chunk = |n: u32, data: &[u8]| {
        ChunkUpload::new("sess-1", token.as_str(), "log.txt", n, 3, data.to_vec())
    };

    h.assembler.upload_chunk(&chunk(2, b"BB")).unwrap();
    let again = h.assembler.upload_chunk(&chunk(2, b"BB")).unwrap();
    assert!(matches!(
        again,
        ChunkOutcome::Pending {
            received: 1,
            total: 3
        }
    ));

    h.assembler.upload_chunk(&chunk(1, b"AA")).unwrap();
    let done = h.assembler.upload_chunk(&chunk(3, b"CC")).unwrap();
    assert!(done.is_complete());

    let mut content = String::new();
    std::fs::File::open(h.store.token_dir(&token).join("log.txt"))
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "AABBCC");
    assert_eq!(h.registry.get(&token).unwrap().files, vec!["log.txt"]);
}

#[test]
fn test_concurrent_final_chunks_assemble_once() {
    for round in 0..20 {
        let h = Harness::new();
        let token = h.service.create_share(None).unwrap();
        let session = format!("race-{}", round);

        h.assembler
            .upload_chunk(&ChunkUpload::new(
                session.as_str(),
                token.as_str(),
                "data.bin",
                1,
                3,
                b"one-".to_vec(),
            ))
            .unwrap();

        let outcomes: Vec<ChunkOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = [(2u32, b"two-".to_vec()), (3u32, b"three".to_vec())]
                .into_iter()
                .map(|(n, data)| {
                    let assembler = Arc::clone(&h.assembler);
                    let chunk = ChunkUpload::new(
                        session.as_str(),
                        token.as_str(),
                        "data.bin",
                        n,
                        3,
                        data,
                    );
                    scope.spawn(move || assembler.upload_chunk(&chunk).unwrap())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert!(outcomes.iter().any(ChunkOutcome::is_complete));
        assert_eq!(h.stored_files(&token), vec!["data.bin".to_string()]);
        assert_eq!(h.registry.get(&token).unwrap().files, vec!["data.bin"]);

        let content = std::fs::read(h.store.token_dir(&token).join("data.bin")).unwrap();
        assert_eq!(content, b"one-two-three");
    }
}

#[test]
fn test_chunked_upload_rejected_after_expiry() {
    let h = Harness::new();
    let token = h.service.create_share(Some("r@example.com")).unwrap();
    h.clock.advance_hours(25);

    let result = h.assembler.upload_chunk(&ChunkUpload::new(
        "late",
        token.as_str(),
        "a.txt",
        1,
        1,
        b"x".to_vec(),
    ));
    assert!(matches!(result, Err(ShareError::Expired(_))));
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[test]
fn test_sweep_removes_only_expired_and_orphaned_shares() {
    let h = Harness::new();

    // (a) expired share with a recipient
    let expired = h.registry.create(Some("a@example.com"), 1).unwrap();
    h.service
        .upload(&expired, "a.txt", &mut Cursor::new(b"a"))
        .unwrap();

    // (b) live share with a recipient
    let live = h.registry.create(Some("b@example.com"), 48).unwrap();
    h.service
        .upload(&live, "b.txt", &mut Cursor::new(b"b"))
        .unwrap();

    // (c) pending share with no files
    let pending = h.registry.create(None, 24).unwrap();

    // (d) directory without a registry record
    let orphan = ShareToken::generate();
    h.store
        .save(&orphan, "d.txt", &mut Cursor::new(b"d"))
        .unwrap();

    h.clock.advance_hours(2);
    let report = h.scheduler().sweep().unwrap();

    assert_eq!(report.expired_removed, 1);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(report.reclaimed(), 2);

    assert!(!h.registry.exists(&expired).unwrap());
    assert!(!h.store.token_dir(&expired).exists());
    assert!(!h.store.token_dir(&orphan).exists());

    assert!(h.registry.exists(&live).unwrap());
    assert_eq!(h.stored_files(&live), vec!["b.txt".to_string()]);
    assert!(h.registry.exists(&pending).unwrap());

    // A second pass finds nothing left to do.
    assert_eq!(h.scheduler().sweep().unwrap().reclaimed(), 0);
}

#[tokio::test]
async fn test_scheduler_runs_in_background() {
    let h = Harness::new();
    let expired = h.registry.create(Some("a@example.com"), 1).unwrap();
    h.service
        .upload(&expired, "a.txt", &mut Cursor::new(b"a"))
        .unwrap();
    h.clock.advance_hours(2);

    let scheduler = h.scheduler();
    assert!(scheduler.start());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.store.token_dir(&expired).exists() && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(!h.store.token_dir(&expired).exists());

    scheduler.stop().await;
    assert!(!scheduler.is_running());
}
