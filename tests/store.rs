//! Artifact Store Integration Tests
//!
//! Concurrency, crash-safety and listing behaviour of the filesystem store.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{create_test_store, name};
use shadertriage::domain::{Complexity, Payload, Provenance, ShaderJob, Status};
use shadertriage::store::WritePhase;
use shadertriage::{ArtifactStore, CreateMode, Error, Metadata, PayloadFile};
use tokio_test::assert_err;

fn shader_metadata(files: &[&str]) -> Metadata {
    Metadata::new(
        Payload::ShaderJob(ShaderJob {
            files: files.iter().map(|f| f.to_string()).collect(),
            seed: None,
            generator: "test".to_string(),
            complexity: Complexity::default(),
            expected_output: None,
        }),
        Provenance::root("test"),
    )
}

async fn names(store: &ArtifactStore) -> Vec<String> {
    store
        .list(None)
        .collect_valid()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name.to_string())
        .collect()
}

#[tokio::test]
async fn test_payload_bytes_survive_exactly() {
    let (store, _temp) = create_test_store().await;
    let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let files = vec![
        PayloadFile::new("shader.frag", "void main() {}\r\n\0tail"),
        PayloadFile::new("image.png", binary.clone()),
    ];

    let artifact = store
        .create(
            &name("runs/a/tests/t1"),
            shader_metadata(&["shader.frag"]),
            files,
            CreateMode::Exact,
        )
        .await
        .unwrap();

    assert_eq!(
        store.read_payload(&artifact.name, "shader.frag").await.unwrap(),
        b"void main() {}\r\n\0tail".to_vec()
    );
    assert_eq!(store.read_payload(&artifact.name, "image.png").await.unwrap(), binary);

    let on_disk = std::fs::read(artifact.dir.join("metadata.json")).unwrap();
    assert_eq!(on_disk, artifact.metadata.encode().unwrap());
    let read = store.read(&artifact.name).await.unwrap();
    assert_eq!(read.metadata.encode().unwrap(), on_disk);
    assert_eq!(
        store.payload_files(&artifact.name).await.unwrap(),
        vec!["image.png".to_string(), "shader.frag".to_string()]
    );
}

#[tokio::test]
async fn test_concurrent_unique_creates_never_collide() {
    let (store, _temp) = create_test_store().await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            // Half share a hint and identical content
            let hint = if i % 2 == 0 {
                name("runs/s/tests/shared")
            } else {
                name(&format!("runs/s/tests/own-{}", i))
            };
            store
                .create(
                    &hint,
                    shader_metadata(&["shader.frag"]),
                    vec![PayloadFile::new("shader.frag", "same")],
                    CreateMode::Unique,
                )
                .await
                .unwrap()
                .name
        }));
    }

    let mut created = HashSet::new();
    for task in tasks {
        assert!(created.insert(task.await.unwrap()));
    }
    assert_eq!(created.len(), 16);
    for artifact in &created {
        assert!(store.exists(artifact));
    }
}

#[tokio::test]
async fn test_concurrent_exact_creates_have_one_winner() {
    let (store, _temp) = create_test_store().await;
    let target = name("buckets/crash.compile_error");

    let mut tasks = Vec::new();
    for i in 0..12 {
        let store = store.clone();
        let target = target.clone();
        tasks.push(tokio::spawn(async move {
            store
                .create(
                    &target,
                    shader_metadata(&["shader.frag"]),
                    vec![PayloadFile::new("shader.frag", format!("writer {}", i))],
                    CreateMode::Exact,
                )
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(Error::NameCollision(n)) => assert_eq!(n, target.to_string()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);

    // Whatever won is internally consistent
    let content = store.read_payload(&target, "shader.frag").await.unwrap();
    assert!(String::from_utf8(content).unwrap().starts_with("writer "));
}

#[tokio::test]
async fn test_failed_write_leaves_nothing_visible() {
    for phase in [
        WritePhase::StagingCreated,
        WritePhase::FilesWritten,
        WritePhase::MetadataWritten,
        WritePhase::BeforeCommit,
    ] {
        let (store, _temp) = create_test_store().await;
        let store = store.with_fault_injector(Arc::new(move |at| {
            if at == phase {
                Err(std::io::Error::other("simulated crash"))
            } else {
                Ok(())
            }
        }));

        let target = name("runs/a/tests/t1");
        let err = assert_err!(
            store
                .create(
                    &target,
                    shader_metadata(&["shader.frag"]),
                    vec![PayloadFile::new("shader.frag", "x")],
                    CreateMode::Exact,
                )
                .await
        );
        assert!(matches!(err, Error::Io(_)), "{:?}: {}", phase, err);

        assert!(matches!(store.read(&target).await, Err(Error::NotFound(_))));
        assert!(names(&store).await.is_empty());
    }
}

#[tokio::test]
async fn test_failed_metadata_update_keeps_previous_revision() {
    let (store, _temp) = create_test_store().await;
    let target = name("runs/a/tests/t1");
    store
        .create(&target, shader_metadata(&[]), Vec::new(), CreateMode::Exact)
        .await
        .unwrap();

    let failing = store.clone().with_fault_injector(Arc::new(|at| {
        if at == WritePhase::BeforeCommit {
            Err(std::io::Error::other("simulated crash"))
        } else {
            Ok(())
        }
    }));
    assert_err!(
        failing
            .update_metadata(&target, |m| m.status = Status::Failed)
            .await
    );

    let current = store.read(&target).await.unwrap();
    assert_eq!(current.metadata.revision, 0);
    assert_eq!(current.metadata.status, Status::Pending);
}

#[tokio::test]
async fn test_sweep_removes_abandoned_staging() {
    let (store, _temp) = create_test_store().await;

    // What a writer killed mid-create leaves behind
    let abandoned = store.root().join(".staging").join("create-dead");
    std::fs::create_dir_all(&abandoned).unwrap();
    std::fs::write(abandoned.join("shader.frag"), "partial").unwrap();
    let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
    filetime::set_file_mtime(&abandoned, filetime::FileTime::from_system_time(an_hour_ago)).unwrap();

    let fresh = store.root().join(".staging").join("create-live");
    std::fs::create_dir_all(&fresh).unwrap();

    assert!(names(&store).await.is_empty());

    let removed = store.sweep_staging(Duration::from_secs(600)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(!abandoned.exists());
    assert!(fresh.exists());
}

#[tokio::test]
async fn test_listing_order_and_resume() {
    let (store, _temp) = create_test_store().await;
    for raw in ["b", "a-c", "a/b", "a", "a/a/z"] {
        store
            .create(&name(raw), shader_metadata(&[]), Vec::new(), CreateMode::Exact)
            .await
            .unwrap();
    }

    assert_eq!(names(&store).await, vec!["a", "a/a/z", "a/b", "a-c", "b"]);

    let mut listing = store.list(None);
    let mut first = Vec::new();
    for _ in 0..2 {
        first.push(listing.next().await.unwrap().unwrap().name.to_string());
    }
    let cursor = listing.cursor().unwrap().clone();
    assert_eq!(cursor.to_string(), "a/a/z");

    let rest: Vec<String> = store
        .list_after(None, &cursor)
        .collect_valid()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name.to_string())
        .collect();
    assert_eq!(rest, vec!["a/b", "a-c", "b"]);

    // Artifacts created after the cursor show up on resume
    store
        .create(&name("c"), shader_metadata(&[]), Vec::new(), CreateMode::Exact)
        .await
        .unwrap();
    let rest = store.list_after(None, &cursor).collect_valid().await.unwrap();
    assert_eq!(rest.last().unwrap().name.to_string(), "c");
}

#[tokio::test]
async fn test_removed_subtree_disappears() {
    let (store, _temp) = create_test_store().await;
    for raw in ["t", "t/results/gpu", "t/reductions/lines", "u"] {
        store
            .create(&name(raw), shader_metadata(&[]), Vec::new(), CreateMode::Exact)
            .await
            .unwrap();
    }

    store.remove(&name("t")).await.unwrap();

    assert_eq!(names(&store).await, vec!["u"]);
    assert!(matches!(
        store.read(&name("t/results/gpu")).await,
        Err(Error::NotFound(_))
    ));
}
