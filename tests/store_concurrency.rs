//! Concurrent access to one workflow document.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use topicflow::core::PerformanceMonitor;
use topicflow::workflow::{
    AuditAction, AuditEntry, AuditLevel, Phase, PhaseStatus, StateStore, Step, Update,
    WorkflowDocument,
};

const WRITERS: usize = 8;

fn document(marker: usize) -> WorkflowDocument {
    let steps = (0..50).map(|i| Step::new(format!("w{marker}-s{i}"))).collect();
    let mut extra = Map::new();
    extra.insert("writer".to_string(), json!(marker));

    WorkflowDocument {
        current_phase: Some("p".to_string()),
        current_step: Some(format!("w{marker}-s0")),
        phases: vec![Phase {
            id: "p".to_string(),
            name: None,
            order: 1,
            status: PhaseStatus::InProgress,
            started_at: None,
            completed_at: None,
            depends_on: Vec::new(),
            steps,
        }],
        audit_log: Vec::new(),
        extra,
    }
}

#[test]
fn test_concurrent_saves_never_interleave() {
    let temp = TempDir::new().unwrap();
    let path = Arc::new(temp.path().join("topic.json"));
    let store = Arc::new(StateStore::default());
    store.save(&path, &document(usize::MAX)).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|marker| {
            let store = Arc::clone(&store);
            let path = Arc::clone(&path);
            thread::spawn(move || {
                for _ in 0..5 {
                    let _ = store.load(&path).unwrap();
                    thread::sleep(Duration::from_millis(2));
                    store.save(&path, &document(marker)).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let raw = std::fs::read_to_string(path.as_ref()).unwrap();
    let final_doc: WorkflowDocument = serde_json::from_str(&raw).unwrap();
    let writer = final_doc.extra["writer"].as_u64().unwrap() as usize;
    assert!(writer < WRITERS);
    assert_eq!(final_doc, document(writer));
}

#[test]
fn test_concurrent_updates_lose_nothing() {
    let temp = TempDir::new().unwrap();
    let path = Arc::new(temp.path().join("topic.json"));
    let monitor = Arc::new(PerformanceMonitor::new());
    let store = Arc::new(StateStore::new(Arc::clone(&monitor)));
    store.save(&path, &document(0)).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|marker| {
            let store = Arc::clone(&store);
            let path = Arc::clone(&path);
            thread::spawn(move || {
                store
                    .update(&path, |doc| {
                        thread::sleep(Duration::from_millis(5));
                        doc.audit_log.push(AuditEntry {
                            timestamp: Utc::now(),
                            level: AuditLevel::Info,
                            phase_id: "p".to_string(),
                            step_id: format!("writer-{marker}"),
                            action: AuditAction::Started,
                            details: Map::new(),
                            duration_seconds: None,
                        });
                        Ok(Update::Save(()))
                    })
                    .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let doc = store.load(&path).unwrap();
    assert_eq!(doc.audit_log.len(), WRITERS);

    let report = monitor.report();
    assert_eq!(report.file_writes, WRITERS as u64 + 1);
}

#[test]
fn test_readers_always_see_complete_documents() {
    let temp = TempDir::new().unwrap();
    let path = Arc::new(temp.path().join("topic.json"));
    let store = Arc::new(StateStore::default());
    store.save(&path, &document(0)).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        let path = Arc::clone(&path);
        thread::spawn(move || {
            for marker in 0..40 {
                store.save(&path, &document(marker)).unwrap();
            }
        })
    };

    let reader = {
        let path = Arc::clone(&path);
        thread::spawn(move || {
            for _ in 0..200 {
                let raw = std::fs::read(path.as_ref()).unwrap();
                serde_json::from_slice::<Value>(&raw).unwrap();
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
}
