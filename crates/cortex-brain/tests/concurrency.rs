//! Many handles writing to one store file at the same time.

use std::sync::{Arc, Barrier};
use std::thread;

use cortex_brain::{Brain, HistoryFilter, NewAtom, NewMemory, NewMessage};

const WRITERS: usize = 12;
const WRITES_PER_WRITER: usize = 25;

#[test]
fn test_concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brain.db");

    // Schema is created once up front; writers then race on the same file.
    let brain = Brain::open(&path).unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> cortex_brain::Result<()> {
                let handle = Brain::open(&path)?;
                barrier.wait();
                for i in 0..WRITES_PER_WRITER {
                    handle.remember(NewMemory::new(format!("writer {} note {}", w, i)))?;
                    handle.send(
                        NewMessage::new(format!("agent-{}", w), "status", format!("tick {}", i))
                            .in_thread("thr_shared"),
                    )?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let expected = WRITERS * WRITES_PER_WRITER;
    let stats = brain.stats().unwrap();
    assert_eq!(stats.stm_count, expected);
    assert_eq!(stats.message_count, expected);
    assert_eq!(stats.thread_count, 1);

    let thread = brain.get_thread("thr_shared").unwrap().unwrap();
    assert_eq!(thread.message_count as usize, expected);

    let history = brain
        .history(&HistoryFilter::new(expected).thread("thr_shared"))
        .unwrap();
    assert_eq!(history.len(), expected);
    assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[test]
fn test_concurrent_opens_of_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.db");
    assert!(!path.exists());

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> cortex_brain::Result<String> {
                barrier.wait();
                let handle = Brain::open(&path)?;
                handle.create_atom(NewAtom::new(format!("subject {}", w), "acts", "result", "effect"))
            })
        })
        .collect();

    let ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(ids.len(), WRITERS);

    let brain = Brain::open(&path).unwrap();
    assert_eq!(brain.atom_stats().unwrap().total_atoms, WRITERS);
}
