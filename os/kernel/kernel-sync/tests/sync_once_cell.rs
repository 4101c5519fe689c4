use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn empty_cell_has_no_value() {
    let cell = SyncOnceCell::<u32>::new();
    assert!(cell.get().is_none());
    assert!(!cell.is_initialized());
}

#[test]
fn set_publishes_once() {
    let cell = SyncOnceCell::new();
    assert_eq!(cell.set(7u32), Ok(&7));
    assert_eq!(cell.set(8u32), Err(8));
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn get_or_init_runs_initializer_once_across_harts() {
    let harts = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(harts));

    let handles: Vec<_> = (0..harts)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *cell.get_or_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn dropping_cell_drops_value() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        cell.set(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
