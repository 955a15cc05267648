//! TSO monotonicity under heavy parallelism: 64 threads each draw 10k
//! timestamps; the union is 640k distinct positive values and no thread
//! ever observes a decrease.

use std::sync::Arc;

use rangekv_core::config::TsProviderConfig;
use rangekv_core::ts::{LocalTsSource, TsProvider};

#[test]
fn test_parallel_monotonic_distinct_timestamps() {
    const THREADS: usize = 64;
    const PER_THREAD: usize = 10_000;

    let provider = Arc::new(TsProvider::new(
        Arc::new(LocalTsSource::new()),
        TsProviderConfig::default(),
    ));

    let mut handles = Vec::with_capacity(THREADS);
    for _ in 0..THREADS {
        let provider = Arc::clone(&provider);
        handles.push(std::thread::spawn(move || {
            let mut seen = Vec::with_capacity(PER_THREAD);
            let mut last = 0_i64;
            for _ in 0..PER_THREAD {
                let ts = provider.get_ts();
                assert!(ts > 0, "get_ts exhausted its retries");
                assert!(ts > last, "thread observed a decrease: {ts} after {last}");
                last = ts;
                seen.push(ts);
            }
            seen
        }));
    }

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(all.len(), THREADS * PER_THREAD);

    all.sort_unstable();
    all.dedup();
    assert_eq!(
        all.len(),
        THREADS * PER_THREAD,
        "timestamps must be globally distinct"
    );
    assert!(all[0] > 0);
}

#[test]
fn test_after_ts_is_strictly_respected() {
    let provider = TsProvider::new(
        Arc::new(LocalTsSource::new()),
        TsProviderConfig::default(),
    );
    let mut bar = provider.get_ts();
    for _ in 0..1000 {
        let ts = provider.get_ts_after(bar);
        assert!(ts == 0 || ts > bar);
        if ts > 0 {
            bar = ts;
        }
    }
}
