use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eager_cache::{CacheConfig, CacheError, CacheEvent, CacheState, EagerCache};

use crate::utils::{Upstream, setup};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_readers_one_load() {
    setup();
    let upstream = Upstream::default();
    upstream.bump();
    let cache = EagerCache::new("readers", upstream.loader(Duration::from_millis(50)));

    let readers: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get().await })
        })
        .collect();

    for reader in readers {
        assert_eq!(*reader.await.unwrap().unwrap(), 1);
    }
    assert_eq!(upstream.loads(), 1);
    assert_eq!(cache.state(), CacheState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_invalidated_values() {
    setup();
    let upstream = Upstream::default();
    let cache = EagerCache::new("versions", upstream.loader(Duration::from_millis(2)));
    let done = Arc::new(AtomicBool::new(false));

    // background readers must only ever observe increasing versions
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut last_seen = 0;
                while !done.load(Ordering::SeqCst) {
                    let version = *cache.get().await.unwrap();
                    assert!(version >= last_seen, "{version} < {last_seen}");
                    last_seen = version;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for _ in 0..20 {
        let version = upstream.bump();
        cache.invalidate();
        // anything read after the invalidation is derived from the new upstream
        assert!(*cache.get().await.unwrap() >= version);
    }

    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn test_closure_collaborators() {
    setup();
    let fail_invalidation = Arc::new(AtomicBool::new(true));
    let invalidator = {
        let fail_invalidation = Arc::clone(&fail_invalidation);
        move || {
            let fail = fail_invalidation.load(Ordering::SeqCst);
            async move {
                if fail {
                    anyhow::bail!("upstream still busy");
                }
                Ok(())
            }
        }
    };
    let cache = EagerCache::from_config(
        &CacheConfig {
            moniker: "closures".into(),
            ..Default::default()
        },
        || async { Ok::<_, anyhow::Error>("derived") },
        invalidator,
    );
    assert_eq!(cache.moniker(), "closures");
    assert_eq!(*cache.get().await.unwrap(), "derived");

    let mut events = cache.subscribe();
    cache.invalidate();

    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let CacheEvent::InvalidateFailed(err) = events.recv().await.unwrap() {
                return err;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        failure,
        CacheError::InvalidateFailed("upstream still busy".into())
    );
    assert_eq!(cache.state(), CacheState::Failed);

    fail_invalidation.store(false, Ordering::SeqCst);
    assert_eq!(*cache.get().await.unwrap(), "derived");
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::StateChanged(CacheState::Loading)
    );
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::StateChanged(CacheState::Ready)
    );

    cache.invalidate();
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::StateChanged(CacheState::Invalidating)
    );
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::StateChanged(CacheState::Invalid)
    );
}
