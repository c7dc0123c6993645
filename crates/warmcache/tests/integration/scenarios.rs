use std::time::Duration;

use futures::future::join_all;
use warmcache::{CacheDescriptor, CacheKey, ReloadState};

use crate::{CallCounter, setup_engine, wait_for};

/// Inserting a third key into a cache of two evicts the oldest one.
#[tokio::test]
async fn test_capacity_eviction() {
    let (engine, _shared_cache_dir) = setup_engine(
        vec![
            CacheDescriptor::for_method("Letters", "upper")
                .with_arity(1)
                .with_ttl(Duration::from_secs(1))
                .with_capacity(2),
        ],
        |_| {},
    );
    let cacher = engine.cacher::<String, String>("Letters.upper").unwrap();

    for letter in ["a", "b", "c"] {
        let value = cacher
            .resolve(CacheKey::from_args(&[&letter]), move || async move {
                Ok(letter.to_uppercase())
            })
            .await;
        assert_eq!(value, Ok(letter.to_uppercase()));
    }

    assert_eq!(cacher.get(&CacheKey::from_args(&[&"a"])), None);
    assert_eq!(cacher.get(&CacheKey::from_args(&[&"b"])), Some("B".into()));
    assert_eq!(cacher.get(&CacheKey::from_args(&[&"c"])), Some("C".into()));
    assert_eq!(cacher.stats().evictions, 1);
}

/// An evicted auto reloading entry comes back without anybody asking for it.
#[tokio::test]
async fn test_reload_after_eviction() {
    let (engine, _shared_cache_dir) = setup_engine(
        vec![
            CacheDescriptor::for_method("Settings", "load")
                .with_auto_reload()
                .with_ttl(Duration::from_millis(100)),
        ],
        |_| {},
    );

    let calls = CallCounter::new();
    let settings = {
        let calls = calls.clone();
        engine
            .auto_reload("Settings.load", move || {
                let generation = calls.hit() as u64;
                async move { Ok::<_, String>(generation) }
            })
            .unwrap()
    };
    assert_eq!(engine.warm_up().await, 1);
    assert_eq!(settings.state(), ReloadState::Warm);

    wait_for(|| calls.get() >= 2, Duration::from_secs(2)).await;
    wait_for(
        || settings.cacher().get(&CacheKey::empty()).is_some(),
        Duration::from_secs(2),
    )
    .await;
    assert_ne!(settings.state(), ReloadState::Cold);
    assert!(settings.cacher().stats().evictions >= 1);
}

/// Fifty callers of the same cold key wait on a single slow computation.
#[tokio::test]
async fn test_concurrent_callers() {
    let (engine, _shared_cache_dir) = setup_engine(
        vec![CacheDescriptor::for_method("Reports", "build").with_arity(1)],
        |_| {},
    );
    let cacher = engine.cacher::<Vec<u32>, String>("Reports.build").unwrap();
    let calls = CallCounter::new();

    let tasks = (0..50).map(|_| {
        let cacher = cacher.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cacher
                .resolve(CacheKey::from_args(&[&"weekly"]), move || async move {
                    calls.hit();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(vec![1, 2, 3])
                })
                .await
        })
    });
    let results = join_all(tasks).await;

    assert_eq!(calls.get(), 1);
    for result in results {
        assert_eq!(result.unwrap(), Ok(vec![1, 2, 3]));
    }
}

/// Falsy values are values, only explicitly absent ones are skipped.
#[tokio::test]
async fn test_falsy_values() {
    let (engine, _shared_cache_dir) = setup_engine(
        vec![
            CacheDescriptor::for_method("Users", "nickname").with_arity(1),
            CacheDescriptor::for_method("Users", "score").with_arity(1),
        ],
        |_| {},
    );
    let nickname = engine
        .cacher::<Option<String>, String>("Users.nickname")
        .unwrap();
    let score = engine.cacher::<u32, String>("Users.score").unwrap();
    let calls = CallCounter::new();

    for _ in 0..3 {
        let key = CacheKey::from_args(&[&1]);
        let nickname_calls = calls.clone();
        nickname
            .resolve(key.clone(), move || async move {
                nickname_calls.hit();
                Ok(Some(String::new()))
            })
            .await
            .unwrap();
        let score_calls = calls.clone();
        score
            .resolve(key, move || async move {
                score_calls.hit();
                Ok(0)
            })
            .await
            .unwrap();
    }
    assert_eq!(calls.get(), 2);

    let missing = nickname
        .resolve(CacheKey::from_args(&[&2]), || async { Ok(None) })
        .await;
    assert_eq!(missing, Ok(None));
    assert_eq!(nickname.len(), 1);
}
