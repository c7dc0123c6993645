use std::collections::BTreeMap;
use std::time::Duration;

use warmcache::{CacheDescriptor, CacheKey, ElementType, Shape};

use crate::{CallCounter, filesystem_shared_cache, setup_engine, shared_cache_files, wait_for};

fn catalog() -> Vec<CacheDescriptor> {
    vec![
        CacheDescriptor::for_method("Catalog", "names")
            .with_arity(1)
            .distributed(Shape::List(ElementType::String)),
        CacheDescriptor::for_method("Catalog", "prices")
            .with_arity(1)
            .distributed(Shape::Map {
                key: ElementType::String,
                value: ElementType::Float,
            }),
    ]
}

/// A list written by one engine is read back in order by another engine.
#[tokio::test]
async fn test_list_round_trip() {
    let (first, shared_cache_dir) = setup_engine(catalog(), |_| {});
    let (second, _other_dir) = setup_engine(catalog(), |config| {
        config.shared_cache = Some(filesystem_shared_cache(shared_cache_dir.path()));
    });
    let names = vec!["zeta".to_owned(), "alpha".to_owned(), "mu".to_owned()];
    let key = CacheKey::from_args(&[&"books"]);

    let writer = first.cacher::<Vec<String>, String>("Catalog.names").unwrap();
    writer
        .shared_tier()
        .unwrap()
        .write_through(&key, &names)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(shared_cache_files(&shared_cache_dir), 1);

    let reader = second.cacher::<Vec<String>, String>("Catalog.names").unwrap();
    let read = reader.shared_tier().unwrap().read_through(&key).await;
    assert_eq!(read, Some(names));
}

#[tokio::test]
async fn test_computed_values_are_shared() {
    let (first, shared_cache_dir) = setup_engine(catalog(), |_| {});
    let (second, _other_dir) = setup_engine(catalog(), |config| {
        config.shared_cache = Some(filesystem_shared_cache(shared_cache_dir.path()));
    });
    let key = CacheKey::from_args(&[&"books"]);

    let cacher = first
        .cacher::<BTreeMap<String, f64>, String>("Catalog.prices")
        .unwrap();
    let computed = cacher
        .resolve(key.clone(), || async {
            Ok(BTreeMap::from([("dune".to_owned(), 9.5), ("emma".to_owned(), 4.0)]))
        })
        .await
        .unwrap();
    wait_for(
        || shared_cache_files(&shared_cache_dir) == 1,
        Duration::from_secs(2),
    )
    .await;

    let cacher = second
        .cacher::<BTreeMap<String, f64>, String>("Catalog.prices")
        .unwrap();
    let calls = CallCounter::new();
    let shared = {
        let calls = calls.clone();
        cacher
            .resolve(key, move || async move {
                calls.hit();
                Ok(BTreeMap::new())
            })
            .await
            .unwrap()
    };
    assert_eq!(shared, computed);
    assert_eq!(calls.get(), 0);

    let metrics = second.shared_cache_metrics().snapshot();
    assert_eq!(metrics["Catalog.prices"].hits, 1);
    assert_eq!(metrics["Catalog.prices"].requests, 1);
    assert_eq!(metrics["Catalog.names"].requests, 0);
}

#[tokio::test]
async fn test_disabled_shared_cache() {
    let (engine, shared_cache_dir) = setup_engine(catalog(), |config| {
        config.enable_shared_cache = false;
    });
    assert!(engine.shared_cache().is_none());
    assert!(engine.shared_cache_metrics().is_empty());

    let cacher = engine.cacher::<Vec<String>, String>("Catalog.names").unwrap();
    cacher
        .resolve(CacheKey::from_args(&[&"books"]), || async {
            Ok(vec!["dune".to_owned()])
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shared_cache_files(&shared_cache_dir), 0);
}
