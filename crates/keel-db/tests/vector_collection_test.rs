//! Integration tests for named vector collections.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL database
//! with the pgvector extension available.

use keel_db::test_fixtures::TestDatabase;
use keel_db::{
    CreateCollectionRequest, DistanceMetric, Error, IndexConfig, IndexType, RecallTarget,
    SearchRequest, VectorRepository,
};
use serde_json::json;

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_exact_search_returns_identical_vector_first() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("exact");
    let db = test_db.db.clone();

    let collection = db
        .vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 3)
                .with_index(IndexType::Exact, IndexConfig::default()),
        )
        .await
        .unwrap();
    assert_eq!(collection.dimension, 3);
    assert_eq!(collection.metric, DistanceMetric::Cosine);
    assert_eq!(collection.row_count, 0);

    db.vectors
        .upsert(&name, "a", &[1.0, 0.0, 0.0], json!({"kind": "x"}))
        .await
        .unwrap();
    db.vectors
        .upsert(&name, "b", &[0.0, 1.0, 0.0], json!({"kind": "y"}))
        .await
        .unwrap();
    db.vectors
        .upsert(&name, "c", &[0.7, 0.7, 0.0], json!({"kind": "x"}))
        .await
        .unwrap();

    let results = db
        .vectors
        .search(&name, &SearchRequest::new(vec![0.0, 1.0, 0.0], 3))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].id, "b");
    assert!((results[0].score - 1.0).abs() < 1e-6);
    assert!(results[0].score >= results[1].score);
    assert!(results[1].score >= results[2].score);

    let filtered = db
        .vectors
        .search(
            &name,
            &SearchRequest::new(vec![0.0, 1.0, 0.0], 3).with_filter(json!({"kind": "x"})),
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 2);
    assert_eq!(filtered[0].id, "c");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_upsert_replaces_and_counts_rows() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("rows");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 2).with_metric(DistanceMetric::Euclidean),
        )
        .await
        .unwrap();

    db.vectors
        .upsert(&name, "a", &[1.0, 1.0], json!({"v": 1}))
        .await
        .unwrap();
    db.vectors
        .upsert(&name, "a", &[2.0, 2.0], json!({"v": 2}))
        .await
        .unwrap();
    db.vectors
        .upsert(&name, "b", &[5.0, 5.0], json!({}))
        .await
        .unwrap();

    assert_eq!(db.vectors.count(&name).await.unwrap(), 2);
    let meta = db.vectors.get_collection(&name).await.unwrap().unwrap();
    assert_eq!(meta.row_count, 2);

    let results = db
        .vectors
        .search(&name, &SearchRequest::new(vec![2.0, 2.0], 1))
        .await
        .unwrap();
    assert_eq!(results[0].id, "a");
    assert_eq!(results[0].payload, json!({"v": 2}));
    assert!(results[0].distance.abs() < 1e-6);
    assert!((results[0].score - 1.0).abs() < 1e-6);

    assert!(db.vectors.delete(&name, "a").await.unwrap());
    assert!(!db.vectors.delete(&name, "a").await.unwrap());
    let meta = db.vectors.get_collection(&name).await.unwrap().unwrap();
    assert_eq!(meta.row_count, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_dimension_mismatch_and_unknown_collection() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("dims");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(CreateCollectionRequest::new(&name, 4))
        .await
        .unwrap();

    let err = db
        .vectors
        .upsert(&name, "a", &[1.0, 2.0], json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: 4,
            actual: 2
        }
    ));

    let err = db
        .vectors
        .search(&name, &SearchRequest::new(vec![1.0; 5], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));

    let err = db
        .vectors
        .upsert("t_no_such_collection", "a", &[1.0], json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCollection(_)));

    let err = db
        .vectors
        .create_collection(CreateCollectionRequest::new(&name, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CollectionExists(_)));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_ivf_reindex_derives_parameters() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("ivf");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 2)
                .with_index(IndexType::Ivf, IndexConfig::default()),
        )
        .await
        .unwrap();
    for i in 0..20 {
        db.vectors
            .upsert(&name, &format!("v{}", i), &[i as f32, 1.0], json!({}))
            .await
            .unwrap();
    }

    let config = db
        .vectors
        .reindex(&name, Some(RecallTarget::Exhaustive))
        .await
        .unwrap();
    assert_eq!(config.lists, Some(1));
    assert_eq!(config.probes, Some(1));
    assert_eq!(config.recall_target, RecallTarget::Exhaustive);

    let meta = db.vectors.get_collection(&name).await.unwrap().unwrap();
    assert_eq!(meta.reindex_row_count, Some(20));
    assert!(meta.last_reindex_at.is_some());
    assert_eq!(meta.index_config, config);

    // Rows added after the rebuild are still found.
    db.vectors
        .upsert(&name, "late", &[100.0, 1.0], json!({}))
        .await
        .unwrap();
    let results = db
        .vectors
        .search(&name, &SearchRequest::new(vec![100.0, 1.0], 1))
        .await
        .unwrap();
    assert_eq!(results[0].id, "late");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_graph_collection_search_and_reindex() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("graph");
    let db = test_db.db.clone();

    let collection = db
        .vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 3)
                .with_metric(DistanceMetric::Dot)
                .with_index(IndexType::Graph, IndexConfig::default()),
        )
        .await
        .unwrap();
    assert!(collection.index_config.m.is_some());
    assert!(collection.index_config.ef_search.is_some());

    db.vectors
        .upsert(&name, "big", &[3.0, 3.0, 3.0], json!({}))
        .await
        .unwrap();
    db.vectors
        .upsert(&name, "small", &[0.1, 0.1, 0.1], json!({}))
        .await
        .unwrap();

    let results = db
        .vectors
        .search(&name, &SearchRequest::new(vec![1.0, 1.0, 1.0], 2))
        .await
        .unwrap();
    assert_eq!(results[0].id, "big");
    assert!((results[0].score - 9.0).abs() < 1e-4);

    let config = db.vectors.reindex(&name, None).await.unwrap();
    assert_eq!(config.m, collection.index_config.m);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_reindex_refuses_to_run_twice() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("lock");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 2)
                .with_index(IndexType::Ivf, IndexConfig::default()),
        )
        .await
        .unwrap();

    // Hold the rebuild lock from another session.
    let mut holder = db.pool.acquire().await.unwrap();
    let key = format!("keel_reindex:{}", name);
    sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
        .bind(&key)
        .execute(&mut *holder)
        .await
        .unwrap();

    let err = db.vectors.reindex(&name, None).await.unwrap_err();
    assert!(matches!(err, Error::ReindexInProgress(_)));

    sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(&key)
        .execute(&mut *holder)
        .await
        .unwrap();
    drop(holder);

    db.vectors.reindex(&name, None).await.unwrap();

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection with migrations applied
async fn test_drop_collection() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("drop");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(CreateCollectionRequest::new(&name, 2))
        .await
        .unwrap();
    assert!(db
        .vectors
        .list_collections()
        .await
        .unwrap()
        .iter()
        .any(|c| c.name == name));

    db.vectors.drop_collection(&name).await.unwrap();
    assert!(db.vectors.get_collection(&name).await.unwrap().is_none());
    assert!(matches!(
        db.vectors.count(&name).await,
        Err(Error::UnknownCollection(_))
    ));
    assert!(matches!(
        db.vectors.drop_collection(&name).await,
        Err(Error::UnknownCollection(_))
    ));

    test_db.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database connection with migrations applied
async fn test_reindex_keeps_rows_counted_during_rebuild() {
    let mut test_db = TestDatabase::new().await;
    let name = test_db.collection_name("rebuild_count");
    let db = test_db.db.clone();

    db.vectors
        .create_collection(
            CreateCollectionRequest::new(&name, 2)
                .with_index(IndexType::Graph, IndexConfig::default()),
        )
        .await
        .unwrap();
    for i in 0..200 {
        db.vectors
            .upsert(&name, &format!("v{}", i), &[i as f32, 1.0], json!({}))
            .await
            .unwrap();
    }

    let writer = {
        let db = db.clone();
        let name = name.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                db.vectors
                    .upsert(&name, &format!("late{}", i), &[i as f32, 2.0], json!({}))
                    .await
                    .unwrap();
            }
        })
    };
    db.vectors.reindex(&name, None).await.unwrap();
    writer.await.unwrap();

    let meta = db.vectors.get_collection(&name).await.unwrap().unwrap();
    assert_eq!(meta.row_count, 250);
    assert_eq!(meta.row_count, db.vectors.count(&name).await.unwrap());
    let snapshot = meta.reindex_row_count.unwrap();
    assert!((200..=250).contains(&snapshot));

    test_db.cleanup().await;
}
