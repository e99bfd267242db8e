//! Store tests against a live database.
//! Set `DATABASE_URL` to run them; each test migrates its own schema.

use catalog_types::horoshop::{MirrorRow, Presence, PreviewRow};
use catalog_types::job::repository::JobRepository;
use catalog_types::job::{JobStatus, JobType, LogFilter, LogLevel, NewJob, NewLogEntry, GLOBAL_LOCK};
use catalog_types::product::repository::{
    FinalPriceRepository, PriceOverrideRepository, RawProductRepository,
};
use catalog_types::product::{NewPriceOverride, OverrideSearch, ProductKey, RawProduct};
use catalog_types::supplier::NewSupplier;
use horoshop_sync::catalog::{
    is_unique_violation, PostgresFinalPriceRepository, PostgresPriceOverrideRepository,
    PostgresRawProductRepository, PostgresSupplierRepository,
};
use horoshop_sync::cleanup::{PostgresRetention, Retention};
use horoshop_sync::export::{PostgresPreviewStore, PreviewSearch, PreviewStore};
use horoshop_sync::finalize::{FinalCatalogStore, PostgresFinalCatalogStore};
use horoshop_sync::horoshop_sync::{MirrorStore, PostgresMirrorStore};
use horoshop_sync::job::{PostgresJobRepository, PostgresLogRepository};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use typesafe_repository::async_ops::{Create, Find, Get, Select};

struct Db {
    client: Arc<Client>,
    tx_client: Arc<Mutex<Client>>,
}

async fn connect(config: &tokio_postgres::Config) -> Client {
    let (client, connection) = config
        .connect(tokio_postgres::NoTls)
        .await
        .expect("connect to DATABASE_URL");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Fresh migrated schema named after the test, `None` without `DATABASE_URL`
async fn db(name: &str) -> Option<Db> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping {name}");
        return None;
    };
    let config: tokio_postgres::Config = url.parse().expect("valid DATABASE_URL");
    let schema = format!("horoshop_sync_{name}_{}", std::process::id());
    connect(&config)
        .await
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}"
        ))
        .await
        .expect("schema");
    let mut scoped = config.clone();
    scoped.options(&format!("-c search_path={schema}"));
    let mut client = connect(&scoped).await;
    horoshop_sync::migrations::runner()
        .run_async(&mut client)
        .await
        .expect("migrations");
    Some(Db {
        client: Arc::new(client),
        tx_client: Arc::new(Mutex::new(connect(&scoped).await)),
    })
}

fn preview(article: &str, price: Option<Decimal>) -> PreviewRow {
    PreviewRow {
        article: article.to_string(),
        supplier: "Drop".to_string(),
        presence_ua: if price.is_some() {
            Presence::InStock
        } else {
            Presence::OutOfStock
        },
        display_in_showcase: price.is_some(),
        parent_article: String::new(),
        price,
    }
}

fn mirror(article: &str, supplier: &str, price: Decimal) -> MirrorRow {
    MirrorRow {
        article: article.to_string(),
        supplier: Some(supplier.to_string()),
        presence_ua: Some("В наявності".to_string()),
        display_in_showcase: Some(true),
        parent_article: None,
        price: Some(price),
        raw: Some(json!({"article": article})),
    }
}

fn raw(job_id: i64, supplier_id: i64, article: &str, size: Option<&str>, price: Decimal) -> RawProduct {
    RawProduct {
        job_id,
        supplier_id,
        source_id: None,
        article: article.to_string(),
        size: size.map(str::to_string),
        quantity: 1,
        price,
        extra: String::new(),
        row_data: json!([article]),
    }
}

fn supplier(name: &str, priority: i32, markup: Decimal) -> NewSupplier {
    NewSupplier {
        name: name.to_string(),
        markup_percent: markup,
        priority: Some(priority),
        min_profit_enabled: Some(false),
        min_profit_amount: None,
    }
}

async fn final_price(client: &Client, article: &str) -> Decimal {
    client
        .query_one(
            "SELECT price_final FROM products_final WHERE article = $1",
            &[&article],
        )
        .await
        .expect("price")
        .get("price_final")
}

#[tokio::test]
async fn preview_replace_stores_rows_in_order() {
    let Some(db) = db("preview").await else {
        return;
    };
    let store = PostgresPreviewStore::new(db.client.clone(), db.tx_client.clone());

    store
        .replace(
            4,
            &[
                preview("B-1", Some(dec!(1100))),
                preview("A-1", None),
                preview("C-1", Some(dec!(20.5))),
            ],
        )
        .await
        .expect("replace");
    let rows = store.page_after(0, 10).await.expect("page");
    assert_eq!(
        vec!["B-1", "A-1", "C-1"],
        rows.iter().map(|r| r.row.article.as_str()).collect::<Vec<_>>()
    );
    assert_eq!(vec![1, 2, 3], rows.iter().map(|r| r.id).collect::<Vec<_>>());
    assert!(rows.iter().all(|r| r.job_id == 4));
    assert_eq!(preview("A-1", None), rows[1].row);
    assert_eq!(Some(dec!(20.5)), rows[2].row.price);
    assert_eq!(1, store.page_after(2, 10).await.expect("page").len());

    let page = store
        .search(&PreviewSearch {
            search: Some("a-".to_string()),
            supplier: Some(" drop ".to_string()),
            limit: 10,
            offset: 0,
        })
        .await
        .expect("search");
    assert_eq!(1, page.total);
    assert_eq!("A-1", page.rows[0].row.article);

    store
        .replace(5, &[preview("D-1", Some(dec!(10)))])
        .await
        .expect("replace");
    let rows = store.page_after(0, 10).await.expect("page");
    assert_eq!(1, rows.len());
    assert_eq!(1, rows[0].id);
    assert_eq!(5, rows[0].job_id);

    store.replace(6, &[]).await.expect("replace");
    assert!(store.page_after(0, 10).await.expect("page").is_empty());
}

#[tokio::test]
async fn mirror_upsert_refreshes_and_evicts_unseen() {
    let Some(db) = db("mirror").await else {
        return;
    };
    let store = PostgresMirrorStore::new(db.client.clone());
    let first = datetime!(2024-05-01 10:00 UTC);
    let second = datetime!(2024-05-02 10:00 UTC);

    let written = store
        .upsert(
            &[
                mirror("A", "Drop", dec!(100)),
                mirror("B", "Drop", dec!(200)),
                mirror("A", "Drop", dec!(150)),
                mirror("W", "warehouse", dec!(5)),
            ],
            first,
        )
        .await
        .expect("upsert");
    assert_eq!(3, written);
    assert_eq!(0, store.evict_unseen(first).await.expect("evict"));

    store
        .upsert(&[mirror("A", "Drop", dec!(175)), mirror("W", "warehouse", dec!(5))], second)
        .await
        .expect("upsert");
    assert_eq!(1, store.evict_unseen(second).await.expect("evict"));

    let rows = store.supplier_rows(" DROP ").await.expect("rows");
    assert_eq!(1, rows.len());
    assert_eq!("A", rows[0].article);
    assert_eq!(Some(dec!(175)), rows[0].price);
    assert_eq!(Some(true), rows[0].display_in_showcase);
}

#[tokio::test]
async fn finalize_rebuild_replaces_catalog() {
    let Some(db) = db("finalize").await else {
        return;
    };
    let suppliers = PostgresSupplierRepository::new(db.client.clone());
    let preferred = suppliers
        .create(supplier("Preferred", 1, dec!(10)))
        .await
        .expect("supplier");
    let fallback = suppliers
        .create(supplier("Fallback", 2, dec!(0)))
        .await
        .expect("supplier");
    let err = suppliers
        .create(supplier("Fallback", 3, dec!(0)))
        .await
        .expect_err("duplicate");
    assert!(is_unique_violation(&err));

    let raw_rows = PostgresRawProductRepository::new(db.client.clone());
    raw_rows
        .add_batch(vec![raw(9, fallback, "OLD", None, dec!(1))])
        .await
        .expect("raw");
    let written = raw_rows
        .add_batch(vec![
            raw(1, fallback, "A", Some(""), dec!(100)),
            raw(1, preferred, "A", None, dec!(100)),
            raw(1, preferred, "B", Some("42"), dec!(200)),
            raw(1, fallback, "C", None, dec!(50)),
        ])
        .await
        .expect("raw");
    assert_eq!(4, written);

    PostgresPriceOverrideRepository::new(db.client.clone())
        .create(NewPriceOverride {
            article: "C".to_string(),
            size: None,
            price_final: dec!(777),
            notes: None,
        })
        .await
        .expect("override");

    let store = PostgresFinalCatalogStore::new(db.tx_client.clone());
    let old = store.rebuild(10, 9).await.expect("rebuild");
    assert_eq!(1, old.final_count);
    let summary = store.rebuild(11, 1).await.expect("rebuild");
    assert_eq!(4, summary.raw_count);
    assert_eq!(3, summary.final_count);

    let rows = db
        .client
        .query(
            "SELECT job_id, article, size, price_final, supplier_id FROM products_final ORDER BY article",
            &[],
        )
        .await
        .expect("final rows");
    let rows = rows
        .iter()
        .map(|r| {
            (
                r.get::<_, i64>("job_id"),
                r.get::<_, String>("article"),
                r.get::<_, Option<String>>("size"),
                r.get::<_, Decimal>("price_final"),
                r.get::<_, i64>("supplier_id"),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        vec![
            (11, "A".to_string(), None, dec!(110), preferred),
            (11, "B".to_string(), Some("42".to_string()), dec!(220), preferred),
            (11, "C".to_string(), None, dec!(777), fallback),
        ],
        rows
    );
}

#[tokio::test]
async fn override_upsert_and_live_price() {
    let Some(db) = db("overrides").await else {
        return;
    };
    let supplier_id = PostgresSupplierRepository::new(db.client.clone())
        .create(supplier("Drop", 1, dec!(10)))
        .await
        .expect("supplier");
    PostgresRawProductRepository::new(db.client.clone())
        .add_batch(vec![raw(1, supplier_id, "A", Some("42"), dec!(100))])
        .await
        .expect("raw");
    PostgresFinalCatalogStore::new(db.tx_client.clone())
        .rebuild(2, 1)
        .await
        .expect("rebuild");

    let overrides = PostgresPriceOverrideRepository::new(db.client.clone());
    let first = overrides
        .create(NewPriceOverride {
            article: "A".to_string(),
            size: Some("42".to_string()),
            price_final: dec!(990),
            notes: None,
        })
        .await
        .expect("create");
    let second = overrides
        .create(NewPriceOverride {
            article: " A ".to_string(),
            size: Some("42".to_string()),
            price_final: dec!(1200),
            notes: Some("sale".to_string()),
        })
        .await
        .expect("upsert");
    assert_eq!(first, second);
    let stored = overrides.get_one(&first).await.expect("get").expect("override");
    assert_eq!(dec!(1200), stored.price_final);
    assert_eq!(Some("sale".to_string()), stored.notes);
    assert!(stored.is_active);

    let key = ProductKey::new("A", Some("42".to_string()));
    let found = overrides.find(&key).await.expect("find").expect("override");
    assert_eq!(first, found.id);
    assert!(overrides
        .find(&ProductKey::new("A", None))
        .await
        .expect("find")
        .is_none());

    let page = overrides
        .search(&OverrideSearch {
            search: Some("sal".to_string()),
            limit: 10,
            offset: 0,
        })
        .await
        .expect("search");
    assert_eq!(1, page.total);

    let prices = PostgresFinalPriceRepository::new(db.client.clone());
    assert_eq!(1, prices.set_price(&key, dec!(1200)).await.expect("set"));
    assert_eq!(dec!(1200), final_price(&db.client, "A").await);
    assert_eq!(1, prices.recompute_price(&key).await.expect("recompute"));
    assert_eq!(dec!(110), final_price(&db.client, "A").await);
}

#[tokio::test]
async fn job_lock_status_and_timeout() {
    let Some(db) = db("jobs").await else {
        return;
    };
    let jobs = PostgresJobRepository::new(db.client.clone());
    let first = jobs.create(NewJob::new(JobType::ImportAll)).await.expect("create");
    let second = jobs.create(NewJob::new(JobType::Finalize)).await.expect("create");
    assert_eq!(
        JobStatus::Queued,
        jobs.get_one(&first).await.expect("get").expect("job").status
    );

    jobs.start(&first).await.expect("start");
    assert!(jobs.acquire_lock(GLOBAL_LOCK, &first).await.expect("lock"));
    assert!(!jobs.acquire_lock(GLOBAL_LOCK, &second).await.expect("lock"));
    jobs.release_lock(GLOBAL_LOCK, &second).await.expect("release");
    assert!(!jobs.acquire_lock(GLOBAL_LOCK, &second).await.expect("lock"));
    let running = jobs
        .find_running(&JobType::BLOCKING)
        .await
        .expect("running")
        .expect("job");
    assert_eq!(first, running.id);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let timed_out = jobs.timeout_stale(0).await.expect("sweep");
    assert_eq!(vec![first], timed_out.iter().map(|j| j.id).collect::<Vec<_>>());
    assert!(timed_out[0].is_timed_out());
    assert_eq!(Some("Job timed out after 0 minutes"), timed_out[0].error());
    assert!(jobs.acquire_lock(GLOBAL_LOCK, &second).await.expect("lock"));
    assert!(!jobs.finish(&first, json!({"result": 1})).await.expect("finish"));
    assert!(!jobs.fail(&first, "late").await.expect("fail"));
    assert_eq!(
        Some("Job timed out after 0 minutes"),
        jobs.get_one(&first).await.expect("get").expect("job").error()
    );

    jobs.start(&second).await.expect("start");
    assert!(jobs.cancel(&second, "operator").await.expect("cancel"));
    assert!(!jobs.fail(&second, "late").await.expect("fail"));
    let canceled = jobs.get_one(&second).await.expect("get").expect("job");
    assert_eq!(JobStatus::Canceled, canceled.status);
    assert_eq!(Some("operator"), canceled.error());
    assert!(jobs.acquire_lock(GLOBAL_LOCK, &first).await.expect("lock released"));

    let third = jobs.create(NewJob::new(JobType::Finalize)).await.expect("create");
    jobs.start(&third).await.expect("start");
    assert!(jobs.finish(&third, json!({"result": {"ok": true}})).await.expect("finish"));
    let latest = jobs
        .latest_successful(JobType::Finalize)
        .await
        .expect("latest")
        .expect("job");
    assert_eq!(third, latest.id);
    assert_eq!(json!(true), latest.meta["result"]["ok"]);
    assert_eq!(
        vec![third, second],
        jobs.list_recent(2)
            .await
            .expect("list")
            .iter()
            .map(|j| j.id)
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn logs_filter_and_retention() {
    let Some(db) = db("logs").await else {
        return;
    };
    let logs = PostgresLogRepository::new(db.client.clone());
    for (job_id, level, message) in [
        (Some(1), LogLevel::Info, "started"),
        (Some(1), LogLevel::Error, "failed"),
        (Some(2), LogLevel::Info, "other"),
    ] {
        logs.create(NewLogEntry {
            job_id,
            level,
            message: message.to_string(),
            data: json!({}),
        })
        .await
        .expect("log");
    }
    let entries = logs
        .select(&LogFilter {
            job_id: Some(1),
            level: None,
            limit: 10,
        })
        .await
        .expect("select");
    assert_eq!(
        vec!["failed", "started"],
        entries.iter().map(|e| e.message.as_str()).collect::<Vec<_>>()
    );
    let errors = logs
        .select(&LogFilter {
            job_id: None,
            level: Some(LogLevel::Error),
            limit: 10,
        })
        .await
        .expect("select");
    assert_eq!(1, errors.len());

    let jobs = PostgresJobRepository::new(db.client.clone());
    let running = jobs.create(NewJob::new(JobType::Export)).await.expect("job");
    jobs.start(&running).await.expect("start");
    let done = jobs.create(NewJob::new(JobType::Cleanup)).await.expect("job");
    jobs.start(&done).await.expect("start");
    jobs.finish(&done, json!({})).await.expect("finish");

    let retention = PostgresRetention::new(db.client.clone());
    let cutoff = OffsetDateTime::now_utc() + time::Duration::minutes(1);
    assert_eq!(3, retention.delete_logs_before(cutoff).await.expect("logs"));
    assert_eq!(1, retention.delete_jobs_before(cutoff).await.expect("jobs"));
    assert!(jobs.get_one(&running).await.expect("get").is_some());
}
