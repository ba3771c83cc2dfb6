use chrono::{Duration, Utc};
use roost_core::merge::{AddressKey, merge};
use roost_core::models::Source;
use roost_core::normalize::Normalizer;
use roost_core::testutil::make_raw_listing;
use roost_core::traits::PropertyStore;
use roost_db::PgPropertyRepository;

use crate::common::setup_test_db;

fn property(address: &str, price: f64, mls: Option<&str>) -> roost_core::NormalizedProperty {
    let mut raw = make_raw_listing(Source::Zillow, address, "85004", price);
    raw.mls_number = mls.map(str::to_string);
    Normalizer::default().normalize(&raw).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn upsert_then_lookup_by_every_key() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let p = property("100 Main Street", 350_000.0, Some("6543210"));
    repo.upsert(&p).await.unwrap();

    let by_id = repo.get(p.id).await.unwrap().expect("stored by id");
    assert_eq!(by_id.price, 350_000);
    assert_eq!(by_id.address, p.address);

    let by_mls = repo.find_by_mls("6543210").await.unwrap().expect("found by MLS");
    assert_eq!(by_mls.id, p.id);

    let key = AddressKey::of(&p.address);
    let by_address = repo.find_by_address(&key).await.unwrap().expect("found by address");
    assert_eq!(by_address.id, p.id);

    assert!(repo.find_by_mls("0000000").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn upsert_replaces_merged_record() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let first = property("200 Oak Ave", 400_000.0, None);
    repo.upsert(&first).await.unwrap();

    let mut raw = make_raw_listing(Source::Redfin, "200 Oak Ave", "85004", 410_000.0);
    raw.scraped_at = Utc::now() + Duration::seconds(5);
    let incoming = Normalizer::default().normalize(&raw).unwrap();
    let merged = merge(Some(&first), &incoming, Source::Redfin, raw.scraped_at);
    repo.upsert(&merged).await.unwrap();

    assert_eq!(repo.count().await.unwrap(), 1);
    let stored = repo.get(first.id).await.unwrap().unwrap();
    assert_eq!(stored.price, 410_000);
    assert!(stored.data_sources.contains(&Source::Zillow));
    assert!(stored.data_sources.contains(&Source::Redfin));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn list_returns_most_recent_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgPropertyRepository::new(pool);

    let mut older = property("1 Elm St", 300_000.0, None);
    older.last_scraped_at = Utc::now() - Duration::hours(2);
    let newer = property("2 Elm St", 310_000.0, None);
    repo.upsert(&older).await.unwrap();
    repo.upsert(&newer).await.unwrap();

    let listed = repo.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, newer.id);
    assert_eq!(repo.list(1).await.unwrap().len(), 1);
}
