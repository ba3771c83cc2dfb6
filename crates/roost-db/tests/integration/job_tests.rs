use chrono::Utc;
use roost_core::error::ErrorKind;
use roost_core::job::{JobError, JobStatus, NewScrapeJob, Priority, SearchCriteria};
use roost_core::models::Source;
use roost_core::testutil::make_test_job;
use roost_core::traits::JobStore;
use roost_db::PgJobRepository;

use crate::common::setup_test_db;

#[tokio::test]
#[ignore = "requires Docker"]
async fn save_and_get_round_trips_the_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgJobRepository::new(pool);

    let criteria = SearchCriteria {
        city: Some("Mesa".into()),
        min_beds: Some(3),
        ..Default::default()
    };
    let job = NewScrapeJob::search(Source::Redfin, criteria)
        .with_priority(Priority::High)
        .with_owner("user-42")
        .into_job(Utc::now(), 3, None);

    repo.save_job(&job).await.unwrap();
    let loaded = repo.get_job(job.id).await.unwrap().expect("job should exist");

    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.target, job.target);
    assert_eq!(loaded.priority, Priority::High);
    assert_eq!(loaded.owner_id.as_deref(), Some("user-42"));
    assert_eq!(loaded.status, JobStatus::Pending);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn save_overwrites_previous_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgJobRepository::new(pool);

    let mut job = make_test_job(Source::Zillow, "https://www.zillow.com/homedetails/1_zpid/");
    repo.save_job(&job).await.unwrap();

    job.status = JobStatus::DeadLettered;
    job.attempts = 3;
    job.errors.push(JobError {
        message: "HTTP 403".into(),
        timestamp: Utc::now(),
        kind: ErrorKind::Blocked,
    });
    repo.save_job(&job).await.unwrap();

    let loaded = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::DeadLettered);
    assert_eq!(loaded.attempts, 3);
    assert_eq!(loaded.errors.len(), 1);
    assert_eq!(loaded.errors[0].kind, ErrorKind::Blocked);
    assert_eq!(repo.count_by_status(JobStatus::DeadLettered).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn list_unfinished_skips_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgJobRepository::new(pool);

    let pending = make_test_job(Source::Redfin, "https://www.redfin.com/home/1");
    let mut processing = make_test_job(Source::Redfin, "https://www.redfin.com/home/2");
    processing.status = JobStatus::Processing;
    processing.attempts = 1;
    let mut done = make_test_job(Source::Redfin, "https://www.redfin.com/home/3");
    done.status = JobStatus::Completed;

    for job in [&pending, &processing, &done] {
        repo.save_job(job).await.unwrap();
    }

    let unfinished = repo.list_unfinished().await.unwrap();
    let ids: Vec<_> = unfinished.iter().map(|j| j.id).collect();
    assert_eq!(unfinished.len(), 2);
    assert!(ids.contains(&pending.id));
    assert!(ids.contains(&processing.id));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn list_jobs_filters_by_source_and_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgJobRepository::new(pool);

    repo.save_job(&make_test_job(Source::Zillow, "https://www.zillow.com/a"))
        .await
        .unwrap();
    repo.save_job(&make_test_job(Source::HomesCom, "https://www.homes.com/a"))
        .await
        .unwrap();
    let mut cancelled = make_test_job(Source::HomesCom, "https://www.homes.com/b");
    cancelled.status = JobStatus::Cancelled;
    repo.save_job(&cancelled).await.unwrap();

    assert_eq!(repo.list_jobs(None, None, 10).await.unwrap().len(), 3);
    assert_eq!(
        repo.list_jobs(Some(Source::HomesCom), None, 10)
            .await
            .unwrap()
            .len(),
        2
    );
    let filtered = repo
        .list_jobs(Some(Source::HomesCom), Some(JobStatus::Cancelled), 10)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, cancelled.id);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn missing_job_is_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgJobRepository::new(pool);
    assert!(repo.get_job(uuid::Uuid::new_v4()).await.unwrap().is_none());
}
