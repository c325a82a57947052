//! End-to-end: launch request → reservation → background write against an
//! in-memory jobs table whose rows appear late (or never).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use jobreserve_core::{JobDescription, ReservationQuantity};
use jobreserve_infra::reservations::{CoordinatorStats, InMemoryJobRows};
use jobreserve_infra::{ReservationConfig, ReservationService};

const LAUNCH_JSON: &str = r#"
{
    "uuid": "c654e8bb-d535-4f7a-bd0f-aff0f0c189b1",
    "username": "ipcdev",
    "name": "Word Count",
    "steps": [
        { "component": { "container": { "max_cpu_cores": 2.0 } } },
        { "component": { "container": {} } }
    ]
}
"#;

fn launch() -> JobDescription {
    serde_json::from_str(LAUNCH_JSON).unwrap()
}

async fn wait_until_completed(service: &ReservationService, n: u64) -> CoordinatorStats {
    loop {
        let stats = service.stats().await.unwrap();
        if stats.completed() >= n {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn reservation_lands_once_the_job_row_appears() {
    let config = ReservationConfig::from_lookup(|key| match key {
        "JOBRESERVE_LOG_LEVEL" => Some("jobreserve_infra=debug".to_string()),
        _ => None,
    })
    .unwrap();
    jobreserve_observability::init_with_level(&config.log_level);

    let rows = InMemoryJobRows::arc();
    let (service, handle) = ReservationService::from_config(&config, rows.clone()).unwrap();

    let job = launch();
    let job_id = rows.create_row();
    let start = Instant::now();

    let (_task, quantity) = service.reserve(&job).unwrap();
    assert_eq!(quantity, "6000".parse::<ReservationQuantity>().unwrap());

    // Launch tracking records the job five seconds after submission.
    let linker = {
        let rows = Arc::clone(&rows);
        let external_id = job.invocation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            rows.link(external_id, job_id);
        })
    };

    let stats = wait_until_completed(&service, 1).await;
    linker.await.unwrap();

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(rows.millicores_reserved(job_id), Some(6000));
    assert_eq!(rows.updates(), vec![(job_id, 6000)]);
    // Lookups at 0s, 2s, 4s and 6s; the fourth finds the row.
    assert_eq!(rows.lookup_count(), 4);
    assert!(start.elapsed() >= Duration::from_secs(6));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_job_times_out_without_writing() {
    let rows = InMemoryJobRows::arc();
    let (service, handle) =
        ReservationService::from_config(&ReservationConfig::default(), rows.clone()).unwrap();
    let start = Instant::now();

    service.reserve(&launch()).unwrap();

    let stats = wait_until_completed(&service, 1).await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.resolution_timeouts, 1);
    assert_eq!(rows.lookup_count(), 30);
    assert!(rows.updates().is_empty());
    assert!(start.elapsed() >= Duration::from_secs(58));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_jobs_resolve_independently() {
    let rows = InMemoryJobRows::arc();
    let config = ReservationConfig::default().with_resolve_policy(5, Duration::from_secs(1));
    let (service, handle) = ReservationService::from_config(&config, rows.clone()).unwrap();

    let ready = rows.insert_job("ready");
    let gone = rows.insert_job("gone");
    rows.delete_row(gone);

    for (id, cores) in [("ready", 1.5), ("gone", 3.0), ("missing", 0.0)] {
        let job = JobDescription::new(id)
            .with_step(jobreserve_core::Step::with_max_cpu_cores(cores));
        service.reserve(&job).unwrap();
    }

    let stats = wait_until_completed(&service, 3).await;

    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.zero_row_updates, 1);
    assert_eq!(stats.resolution_timeouts, 1);
    assert_eq!(rows.millicores_reserved(ready), Some(1500));
    assert_eq!(rows.millicores_reserved(gone), None);

    handle.shutdown().await;
}
