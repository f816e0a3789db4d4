use std::sync::Arc;
use std::time::Duration;

use redirection_core::{ConnectionParameters, EndpointId};
use redirection_server::channel::mock::{ScriptedChannel, ScriptedConnector};
use redirection_server::{RedirectionError, RedirectionService, ServiceConfig, StaticDirectory};

const CONTENDERS: usize = 16;

#[test_timeout::tokio_timeout_test(secs = 30, worker_threads = 4)]
async fn racing_opens_admit_exactly_one_session() {
    let directory = StaticDirectory::from_entries([(
        "dev-1".into(),
        ConnectionParameters::new("10.0.0.5", "admin", "P@ssw0rd"),
    )]);
    // A slow connect keeps every contender past the early lookup.
    let connector = Arc::new(ScriptedConnector::new(|_| {
        ScriptedChannel::accepting().with_connect_delay(Duration::from_millis(50))
    }));
    let service = RedirectionService::new(
        Arc::new(directory),
        connector.clone(),
        ServiceConfig::default(),
    );
    let dev1: EndpointId = "dev-1".into();

    let barrier = Arc::new(tokio::sync::Barrier::new(CONTENDERS));
    let attempts: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let service = service.clone();
            let barrier = Arc::clone(&barrier);
            let dev1 = dev1.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.open(&dev1).await
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut already_active = 0usize;
    for attempt in attempts {
        match attempt.await.expect("open task") {
            Ok(handle) => winners.push(handle),
            Err(RedirectionError::AlreadyActive(id)) => {
                assert_eq!(id, dev1);
                already_active += 1;
            }
            Err(other) => panic!("unexpected open failure: {other}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(already_active, CONTENDERS - 1);
    assert_eq!(service.registry().len(), 1);

    // Every losing channel was torn down; the winner's stays open.
    let open_channels: Vec<_> = connector
        .issued()
        .into_iter()
        .filter(|channel| channel.close_calls() == 0)
        .collect();
    assert_eq!(open_channels.len(), 1);
    assert!(connector
        .issued()
        .iter()
        .all(|channel| channel.close_calls() <= 1));

    service.close(&dev1).await;
    assert!(connector
        .issued()
        .iter()
        .all(|channel| channel.close_calls() == 1));
}

#[test_timeout::tokio_timeout_test(secs = 30, worker_threads = 4)]
async fn different_endpoints_open_concurrently() {
    let ids: Vec<EndpointId> = (0..8).map(|n| EndpointId::new(format!("dev-{n}"))).collect();
    let directory = StaticDirectory::from_entries(ids.iter().enumerate().map(|(n, id)| {
        (
            id.clone(),
            ConnectionParameters::new(format!("10.0.1.{n}"), "admin", "pw"),
        )
    }));
    let connector = Arc::new(ScriptedConnector::new(|_| {
        ScriptedChannel::accepting().with_connect_delay(Duration::from_millis(20))
    }));
    let service = RedirectionService::new(
        Arc::new(directory),
        connector.clone(),
        ServiceConfig::default(),
    );

    let attempts: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let service = service.clone();
            tokio::spawn(async move { service.open(&id).await })
        })
        .collect();
    for attempt in attempts {
        attempt.await.expect("open task").expect("open succeeds");
    }

    assert_eq!(service.registry().len(), ids.len());
    assert_eq!(service.close_all().await, ids.len());
}
