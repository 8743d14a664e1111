use crate::helpers::{broker_name, get_connection_factory, ScriptedTransport};
use carrot_harness::broker::{BrokerRegistry, EmbeddedBrokerSettings};
use futures_util::future::join_all;
use std::time::Duration;

#[tokio::test]
async fn sessions_are_reused_up_to_the_cache_size() {
    // Arrange
    let transport = ScriptedTransport::healthy();
    let factory = transport.factory(10);

    // Act
    let mut sessions = Vec::new();
    for _ in 0..10 {
        sessions.push(factory.session().await.unwrap());
    }
    drop(sessions);
    let mut sessions = Vec::new();
    for _ in 0..10 {
        sessions.push(factory.session().await.unwrap());
    }
    drop(sessions);

    // Assert
    let status = factory.status();
    assert_eq!(10, status.sessions_opened);
    assert_eq!(10, status.cached);
    assert_eq!(1, status.connections_opened);
    assert_eq!(1, transport.counters.connects());
}

#[tokio::test]
async fn releasing_into_a_full_cache_discards_the_session() {
    // Arrange
    let transport = ScriptedTransport::healthy();
    let factory = transport.factory(10);

    // Act
    let mut sessions = Vec::new();
    for _ in 0..15 {
        sessions.push(factory.session().await.unwrap());
    }
    drop(sessions);

    // Assert
    let status = factory.status();
    assert_eq!(15, status.sessions_opened);
    assert_eq!(10, status.cached);
    assert_eq!(1, transport.counters.connects());
}

#[tokio::test]
async fn concurrent_acquisitions_beyond_the_cache_size_never_block() {
    // Arrange
    let transport = ScriptedTransport::healthy();
    let factory = transport.factory(10);

    // Act
    let tasks = (0..15).map(|_| {
        let factory = factory.clone();
        tokio::spawn(async move {
            let session = factory.session().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(session);
            Ok::<_, carrot_harness::TransportError>(())
        })
    });
    let outcomes = tokio::time::timeout(Duration::from_secs(5), join_all(tasks))
        .await
        .expect("Session acquisition blocked");

    // Assert
    for outcome in outcomes {
        outcome.unwrap().unwrap();
    }
    let status = factory.status();
    assert!(status.cached <= 10);
    assert_eq!(1, status.connections_opened);
}

#[tokio::test]
async fn a_broken_connection_is_replaced_on_the_next_acquisition() {
    // Arrange
    let registry = BrokerRegistry::new();
    let name = broker_name();
    let broker = registry
        .start_broker(&EmbeddedBrokerSettings::new(name.as_str()))
        .unwrap();
    let factory = get_connection_factory(&format!("vm://{name}?create=false"), &registry);
    drop(factory.session().await.unwrap());

    // Act
    broker.stop();
    assert!(factory.session().await.is_err());
    registry
        .start_broker(&EmbeddedBrokerSettings::new(name.as_str()))
        .unwrap();
    let session = factory.session().await.unwrap();

    // Assert
    assert!(session.is_open());
    assert_eq!(2, factory.status().connections_opened);
}

#[tokio::test]
async fn a_closed_factory_hands_out_nothing() {
    // Arrange
    let transport = ScriptedTransport::healthy();
    let factory = transport.factory(1);
    drop(factory.session().await.unwrap());

    // Act
    factory.close().await.unwrap();

    // Assert
    assert!(factory.is_closed());
    assert!(factory.session().await.is_err());
    assert!(factory.create_connection().await.is_err());
    assert_eq!(0, factory.status().cached);
    assert_eq!(1, transport.counters.closes());
}

#[tokio::test]
async fn a_shared_connection_that_fails_to_start_is_closed() {
    // Arrange
    let transport = ScriptedTransport::never_starting();
    let factory = transport.factory(1);

    // Act
    let outcome = factory.session().await;

    // Assert
    assert!(outcome.is_err());
    assert_eq!(1, transport.counters.connects());
    assert_eq!(1, transport.counters.closes());
    assert_eq!(0, factory.status().connections_opened);
    assert_eq!(0, transport.counters.sessions());
}
