use crate::helpers::{broker_name, eventually};
use carrot_harness::broker::{Destination, Message};
use carrot_harness::harness::{Harness, HarnessError, HarnessSettings};
use carrot_harness::listener::{ClosureListener, ListenerConfig, ListenerEndpoint};
use carrot_harness::readiness::ReadinessError;
use shutdown_handler::ShutdownHandler;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn settings(name: &str) -> HarnessSettings {
    let yaml = format!(
        r#"
embedded_broker:
  name: {name}
connection_factory:
  address: vm://{name}?create=false
  session_cache_size: 10
readiness:
  max_attempts: 3
  delay_between_attempts_ms: 100
dispatch:
  default_destination: orders
  delivery:
    priority: 6
listener:
  concurrency: 1-4
  transacted: true
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn a_harness_sends_and_receives_through_its_embedded_broker() {
    // Arrange
    let name = broker_name();
    let received = Arc::new(Mutex::new(Vec::new()));
    let listener = ClosureListener({
        let received = received.clone();
        move |message: Message| {
            let received = received.clone();
            async move {
                received.lock().unwrap().push(message);
                Ok::<_, anyhow::Error>(())
            }
        }
    });
    let harness = Harness::builder(settings(&name))
        .listener(ListenerEndpoint::new(Destination::queue("orders"), listener))
        .start()
        .await
        .unwrap();

    // Act
    harness.dispatch_template().send_default("hello").await.unwrap();

    // Assert
    eventually(|| received.lock().unwrap().len() == 1).await;
    let message = received.lock().unwrap()[0].clone();
    assert_eq!("hello", message.text());
    assert_eq!(6, message.properties.priority);
    assert_eq!(1, harness.containers().len());
    assert!(harness.containers()[0].is_running());
    assert_eq!(10, harness.connection_factory().status().capacity);
}

#[tokio::test]
async fn shutdown_stops_containers_then_the_factory_then_the_broker() {
    // Arrange
    let name = broker_name();
    let listener = ClosureListener(|_message: Message| async move { Ok::<_, anyhow::Error>(()) });
    let harness = Harness::builder(settings(&name))
        .listener(ListenerEndpoint::new(Destination::queue("orders"), listener))
        .start()
        .await
        .unwrap();
    let registry = harness.broker_registry().clone();
    let factory = harness.connection_factory().clone();

    // Act
    harness.shutdown().await.unwrap();

    // Assert
    assert!(factory.is_closed());
    assert!(registry.lookup(&name).is_none());
}

#[tokio::test]
async fn containers_without_auto_startup_wait_to_be_started() {
    // Arrange
    let name = broker_name();
    let listener = ClosureListener(|_message: Message| async move { Ok::<_, anyhow::Error>(()) });

    // Act
    let harness = Harness::builder(settings(&name))
        .listener_with_config(
            ListenerEndpoint::new(Destination::queue("manual"), listener),
            ListenerConfig::default().auto_startup(false),
        )
        .start()
        .await
        .unwrap();

    // Assert
    let container = &harness.containers()[0];
    assert!(!container.is_running());
    container.start();
    assert!(container.is_running());
    harness.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_fails_if_the_broker_never_shows_up() {
    // Arrange
    let mut settings = settings(&broker_name());
    settings.embedded_broker = None;

    // Act
    let outcome = Harness::builder(settings).start().await;

    // Assert
    assert!(matches!(
        outcome,
        Err(HarnessError::Readiness(ReadinessError::BrokerUnreachable { attempts: 3, .. }))
    ));
}

#[tokio::test]
async fn run_until_shutdown_tears_the_harness_down() {
    // Arrange
    let name = broker_name();
    let harness = Harness::builder(settings(&name)).start().await.unwrap();
    let registry = harness.broker_registry().clone();

    // Act
    harness
        .run_until_shutdown(tokio::time::sleep(Duration::from_millis(10)))
        .await
        .unwrap();

    // Assert
    assert!(registry.lookup(&name).is_none());
}

#[tokio::test]
async fn a_shutdown_signal_tears_the_harness_down() {
    // Arrange
    let name = broker_name();
    let harness = Harness::builder(settings(&name)).start().await.unwrap();
    let registry = harness.broker_registry().clone();
    let factory = harness.connection_factory().clone();
    let shutdown = Arc::new(ShutdownHandler::new());
    let running = tokio::spawn(harness.run_until_signal(shutdown.clone()));

    // Act
    shutdown.shutdown();

    // Assert
    running.await.unwrap().unwrap();
    assert!(factory.is_closed());
    assert!(registry.lookup(&name).is_none());
}

#[tokio::test]
async fn persistent_embedded_brokers_are_a_configuration_error() {
    // Arrange
    let settings: HarnessSettings = serde_yaml::from_str(
        "connection_factory:\n  address: vm://durable?broker.persistent=true\n",
    )
    .unwrap();

    // Act
    let outcome = Harness::builder(settings).start().await;

    // Assert
    assert!(matches!(outcome, Err(HarnessError::Configuration(_))));
}
