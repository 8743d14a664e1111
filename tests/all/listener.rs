use crate::helpers::{broker_name, eventually, get_connection_factory};
use carrot_harness::broker::{BrokerRegistry, Destination, EmbeddedBrokerSettings, Message};
use carrot_harness::dispatch::{DeliveryOptions, DispatchTemplate};
use carrot_harness::listener::{
    ClosureListener, ConcurrencyRange, ListenerConfig, ListenerContainerFactory, ListenerEndpoint,
    MessageListener,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// Records every message and fails the first `failures` deliveries.
#[derive(Default)]
struct Recorder {
    failures: AtomicUsize,
    received: Mutex<Vec<Message>>,
}

impl Recorder {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MessageListener for Recorder {
    async fn on_message(&self, message: Message) -> Result<(), anyhow::Error> {
        self.received.lock().unwrap().push(message);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("Simulated processing failure");
        }
        Ok(())
    }
}

fn setup(registry: &BrokerRegistry, address: &str) -> (ListenerContainerFactory, DispatchTemplate) {
    let factory = get_connection_factory(address, registry);
    let containers = ListenerContainerFactory::new(factory.clone(), ListenerConfig::default());
    (containers, DispatchTemplate::builder(factory).build())
}

#[tokio::test]
async fn a_fixed_range_pins_the_number_of_consumers() {
    // Arrange
    let registry = BrokerRegistry::new();
    let (containers, template) = setup(&registry, &format!("vm://{}", broker_name()));
    let destination = Destination::queue("fixed");
    let processed = Arc::new(AtomicUsize::new(0));
    let listener = ClosureListener({
        let processed = processed.clone();
        move |_message: Message| {
            let processed = processed.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                processed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }
    });
    let config = ListenerConfig::default().with_concurrency(ConcurrencyRange::fixed(3).unwrap());
    let container = containers.build(config, ListenerEndpoint::new(destination.clone(), listener));

    // Act
    container.start();
    for _ in 0..20 {
        template
            .send(&destination, "work", &DeliveryOptions::default())
            .await
            .unwrap();
    }

    // Assert
    eventually(|| processed.load(Ordering::SeqCst) == 20).await;
    assert!(container.is_running());
    assert_eq!(3, container.active_consumers());
    container.stop().await;
    assert!(!container.is_running());
    assert_eq!(0, container.active_consumers());
}

#[tokio::test]
async fn consumers_are_added_while_all_of_them_are_busy() {
    // Arrange
    let registry = BrokerRegistry::new();
    let (containers, template) = setup(&registry, &format!("vm://{}", broker_name()));
    let destination = Destination::queue("bursty");
    // Only released once four messages are being processed at the same time.
    let barrier = Arc::new(Barrier::new(4));
    let listener = ClosureListener({
        let barrier = barrier.clone();
        move |_message: Message| {
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
                Ok::<_, anyhow::Error>(())
            }
        }
    });
    let config = ListenerConfig::default().with_concurrency("4".parse().unwrap());
    let container = containers.build(config, ListenerEndpoint::new(destination.clone(), listener));
    container.start();
    assert_eq!(1, container.active_consumers());

    // Act
    for _ in 0..4 {
        template
            .send(&destination, "work", &DeliveryOptions::default())
            .await
            .unwrap();
    }

    // Assert
    eventually(|| container.active_consumers() == 4).await;
    tokio::time::timeout(Duration::from_secs(5), container.stop())
        .await
        .expect("The listeners never ran concurrently");
}

#[tokio::test]
async fn idle_consumers_above_the_minimum_are_stopped() {
    // Arrange
    let registry = BrokerRegistry::new();
    let (containers, template) = setup(&registry, &format!("vm://{}", broker_name()));
    let destination = Destination::queue("quiet");
    let listener = ClosureListener(|_message: Message| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, anyhow::Error>(())
    });
    let config = ListenerConfig::default()
        .with_concurrency("1-3".parse().unwrap())
        .with_idle_consumer_timeout(Duration::from_millis(200));
    let container = containers.build(config, ListenerEndpoint::new(destination.clone(), listener));
    container.start();

    // Act
    for _ in 0..10 {
        template
            .send(&destination, "work", &DeliveryOptions::default())
            .await
            .unwrap();
    }
    eventually(|| container.active_consumers() > 1).await;

    // Assert
    eventually(|| container.active_consumers() == 1).await;
    container.stop().await;
}

#[tokio::test]
async fn failed_messages_are_redelivered_in_transacted_mode() {
    // Arrange
    let registry = BrokerRegistry::new();
    let (containers, template) = setup(&registry, &format!("vm://{}", broker_name()));
    let destination = Destination::queue("transacted");
    let recorder = Recorder::failing(1);
    let config = ListenerConfig::default().transacted(true);
    let container = containers.build(
        config,
        ListenerEndpoint::with_dyn_listener(destination.clone(), recorder.clone()),
    );
    container.start();

    // Act
    template
        .send(&destination, "retry me", &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    eventually(|| recorder.received().len() == 2).await;
    let received = recorder.received();
    assert!(!received[0].redelivered);
    assert!(received[1].redelivered);
    assert_eq!(received[0].properties.message_id, received[1].properties.message_id);
    container.stop().await;
}

#[tokio::test]
async fn failed_messages_are_dropped_outside_of_transacted_mode() {
    // Arrange
    let registry = BrokerRegistry::new();
    let (containers, template) = setup(&registry, &format!("vm://{}", broker_name()));
    let destination = Destination::queue("fire-and-forget");
    let recorder = Recorder::failing(1);
    let container =
        containers.create_container(ListenerEndpoint::with_dyn_listener(destination.clone(), recorder.clone()));
    container.start();

    // Act
    template
        .send(&destination, "first", &DeliveryOptions::default())
        .await
        .unwrap();
    template
        .send(&destination, "second", &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    eventually(|| recorder.received().len() == 2).await;
    container.stop().await;
    let texts: Vec<_> = recorder
        .received()
        .iter()
        .map(|m| m.text().into_owned())
        .collect();
    assert_eq!(vec!["first", "second"], texts);
}

#[tokio::test]
async fn consumers_recover_once_the_broker_is_back() {
    // Arrange
    let registry = BrokerRegistry::new();
    let name = broker_name();
    let broker = registry
        .start_broker(&EmbeddedBrokerSettings::new(name.as_str()))
        .unwrap();
    let (containers, template) = setup(&registry, &format!("vm://{name}?create=false"));
    let destination = Destination::queue("resilient");
    let recorder = Recorder::failing(0);
    let config = ListenerConfig::default().with_recovery_interval(Duration::from_millis(50));
    let container = containers.build(
        config,
        ListenerEndpoint::with_dyn_listener(destination.clone(), recorder.clone()),
    );
    container.start();
    template
        .send(&destination, "before", &DeliveryOptions::default())
        .await
        .unwrap();
    eventually(|| recorder.received().len() == 1).await;

    // Act
    broker.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry
        .start_broker(&EmbeddedBrokerSettings::new(name.as_str()))
        .unwrap();
    template
        .send(&destination, "after", &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    eventually(|| recorder.received().len() == 2).await;
    assert_eq!("after", recorder.received()[1].text());
    assert_eq!(1, container.active_consumers());
    container.stop().await;
}

#[tokio::test]
async fn listeners_see_the_factory_type_policy() {
    // Arrange
    let registry = BrokerRegistry::new();
    let address = format!("vm://{}", broker_name());
    let factory = carrot_harness::broker::ConnectionFactory::builder(
        crate::helpers::in_process_config(&address).trust_all_serialized_types(true),
    )
    .broker_registry(registry.clone())
    .build()
    .unwrap();
    let containers = ListenerContainerFactory::new(factory.clone(), ListenerConfig::default());
    let template = DispatchTemplate::builder(factory).build();
    let destination = Destination::queue("typed");
    let recorder = Recorder::failing(0);
    let container =
        containers.create_container(ListenerEndpoint::with_dyn_listener(destination.clone(), recorder.clone()));
    container.start();

    // Act
    template
        .send_json(&destination, &vec![1, 2, 3], &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    eventually(|| recorder.received().len() == 1).await;
    assert_eq!(vec![1, 2, 3], recorder.received()[0].json::<Vec<i32>>().unwrap());
    container.stop().await;
}
