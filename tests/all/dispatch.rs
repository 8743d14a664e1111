use crate::helpers::{broker_name, get_connection_factory, in_process_config, receive_one};
use carrot_harness::broker::{
    BrokerRegistry, ConnectionFactory, DeliveryMode, Destination, EmbeddedBrokerSettings,
    PayloadError,
};
use carrot_harness::dispatch::{DeliveryOptions, DispatchError, DispatchTemplate};
use fake::{Fake, Faker};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Order {
    id: u64,
    customer: String,
}

fn fake_order() -> Order {
    Order {
        id: Faker.fake(),
        customer: Faker.fake(),
    }
}

#[tokio::test]
async fn messages_are_non_persistent_with_default_priority_unless_told_otherwise() {
    // Arrange
    let registry = BrokerRegistry::new();
    let factory = get_connection_factory(&format!("vm://{}", broker_name()), &registry);
    let template = DispatchTemplate::builder(factory.clone()).build();
    let destination = Destination::queue("orders");
    let payload: String = Faker.fake();

    // Act
    template
        .send(&destination, payload.clone(), &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    let delivery = receive_one(&factory, &destination).await;
    let properties = &delivery.message.properties;
    assert_eq!(payload, delivery.message.text());
    assert_eq!(DeliveryMode::NonPersistent, properties.delivery_mode);
    assert_eq!(4, properties.priority);
    assert_eq!(None, properties.time_to_live);
    assert!(properties.message_id.is_some());
    assert!(properties.timestamp.is_some());
}

#[tokio::test]
async fn explicit_delivery_options_travel_with_the_message() {
    // Arrange
    let registry = BrokerRegistry::new();
    let factory = get_connection_factory(&format!("vm://{}", broker_name()), &registry);
    let template = DispatchTemplate::builder(factory.clone()).build();
    let destination = Destination::queue("orders");
    let options = DeliveryOptions::default()
        .persistent()
        .with_priority(9)
        .with_time_to_live(Duration::from_secs(60));

    // Act
    template.send(&destination, "hello", &options).await.unwrap();

    // Assert
    let properties = receive_one(&factory, &destination).await.message.properties;
    assert_eq!(DeliveryMode::Persistent, properties.delivery_mode);
    assert_eq!(9, properties.priority);
    assert_eq!(Some(Duration::from_secs(60)), properties.time_to_live);
}

#[tokio::test]
async fn invalid_priorities_are_rejected_before_sending() {
    // Arrange
    let registry = BrokerRegistry::new();
    let name = broker_name();
    let factory = get_connection_factory(&format!("vm://{name}"), &registry);
    let template = DispatchTemplate::builder(factory).build();

    // Act
    let outcome = template
        .send(
            &Destination::queue("orders"),
            "hello",
            &DeliveryOptions::default().with_priority(10),
        )
        .await;

    // Assert
    assert!(matches!(outcome, Err(DispatchError::InvalidOptions(_))));
    assert!(registry.lookup(&name).is_none());
}

#[tokio::test]
async fn send_failures_are_surfaced_to_the_caller() {
    // Arrange
    let registry = BrokerRegistry::new();
    let name = broker_name();
    let broker = registry
        .start_broker(&EmbeddedBrokerSettings::new(name.as_str()))
        .unwrap();
    let factory = get_connection_factory(&format!("vm://{name}?create=false"), &registry);
    let template = DispatchTemplate::builder(factory).build();
    broker.stop();

    // Act
    let outcome = template
        .send(&Destination::queue("orders"), "hello", &DeliveryOptions::default())
        .await;

    // Assert
    assert!(matches!(outcome, Err(DispatchError::Transport(_))));
}

#[tokio::test]
async fn sending_through_a_closed_factory_fails() {
    // Arrange
    let registry = BrokerRegistry::new();
    let factory = get_connection_factory(&format!("vm://{}", broker_name()), &registry);
    let template = DispatchTemplate::builder(factory.clone()).build();
    factory.close().await.unwrap();

    // Act
    let outcome = template.send_default("hello").await;

    // Assert
    assert!(matches!(outcome, Err(DispatchError::NoDestination)));
    let outcome = template
        .send(&Destination::queue("orders"), "hello", &DeliveryOptions::default())
        .await;
    assert!(matches!(outcome, Err(DispatchError::Closed)));
}

#[tokio::test]
async fn the_default_destination_and_options_are_used_by_send_default() {
    // Arrange
    let registry = BrokerRegistry::new();
    let factory = get_connection_factory(&format!("vm://{}", broker_name()), &registry);
    let destination = Destination::queue("defaults");
    let template = DispatchTemplate::builder(factory.clone())
        .default_destination(destination.clone())
        .delivery_options(DeliveryOptions::default().with_priority(1))
        .build();

    // Act
    template.send_default("hello").await.unwrap();

    // Assert
    let delivery = receive_one(&factory, &destination).await;
    assert_eq!("hello", delivery.message.text());
    assert_eq!(1, delivery.message.properties.priority);
}

#[tokio::test]
async fn topics_reach_every_live_subscriber() {
    // Arrange
    let registry = BrokerRegistry::new();
    let factory = get_connection_factory(&format!("vm://{}", broker_name()), &registry);
    let template = DispatchTemplate::builder(factory.clone())
        .pub_sub_domain(true)
        .build();
    let topic = template.destination("prices");
    let first = tokio::spawn({
        let factory = factory.clone();
        let topic = topic.clone();
        async move { receive_one(&factory, &topic).await }
    });
    let second = tokio::spawn({
        let factory = factory.clone();
        let topic = topic.clone();
        async move { receive_one(&factory, &topic).await }
    });
    // Give both subscribers the time to attach.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Act
    template
        .send(&topic, "42", &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(Destination::topic("prices"), topic);
    assert_eq!("42", first.await.unwrap().message.text());
    assert_eq!("42", second.await.unwrap().message.text());
}

#[tokio::test]
async fn typed_payloads_are_only_readable_if_their_type_is_trusted() {
    // Arrange
    let registry = BrokerRegistry::new();
    let address = format!("vm://{}", broker_name());
    let untrusting = get_connection_factory(&address, &registry);
    let trusting = ConnectionFactory::builder(
        in_process_config(&address).with_trusted_type(std::any::type_name::<Order>()),
    )
    .broker_registry(registry.clone())
    .build()
    .unwrap();
    let template = DispatchTemplate::builder(untrusting.clone()).build();
    let destination = Destination::queue("typed");
    let order = fake_order();

    // Act
    template
        .send_json(&destination, &order, &DeliveryOptions::default())
        .await
        .unwrap();
    template
        .send_json(&destination, &order, &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    let refused = receive_one(&untrusting, &destination).await.message;
    assert!(matches!(
        refused.json::<Order>(),
        Err(PayloadError::UntrustedType(_))
    ));
    assert_eq!(Some("application/json"), refused.properties.content_type.as_deref());
    let accepted = receive_one(&trusting, &destination).await.message;
    assert_eq!(order, accepted.json::<Order>().unwrap());
}
