//! These tests need a RabbitMq instance matching `tests/fixtures/rabbitmq.yml`.
//! Run them with `cargo test -- --ignored`.
use crate::helpers::receive_one;
use carrot_harness::broker::{ConnectionFactory, ConnectionFactoryConfig, Destination};
use carrot_harness::dispatch::{DeliveryOptions, DispatchTemplate};
use fake::{Fake, Faker};
use std::path::PathBuf;
use uuid::Uuid;

/// Retrieve a connection factory for our RabbitMq server.
fn get_rabbitmq_factory() -> ConnectionFactory {
    let mut config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    config_path.push("tests/fixtures/rabbitmq.yml");

    let config: ConnectionFactoryConfig = serde_yaml::from_reader(
        std::fs::File::open(config_path).expect("failed to open config file"),
    )
    .expect("failed to read rabbitmq config");

    ConnectionFactory::create(config).unwrap()
}

#[tokio::test]
#[ignore = "needs a RabbitMq broker"]
async fn messages_sent_to_an_undeclared_queue_are_kept() {
    // Arrange
    let factory = get_rabbitmq_factory();
    let template = DispatchTemplate::builder(factory.clone()).build();
    let destination = Destination::queue(format!("harness-{}", Uuid::new_v4()));
    let payload: String = Faker.fake();

    // Act
    template
        .send(&destination, payload.clone(), &DeliveryOptions::default())
        .await
        .unwrap();

    // Assert
    let delivery = receive_one(&factory, &destination).await;
    assert_eq!(payload, delivery.message.text());
    factory.close().await.unwrap();
}
