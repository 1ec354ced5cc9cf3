use super::*;

fn client() -> KafkaClient {
    KafkaClient::from_address("broker-a:9092, broker-b:9093").unwrap()
}

#[test]
fn test_bootstrap_list_is_normalized() {
    let client = client();
    assert_eq!(client.address(), "broker-a:9092,broker-b:9093");
    assert!(client.supports_transactions());

    for address in ["", "broker", "broker:", ":9092", "broker:99999", "a:1,,b:2"] {
        assert!(
            KafkaClient::from_address(address).is_err(),
            "accepted {address:?}"
        );
    }
}

#[test]
fn test_consumer_reads_committed_and_never_auto_commits() {
    let config = client().consumer_config("sensor-job");
    assert_eq!(config.get("bootstrap.servers"), Some("broker-a:9092,broker-b:9093"));
    assert_eq!(config.get("group.id"), Some("sensor-job"));
    assert_eq!(config.get("isolation.level"), Some("read_committed"));
    assert_eq!(config.get("enable.auto.commit"), Some("false"));
    assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
}

#[test]
fn test_transactional_producer_config() {
    let client = client().with_transaction_timeout(Duration::from_secs(120));
    let config = client.producer_config(Some("sensor-job-4"));
    assert_eq!(config.get("transactional.id"), Some("sensor-job-4"));
    assert_eq!(config.get("transaction.timeout.ms"), Some("120000"));
    assert_eq!(config.get("enable.idempotence"), Some("true"));
    assert_eq!(config.get("acks"), Some("all"));

    let plain = client.producer_config(None);
    assert_eq!(plain.get("transactional.id"), None);
    assert_eq!(plain.get("transaction.timeout.ms"), None);
}

#[test]
fn test_prepared_transactions_of_other_processes_are_not_held() {
    let client = KafkaClient::from_address("localhost:19092").unwrap();
    assert!(!client.commit_prepared("sensor-job-0").unwrap());
    assert_eq!(client.abort_prepared("sensor-job").unwrap(), 0);
}

#[test]
fn test_seek_takes_effect_through_reassignment() {
    let client = KafkaClient::from_address("localhost:19092").unwrap();
    let mut consumer = KafkaConsumer::new(&client, "sensor-readings", "sensor-job").unwrap();
    consumer.assigned = true;

    consumer.seek(0, 42).unwrap();
    consumer.seek(2, 7).unwrap();
    assert!(!consumer.assigned);
    assert_eq!(consumer.positions, BTreeMap::from([(0, 42), (2, 7)]));
}

#[test]
fn test_plain_producer_rejects_transaction_calls() {
    let client = KafkaClient::from_address("localhost:19092").unwrap();
    let mut producer = client.producer(None).unwrap();
    let err = producer.begin_transaction().unwrap_err();
    assert!(err.to_string().contains("not transactional"));
    assert!(producer.commit_transaction().is_err());
    assert!(producer.abort_transaction().is_err());
}
