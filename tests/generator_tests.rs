//! Integration tests for deal payload generation.

use chrono::{Local, NaiveDateTime};
use fxdeals_loadtest::generator::{
    DealGenerator, DealOverrides, WorkerIdentity, CURRENCIES, DEAL_TIMESTAMP_FORMAT,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;

fn identity(vu_id: u64, iteration: u64) -> WorkerIdentity {
    WorkerIdentity { vu_id, iteration }
}

#[test]
fn test_currency_pair_never_collides() {
    let gen = DealGenerator::new(10.0, 100_000.0);
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..10_000 {
        let (from, to) = gen.currency_pair(&mut rng, None, None);
        assert_ne!(from, to);
        assert!(CURRENCIES.contains(&from.as_str()));
        assert!(CURRENCIES.contains(&to.as_str()));
    }
}

#[test]
fn test_amount_has_two_decimals_and_stays_in_range() {
    let gen = DealGenerator::new(10.0, 20.0);
    let mut rng = StdRng::seed_from_u64(9);

    for _ in 0..5_000 {
        let amount = gen.amount(&mut rng);
        let (_, decimals) = amount.split_once('.').expect("amount has a decimal point");
        assert_eq!(decimals.len(), 2, "amount {} should have two decimals", amount);

        let value: f64 = amount.parse().unwrap();
        assert!((10.0..=20.0).contains(&value), "amount {} out of range", amount);
    }
}

#[test]
fn test_degenerate_amount_range_is_constant() {
    let gen = DealGenerator::new(12.5, 12.5);
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(gen.amount(&mut rng), "12.50");
}

#[test]
fn test_timestamp_matches_import_format() {
    let gen = DealGenerator::new(10.0, 100.0);
    let deal = gen.generate_payload(identity(1, 0), DealOverrides::default());

    assert_eq!(deal.deal_timestamp.len(), 19);
    assert!(
        NaiveDateTime::parse_from_str(&deal.deal_timestamp, DEAL_TIMESTAMP_FORMAT).is_ok(),
        "timestamp {} does not parse",
        deal.deal_timestamp
    );
}

#[test]
fn test_payload_serializes_with_camel_case_fields() {
    let gen = DealGenerator::new(10.0, 100.0);
    let deal = gen.generate_payload(identity(1, 0), DealOverrides::default());
    let json = serde_json::to_value(&deal).unwrap();

    let fields: HashSet<&str> = json
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        fields,
        HashSet::from([
            "dealId",
            "fromCurrency",
            "toCurrency",
            "dealTimestamp",
            "dealAmount"
        ])
    );
    assert!(json["dealAmount"].is_string());
}

#[test]
fn test_overrides_are_taken_verbatim() {
    let gen = DealGenerator::new(10.0, 100.0);
    let deal = gen.generate_payload(
        identity(1, 0),
        DealOverrides {
            deal_id: Some("FIXED-1".to_string()),
            from_currency: Some("EUR".to_string()),
            to_currency: Some("USD".to_string()),
            deal_amount: Some("1.00".to_string()),
            deal_timestamp: Some("2024-01-01 00:00:00".to_string()),
        },
    );

    assert_eq!(deal.deal_id, "FIXED-1");
    assert_eq!(deal.from_currency, "EUR");
    assert_eq!(deal.to_currency, "USD");
    assert_eq!(deal.deal_amount, "1.00");
    assert_eq!(deal.deal_timestamp, "2024-01-01 00:00:00");
}

#[test]
fn test_batch_items_have_distinct_ids() {
    let gen = DealGenerator::new(10.0, 100.0);
    let batch = gen.generate_batch(identity(4, 2), 25);

    assert_eq!(batch.len(), 25);
    let ids: HashSet<&str> = batch.iter().map(|d| d.deal_id.as_str()).collect();
    assert_eq!(ids.len(), 25);
    assert!(batch.iter().all(|d| d.deal_id.starts_with("FX-4-2.")));
}

#[test]
fn test_same_instant_and_rng_state_still_yields_unique_ids_across_workers() {
    let gen = DealGenerator::new(10.0, 100.0);
    let now = Local::now();
    let mut ids = HashSet::new();

    // Identical RNG seed for everyone: uniqueness must come from the identity.
    for vu in 1..=100 {
        for iteration in 0..100 {
            let mut rng = StdRng::seed_from_u64(0);
            let deal = gen.generate_with(
                &mut rng,
                now,
                identity(vu, iteration),
                None,
                DealOverrides::default(),
            );
            assert!(ids.insert(deal.deal_id));
        }
    }
    assert_eq!(ids.len(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generation_yields_unique_ids() {
    let gen = Arc::new(DealGenerator::new(10.0, 100.0));
    let mut handles = Vec::new();

    for vu in 1..=100u64 {
        let gen = Arc::clone(&gen);
        handles.push(tokio::spawn(async move {
            (0..100u64)
                .map(|iteration| {
                    gen.generate_payload(identity(vu, iteration), DealOverrides::default())
                        .deal_id
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(ids.insert(id.clone()), "duplicate deal id {}", id);
        }
    }
    assert_eq!(ids.len(), 10_000);
}
