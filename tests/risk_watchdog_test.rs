use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trading_firm_bus::bus::{
    ConsumeLoop, ConsumerConfig, LoopStats, MessageBus, MessageHandler, MessageId, RedbBus,
};
use trading_firm_bus::codec::{EnvelopeCodec, Payload};
use trading_firm_bus::coordination::{CoordinationStore, RedbCoordination};
use trading_firm_bus::events::{Fill, PlaybookEvent, Side};
use trading_firm_bus::persistence::{RedbStore, StoreError};
use trading_firm_bus::risk_watchdog::{FoldOutcome, RiskWatchdog};
use trading_firm_bus::shutdown::ShutdownCoordinator;
use trading_firm_bus::topics::{FILLS, GROUP_WATCHDOG, PLAYBOOK};

struct Harness {
    bus: Arc<RedbBus>,
    store: Arc<RedbCoordination>,
    path: String,
}

impl Harness {
    fn new() -> Self {
        let path = format!("/tmp/risk_watchdog_{}.redb", uuid::Uuid::new_v4());
        let db = Arc::new(RedbStore::new(&path).unwrap());
        let bus = Arc::new(RedbBus::new(db.clone(), EnvelopeCodec::default()).unwrap());
        let store = Arc::new(RedbCoordination::new(db, "system_halt").unwrap());
        Self { bus, store, path }
    }

    fn watchdog(&self, ceiling: Decimal) -> Arc<RiskWatchdog> {
        Arc::new(RiskWatchdog::new(self.store.clone(), self.bus.clone(), ceiling))
    }

    /// Run the watchdog loop until `expected` fills are acknowledged.
    async fn drain(&self, watchdog: Arc<RiskWatchdog>, expected: u64) -> LoopStats {
        let shutdown = ShutdownCoordinator::new();
        let config = ConsumerConfig {
            block: Duration::from_millis(50),
            ..ConsumerConfig::default()
        };
        let mut consume = ConsumeLoop::new(
            self.bus.clone(),
            FILLS,
            GROUP_WATCHDOG,
            "watchdog-1",
            config,
            shutdown.clone(),
        );
        let task = tokio::spawn(async move { consume.run(watchdog.as_ref()).await });

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.bus.group_cursor(FILLS, GROUP_WATCHDOG).await.unwrap() != Some(MessageId(expected)) {
            assert!(Instant::now() < deadline, "watchdog did not drain in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.request_shutdown("drained");
        task.await.unwrap().unwrap()
    }

    async fn halt_notifications(&self) -> Vec<String> {
        self.bus.ensure_group(PLAYBOOK, "observer").await.unwrap();
        let mut reasons = Vec::new();
        while let Some(msg) = self
            .bus
            .read_new(PLAYBOOK, "observer", "o1", Duration::ZERO)
            .await
            .unwrap()
        {
            if let Ok(PlaybookEvent::Halt(halt)) = PlaybookEvent::from_payload(&msg.payload) {
                reasons.push(halt.reason);
            }
            self.bus.ack(PLAYBOOK, "observer", msg.id).await.unwrap();
        }
        reasons
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fill(side: &str, qty: &str, price: &str) -> Payload {
    [
        ("ticker", "ACME"),
        ("side", side),
        ("qty", qty),
        ("price", price),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[tokio::test]
async fn test_fills_accumulate_to_exact_notional() {
    let h = Harness::new();
    h.bus.publish(FILLS, &fill("buy", "10", "100")).await.unwrap();
    h.bus.publish(FILLS, &fill("sell", "4", "100")).await.unwrap();

    let stats = h.drain(h.watchdog(dec!(100000)), 2).await;

    assert_eq!(stats.acked, 2);
    assert_eq!(h.store.get_notional().await.unwrap(), dec!(600));
    assert!(!h.store.get_halt().await.unwrap());
    assert!(h.halt_notifications().await.is_empty());
}

#[tokio::test]
async fn test_breach_emits_exactly_one_halt() {
    let h = Harness::new();
    h.bus.publish(FILLS, &fill("buy", "10", "100")).await.unwrap();
    h.bus.publish(FILLS, &fill("sell", "4", "100")).await.unwrap();
    h.drain(h.watchdog(dec!(500)), 2).await;

    assert_eq!(h.store.get_notional().await.unwrap(), dec!(600));
    assert!(h.store.get_halt().await.unwrap());

    // A third fill while halted must not produce another notification.
    h.bus.publish(FILLS, &fill("buy", "1", "50")).await.unwrap();
    h.drain(h.watchdog(dec!(500)), 3).await;

    assert_eq!(h.store.get_notional().await.unwrap(), dec!(650));
    let reasons = h.halt_notifications().await;
    assert_eq!(reasons, vec!["Max notional limit of $500.00 breached.".to_string()]);
}

#[tokio::test]
async fn test_malformed_fill_is_acked_without_effect() {
    let h = Harness::new();
    h.bus.publish(FILLS, &fill("buy", "ten", "100")).await.unwrap();
    h.bus.publish(FILLS, &fill("hold", "1", "100")).await.unwrap();
    h.bus.publish(FILLS, &fill("buy", "2", "25.5")).await.unwrap();

    let stats = h.drain(h.watchdog(dec!(100000)), 3).await;

    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.acked, 3);
    assert_eq!(h.store.get_notional().await.unwrap(), dec!(51));
    assert!(h.bus.pending(FILLS, GROUP_WATCHDOG).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_short_exposure_also_breaches() {
    let h = Harness::new();
    let watchdog = h.watchdog(dec!(500));
    let short = Fill {
        order_id: None,
        ticker: "ACME".into(),
        qty: dec!(6),
        price: dec!(100),
        side: Side::Sell,
        timestamp_utc: None,
    };

    assert_eq!(
        watchdog.fold(&short).await.unwrap(),
        FoldOutcome::Breached(dec!(-600))
    );
    assert_eq!(
        watchdog.fold(&short).await.unwrap(),
        FoldOutcome::AlreadyHalted(dec!(-1200))
    );
}

#[tokio::test]
async fn test_handler_reports_malformed_for_bad_payload() {
    let h = Harness::new();
    let watchdog = h.watchdog(dec!(500));
    let message = trading_firm_bus::bus::Message {
        id: MessageId(1),
        topic: FILLS.to_string(),
        payload: fill("buy", "12abc", "100"),
        delivery_count: 1,
    };

    let err = watchdog.handle(&message).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.store.get_notional().await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn test_fill_too_large_to_value_is_malformed() {
    let h = Harness::new();
    let watchdog = h.watchdog(dec!(500));
    let message = trading_firm_bus::bus::Message {
        id: MessageId(1),
        topic: FILLS.to_string(),
        payload: fill("buy", "1e20", "1e20"),
        delivery_count: 1,
    };

    let err = watchdog.handle(&message).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.store.get_notional().await.unwrap(), Decimal::ZERO);
    assert!(!h.store.get_halt().await.unwrap());

    // Built directly, the same fill is refused by fold instead of panicking.
    let huge = Fill {
        order_id: None,
        ticker: "ACME".into(),
        qty: Decimal::from_i128_with_scale(100_000_000_000_000_000_000, 0),
        price: Decimal::from_i128_with_scale(100_000_000_000_000_000_000, 0),
        side: Side::Buy,
        timestamp_utc: None,
    };
    assert!(matches!(
        watchdog.fold(&huge).await,
        Err(StoreError::Integrity(_))
    ));
    assert_eq!(h.store.get_notional().await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn test_accumulator_overflow_leaves_total_unchanged() {
    let h = Harness::new();
    h.store.add_notional(Decimal::MAX).await.unwrap();

    let err = h.store.add_notional(dec!(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Integrity(_)));
    assert_eq!(h.store.get_notional().await.unwrap(), Decimal::MAX);
}
