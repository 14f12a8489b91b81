use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use trading_firm_bus::bus::{Message, MessageBus, MessageHandler, MessageId, RedbBus};
use trading_firm_bus::clock::{SimulatedTimeProvider, TimeProvider};
use trading_firm_bus::codec::{EnvelopeCodec, Payload};
use trading_firm_bus::coordination::{CoordinationStore, RedbCoordination};
use trading_firm_bus::events::{CatalystEvent, NewsItem, PlaybookEvent, SignalAction, TradeSignal};
use trading_firm_bus::hold_gate::{HoldGate, HoldStatus, HoldWriter};
use trading_firm_bus::persistence::RedbStore;
use trading_firm_bus::signals::{KeywordScorer, SignalDecision, SignalPath};
use trading_firm_bus::topics::{PLAYBOOK, TRADE_SIGNALS};

struct Fixture {
    bus: Arc<RedbBus>,
    store: Arc<RedbCoordination>,
    clock: Arc<SimulatedTimeProvider>,
    path: String,
}

impl Fixture {
    fn new() -> Self {
        let path = format!("/tmp/hold_gate_{}.redb", uuid::Uuid::new_v4());
        let db = Arc::new(RedbStore::new(&path).unwrap());
        let start = Utc.with_ymd_and_hms(2024, 7, 30, 14, 0, 0).unwrap();
        Self {
            bus: Arc::new(RedbBus::new(db.clone(), EnvelopeCodec::default()).unwrap()),
            store: Arc::new(RedbCoordination::new(db, "system_halt").unwrap()),
            clock: Arc::new(SimulatedTimeProvider::starting_at(start)),
            path,
        }
    }

    fn writer(&self) -> HoldWriter {
        HoldWriter::new(self.store.clone(), self.clock.clone())
    }

    fn gate(&self) -> HoldGate {
        HoldGate::new(self.store.clone(), self.clock.clone())
    }

    fn signal_path(&self) -> SignalPath {
        SignalPath::new(
            self.bus.clone(),
            self.gate(),
            Arc::new(KeywordScorer::default()),
        )
    }

    fn catalyst(&self, ticker: Option<&str>, hold_for_secs: Option<i64>) -> Message {
        let now = self.clock.now();
        let event = PlaybookEvent::Catalyst(CatalystEvent {
            event_name: "Court verdict".into(),
            ticker: ticker.map(str::to_string),
            event_time_utc: now,
            hold_until_utc: hold_for_secs.map(|s| now + ChronoDuration::seconds(s)),
            expected_impact: "High".into(),
        });
        message(event.to_payload())
    }

    async fn emitted_signals(&self) -> Vec<TradeSignal> {
        self.bus.ensure_group(TRADE_SIGNALS, "trader").await.unwrap();
        let mut out = Vec::new();
        while let Some(msg) = self
            .bus
            .read_new(TRADE_SIGNALS, "trader", "t1", Duration::ZERO)
            .await
            .unwrap()
        {
            out.push(TradeSignal::from_payload(&msg.payload).unwrap());
            self.bus.ack(TRADE_SIGNALS, "trader", msg.id).await.unwrap();
        }
        out
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn message(payload: Payload) -> Message {
    Message {
        id: MessageId(1),
        topic: PLAYBOOK.to_string(),
        payload,
        delivery_count: 1,
    }
}

fn news(ticker: &str, headline: &str) -> NewsItem {
    NewsItem {
        headline: headline.to_string(),
        source: "Wire".to_string(),
        link: None,
        ticker: Some(ticker.to_string()),
    }
}

#[tokio::test]
async fn test_hold_suppresses_signals_until_expiry() {
    let f = Fixture::new();
    f.writer().handle(&f.catalyst(Some("ACME"), Some(10))).await.unwrap();

    let path = f.signal_path();
    let headline = news("ACME", "ACME beats estimates");

    let decision = path.process(&headline).await.unwrap();
    assert!(matches!(decision, SignalDecision::Suppressed { .. }));

    f.clock.advance(9_999);
    let decision = path.process(&headline).await.unwrap();
    assert!(matches!(decision, SignalDecision::Suppressed { .. }));
    assert!(f.emitted_signals().await.is_empty());

    // now == hold_until: the hold no longer applies.
    f.clock.advance(1);
    let decision = path.process(&headline).await.unwrap();
    assert!(matches!(decision, SignalDecision::Emit(_)));

    let signals = f.emitted_signals().await;
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].ticker, "ACME");
    assert_eq!(signals[0].action, SignalAction::Buy);
    assert_eq!(signals[0].source, "signal_maker");

    // Expired hold was cleared on the way through.
    assert_eq!(f.store.get_hold("ACME").await.unwrap(), None);
}

#[tokio::test]
async fn test_peek_never_clears_an_expired_hold() {
    let f = Fixture::new();
    f.writer().handle(&f.catalyst(Some("ACME"), Some(10))).await.unwrap();
    let gate = f.gate();
    assert!(gate.peek("ACME").await.unwrap().is_held());

    f.clock.advance(10_000);
    assert_eq!(gate.peek("ACME").await.unwrap(), HoldStatus::Clear);
    assert!(f.store.get_hold("ACME").await.unwrap().is_some());

    assert_eq!(gate.check("ACME").await.unwrap(), HoldStatus::Clear);
    assert_eq!(f.store.get_hold("ACME").await.unwrap(), None);
}

#[tokio::test]
async fn test_hold_applies_only_to_its_ticker() {
    let f = Fixture::new();
    f.writer().handle(&f.catalyst(Some("ACME"), Some(3600))).await.unwrap();

    let decision = f
        .signal_path()
        .process(&news("GLOBEX", "GLOBEX plunges on recall"))
        .await
        .unwrap();
    match decision {
        SignalDecision::Emit(signal) => assert_eq!(signal.action, SignalAction::Sell),
        other => panic!("expected a SELL signal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_last_catalyst_wins() {
    let f = Fixture::new();
    let writer = f.writer();
    writer.handle(&f.catalyst(Some("ACME"), Some(3600))).await.unwrap();
    writer.handle(&f.catalyst(Some("ACME"), Some(60))).await.unwrap();

    let expected = f.clock.now() + ChronoDuration::seconds(60);
    assert_eq!(
        f.gate().check("ACME").await.unwrap(),
        HoldStatus::Held { until: expected }
    );
}

#[tokio::test]
async fn test_catalysts_without_hold_or_ticker_are_ignored() {
    let f = Fixture::new();
    let writer = f.writer();
    writer.handle(&f.catalyst(None, Some(60))).await.unwrap();
    writer.handle(&f.catalyst(Some("ACME"), None)).await.unwrap();
    // Already in the past.
    writer.handle(&f.catalyst(Some("INITECH"), Some(-60))).await.unwrap();

    assert_eq!(f.store.get_hold("ACME").await.unwrap(), None);
    assert_eq!(f.store.get_hold("INITECH").await.unwrap(), None);
}

#[tokio::test]
async fn test_other_playbook_traffic_is_ignored() {
    let f = Fixture::new();
    let mut halt = Payload::new();
    halt.insert("type".into(), "SystemHalt".into());
    halt.insert("reason".into(), "manual".into());
    f.writer().handle(&message(halt)).await.unwrap();

    let mut unknown = Payload::new();
    unknown.insert("type".into(), "MarketRegime".into());
    f.writer().handle(&message(unknown)).await.unwrap();
}

#[tokio::test]
async fn test_malformed_hold_time_is_rejected() {
    let f = Fixture::new();
    let mut payload = Payload::new();
    payload.insert("type".into(), "CatalystEvent".into());
    payload.insert("event_name".into(), "Earnings".into());
    payload.insert("ticker".into(), "ACME".into());
    payload.insert("hold_until_utc".into(), "next tuesday".into());

    let err = f.writer().handle(&message(payload)).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(f.store.get_hold("ACME").await.unwrap(), None);
}

#[tokio::test]
async fn test_catalyst_without_descriptive_fields_still_holds() {
    let f = Fixture::new();
    let until = f.clock.now() + ChronoDuration::seconds(60);
    let mut payload = Payload::new();
    payload.insert("type".into(), "CatalystEvent".into());
    payload.insert("ticker".into(), "MSFT".into());
    payload.insert("hold_until_utc".into(), until.to_rfc3339());
    payload.insert("event_name".into(), "Verdict".into());

    f.writer().handle(&message(payload)).await.unwrap();
    assert_eq!(f.store.get_hold("MSFT").await.unwrap(), Some(until));
    assert!(f.gate().check("MSFT").await.unwrap().is_held());
}

#[tokio::test]
async fn test_news_without_ticker_is_skipped() {
    let f = Fixture::new();
    let item = NewsItem {
        headline: "Markets rise broadly".into(),
        source: "Wire".into(),
        link: None,
        ticker: None,
    };
    assert_eq!(
        f.signal_path().process(&item).await.unwrap(),
        SignalDecision::NoTicker
    );
    assert!(f.emitted_signals().await.is_empty());
}
