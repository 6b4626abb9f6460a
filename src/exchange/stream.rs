// =============================================================================
// Exchange Streams — kline / orderbook WebSockets and execution classification
// =============================================================================
//
// Public stream: one connection carries every subscribed kline topic plus the
// orderbook snapshot topic. Only candles with `confirm == true` become
// CandleClosed events. Private stream: authenticated execution feed, mapped
// onto typed execution kinds with the 1-based TP counter.
//
// Each `run_*` function runs until its connection drops, then returns so the
// caller can reconnect with backoff.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::engine::EngineEvent;
use crate::exchange::bybit::interval_code;
use crate::types::{BookLevel, Candle, OrderBook, TimeframeRole};

type HmacSha256 = Hmac<Sha256>;

/// Public linear-perp stream endpoint.
const PUBLIC_STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";
/// Private stream endpoint (authenticated).
const PRIVATE_STREAM_URL: &str = "wss://stream.bybit.com/v5/private";
/// Orderbook depth subscribed on the public stream.
const ORDERBOOK_DEPTH: u32 = 50;

// -----------------------------------------------------------------------------
// Execution classification
// -----------------------------------------------------------------------------

/// One raw execution event off the private stream.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEvent {
    pub order_id: String,
    pub symbol: String,
    pub exec_type: String,
    pub stop_order_type: String,
    pub order_type: String,
    pub create_type: String,
    pub exec_price: f64,
    pub exec_qty: f64,
    pub closed_size: f64,
    pub side: String,
}

/// What an execution meant for the tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    /// 1-based TP ladder level.
    TakeProfit(u32),
    StopLoss,
    TrailingStop,
    Entry,
}

/// Stateful classifier: counts consecutive TP fills, resetting on anything
/// that is not a take-profit.
#[derive(Debug)]
pub struct ExecutionClassifier {
    expected_symbol: String,
    tp_counter: u32,
}

impl ExecutionClassifier {
    pub fn new(expected_symbol: impl Into<String>) -> Self {
        Self {
            expected_symbol: expected_symbol.into(),
            tp_counter: 0,
        }
    }

    pub fn classify(&mut self, event: &ExecutionEvent) -> ExecutionKind {
        if event.symbol != self.expected_symbol {
            warn!(
                symbol = %event.symbol,
                expected = %self.expected_symbol,
                "execution event for unexpected symbol"
            );
        }

        let is_take_profit = event.stop_order_type == "PartialTakeProfit"
            || ((event.stop_order_type.is_empty() || event.stop_order_type == "UNKNOWN")
                && event.create_type == "CreateByUser"
                && event.closed_size > 0.0);

        if is_take_profit {
            self.tp_counter += 1;
            debug!(level = self.tp_counter, order_id = %event.order_id, "take-profit fill");
            return ExecutionKind::TakeProfit(self.tp_counter);
        }

        self.tp_counter = 0;
        match event.stop_order_type.as_str() {
            "StopLoss" | "Stop" | "PartialStopLoss" => ExecutionKind::StopLoss,
            "TrailingStop" => ExecutionKind::TrailingStop,
            _ => ExecutionKind::Entry,
        }
    }

    pub fn tp_counter(&self) -> u32 {
        self.tp_counter
    }
}

// -----------------------------------------------------------------------------
// Public market stream
// -----------------------------------------------------------------------------

/// Connect to the public stream, subscribe every `(role, interval)` kline
/// topic plus the orderbook topic, and forward events into `tx`. Returns when
/// the connection drops.
pub async fn run_market_stream(
    symbol: &str,
    subscriptions: &[(TimeframeRole, String)],
    tx: mpsc::Sender<EngineEvent>,
) -> Result<()> {
    // Roles may share an interval; one topic fans out to every such role.
    let mut roles_by_code: HashMap<String, Vec<TimeframeRole>> = HashMap::new();
    for (role, interval) in subscriptions {
        let code = interval_code(interval)
            .map_err(|e| anyhow::anyhow!("bad interval for {role}: {e}"))?;
        roles_by_code.entry(code.to_string()).or_default().push(*role);
    }

    let mut args: Vec<String> = roles_by_code
        .keys()
        .map(|code| format!("kline.{code}.{symbol}"))
        .collect();
    args.sort();
    args.push(format!("orderbook.{ORDERBOOK_DEPTH}.{symbol}"));

    info!(url = PUBLIC_STREAM_URL, topics = ?args, "connecting to market stream");
    let (ws_stream, _response) = connect_async(PUBLIC_STREAM_URL)
        .await
        .context("failed to connect to market WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({ "op": "subscribe", "args": args });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            subscribe.to_string(),
        ))
        .await
        .context("failed to send subscribe request")?;
    info!(symbol, "market stream subscribed");

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                if let Err(e) = dispatch_public_message(&text, symbol, &roles_by_code, &tx).await {
                    warn!(error = %e, "failed to handle market stream message");
                }
            }
            Some(Ok(_)) => {
                // Ping/pong/binary frames — tungstenite answers pings itself.
            }
            Some(Err(e)) => {
                error!(error = %e, "market WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "market WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

async fn dispatch_public_message(
    text: &str,
    symbol: &str,
    roles_by_code: &HashMap<String, Vec<TimeframeRole>>,
    tx: &mpsc::Sender<EngineEvent>,
) -> Result<()> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    let Some(topic) = root["topic"].as_str() else {
        // Subscription acks and heartbeats have no topic.
        return Ok(());
    };

    if let Some(code) = topic
        .strip_prefix("kline.")
        .and_then(|rest| rest.split('.').next())
    {
        let Some(roles) = roles_by_code.get(code) else {
            return Ok(());
        };
        for (candle, confirmed) in parse_kline_payload(&root["data"])? {
            if !confirmed {
                continue;
            }
            for &role in roles {
                tx.send(EngineEvent::CandleClosed {
                    role,
                    candle: candle.clone(),
                })
                .await
                .context("engine event channel closed")?;
            }
        }
        return Ok(());
    }

    if topic.starts_with("orderbook.") {
        if let Some(book) = parse_orderbook_payload(&root["data"], root["ts"].as_i64())? {
            tx.send(EngineEvent::OrderbookUpdate { book })
                .await
                .context("engine event channel closed")?;
        }
        return Ok(());
    }

    debug!(topic, symbol, "unhandled stream topic");
    Ok(())
}

/// Parse a kline data array into (candle, confirmed) pairs.
fn parse_kline_payload(data: &serde_json::Value) -> Result<Vec<(Candle, bool)>> {
    let entries = data.as_array().context("kline data is not an array")?;
    let mut out = Vec::with_capacity(entries.len());

    for entry in entries {
        let candle = Candle::new(
            entry["start"].as_i64().context("missing kline.start")?,
            parse_ws_f64(&entry["open"]).context("missing kline.open")?,
            parse_ws_f64(&entry["high"]).context("missing kline.high")?,
            parse_ws_f64(&entry["low"]).context("missing kline.low")?,
            parse_ws_f64(&entry["close"]).context("missing kline.close")?,
            parse_ws_f64(&entry["volume"]).context("missing kline.volume")?,
        );
        let confirmed = entry["confirm"].as_bool().unwrap_or(false);
        out.push((candle, confirmed));
    }

    Ok(out)
}

/// Parse an orderbook snapshot; bids descending, asks ascending.
fn parse_orderbook_payload(
    data: &serde_json::Value,
    timestamp: Option<i64>,
) -> Result<Option<OrderBook>> {
    if data.is_null() {
        return Ok(None);
    }

    let parse_side = |side: &serde_json::Value| -> Result<Vec<BookLevel>> {
        let mut levels = Vec::new();
        for level in side.as_array().into_iter().flatten() {
            let row = level.as_array().context("book level is not an array")?;
            if row.len() < 2 {
                continue;
            }
            levels.push(BookLevel {
                price: parse_ws_f64(&row[0]).context("bad level price")?,
                size: parse_ws_f64(&row[1]).context("bad level size")?,
            });
        }
        Ok(levels)
    };

    Ok(Some(OrderBook {
        timestamp: timestamp.unwrap_or(0),
        bids: parse_side(&data["b"])?,
        asks: parse_side(&data["a"])?,
    }))
}

// -----------------------------------------------------------------------------
// Binance futures market stream (one socket per kline interval)
// -----------------------------------------------------------------------------

/// Binance futures stream endpoint.
const BINANCE_STREAM_URL: &str = "wss://fstream.binance.com/ws";

/// Connect to one Binance futures kline stream and forward closed candles.
/// Returns when the connection drops.
pub async fn run_binance_kline_stream(
    symbol: &str,
    role: TimeframeRole,
    interval: &str,
    tx: mpsc::Sender<EngineEvent>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{BINANCE_STREAM_URL}/{lower}@kline_{interval}");
    info!(url = %url, role = %role, "connecting to binance kline stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to binance kline WebSocket")?;
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_binance_kline(&text) {
                    Ok(Some(candle)) => {
                        tx.send(EngineEvent::CandleClosed { role, candle })
                            .await
                            .context("engine event channel closed")?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse binance kline"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "binance kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, interval, "binance kline stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance kline message; only closed candles (`k.x == true`) yield a
/// value.
fn parse_binance_kline(text: &str) -> Result<Option<Candle>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse binance kline JSON")?;

    let k = &root["k"];
    if k.is_null() {
        return Ok(None);
    }
    if !k["x"].as_bool().unwrap_or(false) {
        return Ok(None);
    }

    Ok(Some(Candle::new(
        k["t"].as_i64().context("missing k.t")?,
        parse_ws_f64(&k["o"]).context("missing k.o")?,
        parse_ws_f64(&k["h"]).context("missing k.h")?,
        parse_ws_f64(&k["l"]).context("missing k.l")?,
        parse_ws_f64(&k["c"]).context("missing k.c")?,
        parse_ws_f64(&k["v"]).context("missing k.v")?,
    )))
}

/// Connect to the Binance partial-depth stream and forward snapshots.
pub async fn run_binance_depth_stream(symbol: &str, tx: mpsc::Sender<EngineEvent>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{BINANCE_STREAM_URL}/{lower}@depth20@100ms");
    info!(url = %url, "connecting to binance depth stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to binance depth WebSocket")?;
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_binance_depth(&text) {
                    Ok(Some(book)) => {
                        tx.send(EngineEvent::OrderbookUpdate { book })
                            .await
                            .context("engine event channel closed")?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse binance depth"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "binance depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "binance depth stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_binance_depth(text: &str) -> Result<Option<OrderBook>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse binance depth JSON")?;

    let (bids, asks) = match (root["b"].as_array(), root["a"].as_array()) {
        (Some(b), Some(a)) => (b, a),
        _ => return Ok(None),
    };

    let parse_levels = |rows: &[serde_json::Value]| -> Result<Vec<BookLevel>> {
        let mut levels = Vec::with_capacity(rows.len());
        for row in rows {
            let pair = row.as_array().context("depth level is not an array")?;
            if pair.len() < 2 {
                continue;
            }
            levels.push(BookLevel {
                price: parse_ws_f64(&pair[0]).context("bad depth price")?,
                size: parse_ws_f64(&pair[1]).context("bad depth size")?,
            });
        }
        Ok(levels)
    };

    Ok(Some(OrderBook {
        timestamp: root["E"].as_i64().unwrap_or(0),
        bids: parse_levels(bids)?,
        asks: parse_levels(asks)?,
    }))
}

// -----------------------------------------------------------------------------
// Private execution stream
// -----------------------------------------------------------------------------

/// Connect to the private stream, authenticate, subscribe to executions, and
/// forward events into `tx`. Returns when the connection drops.
pub async fn run_execution_stream(
    api_key: &str,
    api_secret: &str,
    tx: mpsc::Sender<EngineEvent>,
) -> Result<()> {
    info!(url = PRIVATE_STREAM_URL, "connecting to execution stream");
    let (ws_stream, _response) = connect_async(PRIVATE_STREAM_URL)
        .await
        .context("failed to connect to private WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Auth: signature over "GET/realtime{expires}".
    let expires = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
        + 10_000;
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("GET/realtime{expires}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let auth = serde_json::json!({ "op": "auth", "args": [api_key, expires, signature] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            auth.to_string(),
        ))
        .await
        .context("failed to send auth request")?;

    let subscribe = serde_json::json!({ "op": "subscribe", "args": ["execution"] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            subscribe.to_string(),
        ))
        .await
        .context("failed to subscribe to executions")?;
    info!("execution stream subscribed");

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_execution_message(&text) {
                    Ok(events) => {
                        for event in events {
                            tx.send(EngineEvent::Execution { event })
                                .await
                                .context("engine event channel closed")?;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse execution message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "execution WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("execution WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse one private-stream execution message into events.
fn parse_execution_message(text: &str) -> Result<Vec<ExecutionEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse execution JSON")?;

    if root["topic"].as_str() != Some("execution") {
        return Ok(Vec::new());
    }

    let entries = root["data"]
        .as_array()
        .context("execution data is not an array")?;

    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        events.push(ExecutionEvent {
            order_id: entry["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
            exec_type: entry["execType"].as_str().unwrap_or_default().to_string(),
            stop_order_type: entry["stopOrderType"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            order_type: entry["orderType"].as_str().unwrap_or_default().to_string(),
            create_type: entry["createType"].as_str().unwrap_or_default().to_string(),
            exec_price: parse_ws_f64(&entry["execPrice"]).unwrap_or(0.0),
            exec_qty: parse_ws_f64(&entry["execQty"]).unwrap_or(0.0),
            closed_size: parse_ws_f64(&entry["closedSize"]).unwrap_or(0.0),
            side: entry["side"].as_str().unwrap_or_default().to_string(),
        });
    }

    Ok(events)
}

/// Stream payloads carry numbers as strings.
fn parse_ws_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tp_event(closed_size: f64) -> ExecutionEvent {
        ExecutionEvent {
            order_id: "o1".to_string(),
            symbol: "BTCUSDT".to_string(),
            stop_order_type: "PartialTakeProfit".to_string(),
            closed_size,
            ..Default::default()
        }
    }

    #[test]
    fn tp_counter_increments_then_resets_on_stop_loss() {
        let mut classifier = ExecutionClassifier::new("BTCUSDT");

        assert_eq!(classifier.classify(&tp_event(0.1)), ExecutionKind::TakeProfit(1));
        assert_eq!(classifier.classify(&tp_event(0.1)), ExecutionKind::TakeProfit(2));

        let stop = ExecutionEvent {
            symbol: "BTCUSDT".to_string(),
            stop_order_type: "StopLoss".to_string(),
            ..Default::default()
        };
        assert_eq!(classifier.classify(&stop), ExecutionKind::StopLoss);
        assert_eq!(classifier.tp_counter(), 0);
    }

    #[test]
    fn user_created_close_with_size_counts_as_tp() {
        let mut classifier = ExecutionClassifier::new("BTCUSDT");
        let event = ExecutionEvent {
            symbol: "BTCUSDT".to_string(),
            stop_order_type: "UNKNOWN".to_string(),
            create_type: "CreateByUser".to_string(),
            closed_size: 0.2,
            ..Default::default()
        };
        assert_eq!(classifier.classify(&event), ExecutionKind::TakeProfit(1));
    }

    #[test]
    fn trailing_and_entry_reset_the_counter() {
        let mut classifier = ExecutionClassifier::new("BTCUSDT");
        classifier.classify(&tp_event(0.1));

        let trailing = ExecutionEvent {
            symbol: "BTCUSDT".to_string(),
            stop_order_type: "TrailingStop".to_string(),
            ..Default::default()
        };
        assert_eq!(classifier.classify(&trailing), ExecutionKind::TrailingStop);
        assert_eq!(classifier.tp_counter(), 0);

        classifier.classify(&tp_event(0.1));
        let entry = ExecutionEvent {
            symbol: "BTCUSDT".to_string(),
            create_type: "CreateByUser".to_string(),
            closed_size: 0.0,
            ..Default::default()
        };
        assert_eq!(classifier.classify(&entry), ExecutionKind::Entry);
        assert_eq!(classifier.tp_counter(), 0);
    }

    #[test]
    fn partial_stop_loss_variants_classify_as_stop() {
        let mut classifier = ExecutionClassifier::new("BTCUSDT");
        for stop_type in ["StopLoss", "Stop", "PartialStopLoss"] {
            let event = ExecutionEvent {
                symbol: "BTCUSDT".to_string(),
                stop_order_type: stop_type.to_string(),
                ..Default::default()
            };
            assert_eq!(classifier.classify(&event), ExecutionKind::StopLoss);
        }
    }

    #[test]
    fn kline_payload_parses_confirm_flag() {
        let data = serde_json::json!([{
            "start": 1700000000000i64,
            "end": 1700003600000i64,
            "interval": "60",
            "open": "37000.5",
            "high": "37100.0",
            "low": "36900.0",
            "close": "37050.0",
            "volume": "123.4",
            "confirm": true
        }]);
        let parsed = parse_kline_payload(&data).unwrap();
        assert_eq!(parsed.len(), 1);
        let (candle, confirmed) = &parsed[0];
        assert!(confirmed);
        assert_eq!(candle.timestamp, 1_700_000_000_000);
        assert!((candle.close - 37_050.0).abs() < f64::EPSILON);
    }

    #[test]
    fn orderbook_payload_parses_levels() {
        let data = serde_json::json!({
            "b": [["99.5", "2.0"], ["99.0", "1.5"]],
            "a": [["100.5", "1.0"]]
        });
        let book = parse_orderbook_payload(&data, Some(42)).unwrap().unwrap();
        assert_eq!(book.timestamp, 42);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.best_bid(), Some(99.5));
        assert_eq!(book.best_ask(), Some(100.5));
    }

    #[test]
    fn execution_message_parses_fields() {
        let text = serde_json::json!({
            "topic": "execution",
            "data": [{
                "orderId": "abc",
                "symbol": "BTCUSDT",
                "execType": "Trade",
                "stopOrderType": "PartialTakeProfit",
                "orderType": "Market",
                "createType": "CreateByTakeProfit",
                "execPrice": "37000.0",
                "execQty": "0.1",
                "closedSize": "0.1",
                "side": "Sell"
            }]
        })
        .to_string();

        let events = parse_execution_message(&text).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_id, "abc");
        assert!((events[0].closed_size - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn non_execution_topics_yield_nothing() {
        let text = serde_json::json!({ "op": "auth", "success": true }).to_string();
        assert!(parse_execution_message(&text).unwrap().is_empty());
    }

    #[test]
    fn binance_kline_only_yields_closed_candles() {
        let open = serde_json::json!({
            "e": "kline",
            "k": {
                "t": 1700000000000i64,
                "o": "100.0", "h": "101.0", "l": "99.0", "c": "100.5",
                "v": "12.0", "x": false
            }
        })
        .to_string();
        assert!(parse_binance_kline(&open).unwrap().is_none());

        let closed = serde_json::json!({
            "e": "kline",
            "k": {
                "t": 1700000000000i64,
                "o": "100.0", "h": "101.0", "l": "99.0", "c": "100.5",
                "v": "12.0", "x": true
            }
        })
        .to_string();
        let candle = parse_binance_kline(&closed).unwrap().unwrap();
        assert!((candle.close - 100.5).abs() < f64::EPSILON);
    }

    #[test]
    fn binance_depth_parses_snapshot() {
        let text = serde_json::json!({
            "e": "depthUpdate",
            "E": 123i64,
            "b": [["99.5", "2.0"]],
            "a": [["100.5", "1.0"], ["101.0", "3.0"]]
        })
        .to_string();
        let book = parse_binance_depth(&text).unwrap().unwrap();
        assert_eq!(book.timestamp, 123);
        assert_eq!(book.asks.len(), 2);
    }
}
