// =============================================================================
// Wire Codec — subscribe control message + trade tuple decoding
// =============================================================================
//
// The feed is message-oriented text. Outbound, the client sends one JSON
// subscribe control message after the transport opens. Inbound trade messages
// are comma-delimited tuples:
//
//   <id>,<symbol>,<price>,<volume>,<side>
//
// e.g. `831245,BTC-USD,37020.5,0.125,buy`. Decode failures carry the raw
// payload so the rejection can be logged as a structured event; they never
// reach the aggregator.
// =============================================================================

use serde_json::json;
use thiserror::Error;

use crate::types::TradeSide;

/// Number of fields in a trade tuple.
const TRADE_FIELDS: usize = 5;

/// A message the codec refuses to decode. The raw payload travels with the
/// error for structured reporting.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("expected {TRADE_FIELDS} fields, got {got}: {raw:?}")]
    FieldCount { got: usize, raw: String },

    #[error("unparseable price {value:?}: {raw:?}")]
    BadPrice { value: String, raw: String },

    #[error("unparseable volume {value:?}: {raw:?}")]
    BadVolume { value: String, raw: String },

    #[error("empty id or symbol: {raw:?}")]
    EmptyField { raw: String },
}

/// One decoded trade tuple. The connection manager stamps the receive time
/// and turns this into a [`crate::types::Tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMsg {
    pub id: String,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub side: TradeSide,
}

/// Build the JSON subscribe control message for `symbol`'s trade channel.
pub fn subscribe_message(symbol: &str) -> String {
    json!({
        "type": "subscribe",
        "channel": format!("{symbol}-trades"),
    })
    .to_string()
}

/// Decode one trade tuple. Numeric validity beyond "parses as f64" is the
/// aggregator's concern; the codec only enforces shape.
pub fn decode_trade(text: &str) -> Result<TradeMsg, WireError> {
    let raw = text.trim();
    let fields: Vec<&str> = raw.split(',').map(str::trim).collect();

    if fields.len() != TRADE_FIELDS {
        return Err(WireError::FieldCount {
            got: fields.len(),
            raw: raw.to_string(),
        });
    }

    let id = fields[0];
    let symbol = fields[1];
    if id.is_empty() || symbol.is_empty() {
        return Err(WireError::EmptyField {
            raw: raw.to_string(),
        });
    }

    let price: f64 = fields[2].parse().map_err(|_| WireError::BadPrice {
        value: fields[2].to_string(),
        raw: raw.to_string(),
    })?;

    let volume: f64 = fields[3].parse().map_err(|_| WireError::BadVolume {
        value: fields[3].to_string(),
        raw: raw.to_string(),
    })?;

    let side = match fields[4].to_ascii_lowercase().as_str() {
        "buy" => TradeSide::Buy,
        "sell" => TradeSide::Sell,
        _ => TradeSide::Unknown,
    };

    Ok(TradeMsg {
        id: id.to_string(),
        symbol: symbol.to_string(),
        price,
        volume,
        side,
    })
}
