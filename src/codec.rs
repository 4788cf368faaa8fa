// ===============================
// src/codec.rs
// ===============================
//
// Listing push frames from the MEXC websocket.
// Each binary frame carries one or more varint length-prefixed protobuf
// `PushWrapper` messages. Unknown fields are skipped by prost.
//
use prost::bytes::Buf;
use prost::Message;

use crate::domain::{parse_decimal, ListingFilters, RawListing, RawListingKind, SymbolStatus};

pub const CHANNEL_NEW_LISTINGS: &str = "spot@public.newlistings.v3.api.pb";
pub const CHANNEL_SYMBOL_STATUS: &str = "spot@public.symbolstatus.v3.api.pb";

#[derive(Clone, PartialEq, Message)]
pub struct PushWrapper {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, optional, tag = "3")]
    pub symbol: Option<String>,
    #[prost(int64, optional, tag = "6")]
    pub send_time: Option<i64>,
    #[prost(message, optional, tag = "401")]
    pub new_listing: Option<NewListingPush>,
    #[prost(message, optional, tag = "402")]
    pub symbol_status: Option<SymbolStatusPush>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NewListingPush {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(string, tag = "2")]
    pub base_asset: String,
    #[prost(string, tag = "3")]
    pub quote_asset: String,
    #[prost(int64, optional, tag = "4")]
    pub listing_time: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub trading_start_time: Option<i64>,
    #[prost(uint32, optional, tag = "6")]
    pub price_precision: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub qty_precision: Option<u32>,
    #[prost(string, optional, tag = "8")]
    pub tick_size: Option<String>,
    #[prost(string, optional, tag = "9")]
    pub step_size: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub min_qty: Option<String>,
    #[prost(string, optional, tag = "11")]
    pub max_qty: Option<String>,
    #[prost(string, optional, tag = "12")]
    pub min_notional: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolStatusPush {
    #[prost(string, tag = "1")]
    pub symbol: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(int64, optional, tag = "3")]
    pub trading_start_time: Option<i64>,
}

/// Splits a binary frame into messages. Falls back to a single bare message
/// when the frame is not length-prefixed.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<PushWrapper>, prost::DecodeError> {
    let mut buf = frame;
    let mut out = Vec::new();
    while buf.has_remaining() {
        match PushWrapper::decode_length_delimited(&mut buf) {
            Ok(m) => out.push(m),
            Err(e) if out.is_empty() => {
                return PushWrapper::decode(frame).map(|m| vec![m]).map_err(|_| e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

pub fn encode_frame(msgs: &[PushWrapper]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in msgs {
        out.extend(m.encode_length_delimited_to_vec());
    }
    out
}

impl PushWrapper {
    /// None for pushes that carry nothing we act on.
    pub fn to_raw(&self, received_at: i64) -> Option<RawListing> {
        if let Some(nl) = &self.new_listing {
            let ticker = if nl.symbol.is_empty() { self.symbol.clone()? } else { nl.symbol.clone() };
            let filters = ListingFilters {
                price_precision: nl.price_precision,
                qty_precision: nl.qty_precision,
                min_qty: nl.min_qty.as_deref().and_then(parse_decimal),
                max_qty: nl.max_qty.as_deref().and_then(parse_decimal),
                min_notional: nl.min_notional.as_deref().and_then(parse_decimal),
                tick_size: nl.tick_size.as_deref().and_then(parse_decimal),
                step_size: nl.step_size.as_deref().and_then(parse_decimal),
            };
            return Some(RawListing {
                kind: RawListingKind::NewListing,
                ticker: ticker.to_ascii_uppercase(),
                base: Some(nl.base_asset.clone()).filter(|s| !s.is_empty()),
                quote: Some(nl.quote_asset.clone()).filter(|s| !s.is_empty()),
                status: Some(SymbolStatus::PreListed),
                listing_ts: nl.listing_time,
                trading_ts: nl.trading_start_time,
                filters: Some(filters),
                received_at,
            });
        }
        if let Some(st) = &self.symbol_status {
            let ticker = if st.symbol.is_empty() { self.symbol.clone()? } else { st.symbol.clone() };
            let status = SymbolStatus::parse(&st.status)?;
            let kind = if status == SymbolStatus::Trading {
                RawListingKind::TradingOpen
            } else {
                RawListingKind::StatusChange
            };
            return Some(RawListing {
                kind,
                ticker: ticker.to_ascii_uppercase(),
                base: None,
                quote: None,
                status: Some(status),
                listing_ts: None,
                trading_ts: st.trading_start_time,
                filters: None,
                received_at,
            });
        }
        None
    }

    pub fn new_listing(symbol: &str, base: &str, quote: &str, trading_start_time: Option<i64>) -> Self {
        PushWrapper {
            channel: CHANNEL_NEW_LISTINGS.to_string(),
            symbol: Some(symbol.to_string()),
            send_time: None,
            new_listing: Some(NewListingPush {
                symbol: symbol.to_string(),
                base_asset: base.to_string(),
                quote_asset: quote.to_string(),
                trading_start_time,
                ..Default::default()
            }),
            symbol_status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Same wrapper as seen by a newer server that added fields.
    #[derive(Clone, PartialEq, Message)]
    struct FutureWrapper {
        #[prost(string, tag = "1")]
        channel: String,
        #[prost(string, optional, tag = "3")]
        symbol: Option<String>,
        #[prost(message, optional, tag = "401")]
        new_listing: Option<NewListingPush>,
        #[prost(string, tag = "900")]
        region: String,
        #[prost(uint64, tag = "901")]
        sequence: u64,
    }

    #[test]
    fn decodes_multiple_length_prefixed_messages() {
        let a = PushWrapper::new_listing("FOOUSDT", "FOO", "USDT", Some(1_000));
        let b = PushWrapper {
            channel: CHANNEL_SYMBOL_STATUS.to_string(),
            symbol: Some("FOOUSDT".into()),
            send_time: Some(5),
            new_listing: None,
            symbol_status: Some(SymbolStatusPush {
                symbol: "FOOUSDT".into(),
                status: "TRADING".into(),
                trading_start_time: Some(1_000),
            }),
        };
        let frame = encode_frame(&[a.clone(), b.clone()]);
        let msgs = decode_frame(&frame).expect("decode");
        assert_eq!(msgs, vec![a, b]);

        let raw = msgs[1].to_raw(7).expect("raw");
        assert_eq!(raw.kind, RawListingKind::TradingOpen);
        assert_eq!(raw.status, Some(SymbolStatus::Trading));
        assert_eq!(raw.received_at, 7);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let fut = FutureWrapper {
            channel: CHANNEL_NEW_LISTINGS.into(),
            symbol: Some("BARUSDT".into()),
            new_listing: Some(NewListingPush {
                symbol: "BARUSDT".into(),
                base_asset: "BAR".into(),
                quote_asset: "USDT".into(),
                step_size: Some("0.1".into()),
                min_notional: Some("5".into()),
                ..Default::default()
            }),
            region: "sg".into(),
            sequence: 99,
        };
        let frame = fut.encode_length_delimited_to_vec();
        let msgs = decode_frame(&frame).expect("decode");
        let raw = msgs[0].to_raw(1).expect("raw");
        assert_eq!(raw.ticker, "BARUSDT");
        assert_eq!(raw.kind, RawListingKind::NewListing);
        let f = raw.filters.expect("filters");
        assert_eq!(f.step_size, Some(dec!(0.1)));
        assert_eq!(f.min_notional, Some(dec!(5)));
    }

    #[test]
    fn bare_message_frame_is_accepted() {
        let a = PushWrapper::new_listing("BAZUSDT", "BAZ", "USDT", None);
        let frame = a.encode_to_vec();
        let msgs = decode_frame(&frame).expect("decode");
        assert_eq!(msgs, vec![a]);
    }

    #[test]
    fn unknown_status_is_ignored() {
        let w = PushWrapper {
            channel: CHANNEL_SYMBOL_STATUS.into(),
            symbol: None,
            send_time: None,
            new_listing: None,
            symbol_status: Some(SymbolStatusPush {
                symbol: "FOOUSDT".into(),
                status: "MAINTENANCE_WINDOW".into(),
                trading_start_time: None,
            }),
        };
        assert!(w.to_raw(1).is_none());
    }
}
