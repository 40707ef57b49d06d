//! Shared fixtures for unit tests

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use crate::instrument::{Instrument, InstrumentKind};
use crate::types::{Money, Symbol};

pub(crate) fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn base_instrument(symbol: &str, kind: InstrumentKind) -> Instrument {
    Instrument {
        symbol: Symbol::new(symbol),
        kind,
        root_symbol: "XBT".into(),
        underlying: "XBT".into(),
        quote_currency: "USD".into(),
        settle_currency: "XBt".into(),
        lot_size: Money::ONE,
        tick_size: Money::from_f64(0.5),
        maker_fee: Money::from_f64(-0.00025),
        taker_fee: Money::from_f64(0.00075),
        init_margin_rate: Money::from_f64(0.01),
        maint_margin_rate: Money::from_f64(0.005),
        listing_date: Some(utc(2016, 5, 4, 12, 0)),
        front_date: Some(utc(2016, 5, 4, 12, 0)),
        expiry_date: None,
        settle_date: None,
        settlement_fee: Money::ZERO,
        reference: "BMEX".into(),
        reference_symbol: ".BXBT".into(),
        deleverage: true,
    }
}

/// Perpetual contract with the vendor's flagship rates
/// (init 0.01, maint 0.005, taker 0.00075, maker -0.00025)
pub(crate) fn perpetual_instrument() -> Arc<Instrument> {
    Arc::new(base_instrument("XBTUSD", InstrumentKind::Perpetual))
}

/// Fixed-expiry future with init 0.05, maint 0.025, taker 0.0025
pub(crate) fn future_instrument() -> Arc<Instrument> {
    let mut instrument = base_instrument("TRXH19", InstrumentKind::Future);
    instrument.root_symbol = "TRX".into();
    instrument.underlying = "TRX".into();
    instrument.quote_currency = "XBT".into();
    instrument.maker_fee = Money::from_f64(-0.0005);
    instrument.taker_fee = Money::from_f64(0.0025);
    instrument.init_margin_rate = Money::from_f64(0.05);
    instrument.maint_margin_rate = Money::from_f64(0.025);
    instrument.expiry_date = Some(utc(2019, 3, 29, 12, 0));
    instrument.settle_date = Some(utc(2019, 3, 29, 12, 0));
    instrument.reference_symbol = ".TRXXBT30M".into();
    Arc::new(instrument)
}
