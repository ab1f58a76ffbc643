//! Currency precision and rounding

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of minor-unit digits for an ISO 4217 currency code.
///
/// Unknown currencies default to 2.
pub fn currency_precision(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "UYI" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Round half away from zero to the currency's precision
pub fn round_to_currency(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(currency_precision(currency), RoundingStrategy::MidpointAwayFromZero)
}
