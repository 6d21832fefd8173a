use serde::Deserialize;
use ulid::Ulid;

use crate::model::Charges;

/// Request-scoped pricing hints. Every field is consumed by the first computation that
/// reads it, so a context must be rebuilt for each request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PricingContext {
    /// Amount excluded from percentage tax for one total computation.
    #[serde(default, deserialize_with = "amount::deserialize_optional")]
    pub non_taxable_amount: Option<f64>,
    /// One-shot flag: compute the next total as if the booking carried no tax.
    #[serde(default)]
    pub taxable_for_room: bool,
    /// Rate season to stamp on periods created by the next save.
    #[serde(default)]
    pub season_override: Option<Ulid>,
}

impl PricingContext {
    pub fn with_non_taxable(amount: f64) -> Self {
        Self {
            non_taxable_amount: Some(amount),
            ..Self::default()
        }
    }
}

/// Sum of the stored room, extras and adjustment fields. No rounding.
pub fn subtotal(charges: &Charges) -> f64 {
    charges.room_price
        + charges.room_extras
        + charges.adjustment
        + charges.adjustment_rooms
        + charges.adjustment_extras
        + charges.adjustment_pets
        + charges.pets_price.unwrap_or(0.0)
}

/// Total including tax.
///
/// The non-taxable amount is subtracted (and rounded) before tax is applied, then added
/// back verbatim and rounded again. Both roundings are part of the published numbers
/// and must stay in this order.
pub fn total(charges: &Charges, ctx: &mut PricingContext) -> f64 {
    let mut total = subtotal(charges);

    let mut tax = charges.tax;
    if std::mem::take(&mut ctx.taxable_for_room) {
        tax = 0.0;
    }

    let excluded = ctx.non_taxable_amount.take().filter(|a| *a != 0.0);
    if let Some(amount) = excluded {
        total = (total - amount).round();
    }
    if tax != 0.0 {
        total += total * tax / 100.0;
    }
    if let Some(amount) = excluded {
        total = (total + amount).round();
    }
    total
}

/// Serde helpers for monetary input. Human-readable formats accept plain numbers or
/// strings with a leading `$`; binary formats read a bare `f64`.
pub mod amount {
    use serde::Deserialize;
    use serde::de::{self, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn parse<E: de::Error>(raw: &str) -> Result<Option<f64>, E> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
        if digits.is_empty() {
            return Ok(None);
        }
        digits
            .parse::<f64>()
            .map(Some)
            .map_err(|_| E::custom(format!("invalid amount: {raw:?}")))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        if !deserializer.is_human_readable() {
            return f64::deserialize(deserializer);
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => Ok(parse(&s)?.unwrap_or(0.0)),
        }
    }

    pub fn deserialize_optional<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        if !deserializer.is_human_readable() {
            return Option::<f64>::deserialize(deserializer);
        }
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(n)) => Ok(Some(n)),
            Some(Raw::Text(s)) => parse(&s),
        }
    }
}
