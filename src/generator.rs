//! Synthetic deal payloads.
//!
//! Pure value construction: nothing in here performs I/O. The only ambient
//! inputs are the wall clock and the thread-local RNG, and both can be
//! supplied explicitly through [`DealGenerator::generate_with`].

use chrono::{DateTime, Local};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Currencies deals are drawn from.
pub const CURRENCIES: [&str; 10] = [
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "CAD", "NZD", "SEK", "NOK",
];

/// Timestamp layout expected by the import API.
pub const DEAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Leading segment of every generated deal id.
pub const DEAL_ID_PREFIX: &str = "FX";

/// One FX deal as sent to the import endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealPayload {
    pub deal_id: String,
    pub from_currency: String,
    pub to_currency: String,
    pub deal_timestamp: String,
    /// Decimal string with exactly two fraction digits.
    pub deal_amount: String,
}

/// Fields a caller wants pinned instead of generated.
#[derive(Debug, Clone, Default)]
pub struct DealOverrides {
    pub deal_id: Option<String>,
    pub from_currency: Option<String>,
    pub to_currency: Option<String>,
    pub deal_amount: Option<String>,
    pub deal_timestamp: Option<String>,
}

/// Who is generating: the VU and its own iteration counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub vu_id: u64,
    pub iteration: u64,
}

/// Builds deal payloads that are unique per run and valid for the import API.
#[derive(Debug, Clone)]
pub struct DealGenerator {
    min_amount: f64,
    max_amount: f64,
}

impl DealGenerator {
    /// Amounts are drawn from `[min_amount, max_amount]`.
    ///
    /// The range is expected to be validated already
    /// (see [`crate::config_validation::LoadModelValidator::validate_amount_range`]).
    pub fn new(min_amount: f64, max_amount: f64) -> Self {
        Self {
            min_amount,
            max_amount,
        }
    }

    /// Generates one payload using the thread RNG and the local clock.
    pub fn generate_payload(&self, identity: WorkerIdentity, overrides: DealOverrides) -> DealPayload {
        self.generate_with(
            &mut rand::thread_rng(),
            Local::now(),
            identity,
            None,
            overrides,
        )
    }

    /// Generates `size` payloads for one batch request.
    ///
    /// Items share the worker identity, so each carries its position in the
    /// batch as part of the deal id.
    pub fn generate_batch(&self, identity: WorkerIdentity, size: usize) -> Vec<DealPayload> {
        let mut rng = rand::thread_rng();
        let now = Local::now();
        (0..size)
            .map(|item| {
                self.generate_with(&mut rng, now, identity, Some(item), DealOverrides::default())
            })
            .collect()
    }

    /// Deterministic core of payload generation.
    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: DateTime<Local>,
        identity: WorkerIdentity,
        item: Option<usize>,
        overrides: DealOverrides,
    ) -> DealPayload {
        let (from_currency, to_currency) =
            self.currency_pair(rng, overrides.from_currency, overrides.to_currency);

        DealPayload {
            deal_id: overrides
                .deal_id
                .unwrap_or_else(|| self.deal_id(rng, identity, item, now)),
            from_currency,
            to_currency,
            deal_timestamp: overrides
                .deal_timestamp
                .unwrap_or_else(|| now.format(DEAL_TIMESTAMP_FORMAT).to_string()),
            deal_amount: overrides.deal_amount.unwrap_or_else(|| self.amount(rng)),
        }
    }

    /// `FX-{vu}-{iteration}[.{item}]-{epoch_ms}-{random base36}`.
    pub fn deal_id<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        identity: WorkerIdentity,
        item: Option<usize>,
        now: DateTime<Local>,
    ) -> String {
        let iteration = match item {
            Some(i) => format!("{}.{}", identity.iteration, i),
            None => identity.iteration.to_string(),
        };
        format!(
            "{}-{}-{}-{}-{}",
            DEAL_ID_PREFIX,
            identity.vu_id,
            iteration,
            now.timestamp_millis(),
            to_base36(rng.gen_range(0..1_000_000_000u64))
        )
    }

    /// Draws a currency pair with `from != to`.
    ///
    /// A colliding draw for the second currency is shifted one position in
    /// [`CURRENCIES`] instead of being re-rolled. Explicit overrides are
    /// taken as given.
    pub fn currency_pair<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        from_override: Option<String>,
        to_override: Option<String>,
    ) -> (String, String) {
        let n = CURRENCIES.len();

        let (from, from_idx) = match from_override {
            Some(code) => {
                let idx = CURRENCIES.iter().position(|c| *c == code);
                (code, idx)
            }
            None => {
                let idx = rng.gen_range(0..n);
                (CURRENCIES[idx].to_string(), Some(idx))
            }
        };

        let to = match to_override {
            Some(code) => code,
            None => {
                let mut to_idx = rng.gen_range(0..n);
                if Some(to_idx) == from_idx {
                    to_idx = (to_idx + 1) % n;
                }
                CURRENCIES[to_idx].to_string()
            }
        };

        (from, to)
    }

    /// Uniform amount in range, rounded half away from zero to whole cents.
    pub fn amount<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let min_cents = (self.min_amount * 100.0).ceil() as i64;
        let max_cents = (self.max_amount * 100.0).floor() as i64;

        let raw = if self.max_amount > self.min_amount {
            rng.gen_range(self.min_amount..=self.max_amount)
        } else {
            self.min_amount
        };

        let cents = ((raw * 100.0).round() as i64).clamp(min_cents, max_cents.max(min_cents));
        format!("{}.{:02}", cents / 100, cents % 100)
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn deal_id_embeds_identity() {
        let gen = DealGenerator::new(10.0, 100.0);
        let mut rng = StdRng::seed_from_u64(7);
        let id = gen.deal_id(
            &mut rng,
            WorkerIdentity {
                vu_id: 3,
                iteration: 42,
            },
            None,
            Local::now(),
        );
        assert!(id.starts_with("FX-3-42-"), "id was {}", id);
    }

    #[test]
    fn overridden_from_currency_still_avoids_collision() {
        let gen = DealGenerator::new(10.0, 100.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..500 {
            let (from, to) = gen.currency_pair(&mut rng, Some("USD".to_string()), None);
            assert_eq!(from, "USD");
            assert_ne!(to, "USD");
        }
    }
}
