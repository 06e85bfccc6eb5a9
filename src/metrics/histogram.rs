use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hdrhistogram::Histogram;
use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use std::io::Cursor;

use crate::error::{AppError, AppResult, MetricsError};

const SIGNIFICANT_DIGITS: u8 = 3;

/// Auto-resizing HDR histogram of latency values (microseconds by convention).
///
/// Merging is a commutative monoid: the empty histogram is the identity and
/// `merge` only sums bucket counts, so arrival order never changes the result.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
}

fn histogram_error<E>(context: &'static str, err: E) -> AppError
where
    E: std::error::Error + Send + Sync + 'static,
{
    AppError::metrics(MetricsError::Histogram {
        context,
        source: Box::new(err),
    })
}

impl LatencyHistogram {
    /// Create a new latency histogram.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be created.
    pub fn new() -> AppResult<Self> {
        let hist = Histogram::<u64>::new(SIGNIFICANT_DIGITS)
            .map_err(|err| histogram_error("create histogram", err))?;
        Ok(Self { hist })
    }

    /// Record a latency value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be recorded.
    pub fn record(&mut self, value: u64) -> AppResult<()> {
        self.hist
            .record(value.max(1))
            .map_err(|err| histogram_error("record latency", err))
    }

    /// Merge another histogram into this one.
    ///
    /// # Errors
    ///
    /// Returns an error if the merge fails.
    pub fn merge(&mut self, other: &LatencyHistogram) -> AppResult<()> {
        self.hist
            .add(&other.hist)
            .map_err(|err| histogram_error("merge histogram", err))
    }

    pub fn reset(&mut self) {
        self.hist.reset();
    }

    #[must_use]
    pub fn percentiles(&self) -> (u64, u64, u64) {
        if self.is_empty() {
            return (0, 0, 0);
        }

        (
            self.hist.value_at_quantile(0.5),
            self.hist.value_at_quantile(0.9),
            self.hist.value_at_quantile(0.99),
        )
    }

    #[must_use]
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.hist.value_at_quantile(quantile)
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        if self.is_empty() { 0 } else { self.hist.max() }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    /// Recorded buckets as `(highest equivalent value, count)` pairs.
    #[must_use]
    pub fn distribution(&self) -> Vec<(u64, u64)> {
        self.hist
            .iter_recorded()
            .map(|bucket| (bucket.value_iterated_to(), bucket.count_at_value()))
            .collect()
    }

    /// Encode the histogram as base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be serialized.
    pub fn encode_base64(&self) -> AppResult<String> {
        let mut buffer = Vec::new();
        V2Serializer::new()
            .serialize(&self.hist, &mut buffer)
            .map_err(|err| histogram_error("serialize histogram", err))?;
        Ok(B64.encode(buffer))
    }

    /// Decode a base64 histogram payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded or deserialized.
    pub fn decode_base64(encoded: &str) -> AppResult<Self> {
        let bytes = B64
            .decode(encoded.as_bytes())
            .map_err(|err| histogram_error("decode histogram", err))?;
        let mut cursor = Cursor::new(bytes);
        let mut hist: Histogram<u64> = Deserializer::new()
            .deserialize(&mut cursor)
            .map_err(|err| histogram_error("deserialize histogram", err))?;
        hist.auto(true);
        Ok(Self { hist })
    }
}

/// Equal when both hold the same recorded distribution, regardless of the
/// internal bucket array size.
impl PartialEq for LatencyHistogram {
    fn eq(&self, other: &Self) -> bool {
        self.count() == other.count() && self.distribution() == other.distribution()
    }
}

impl Eq for LatencyHistogram {}
