use super::LatencyHistogram;
use crate::error::{AppError, AppResult};

#[test]
fn encoded_histogram_decodes_to_same_distribution() -> AppResult<()> {
    let mut histogram = LatencyHistogram::new()?;
    for value in [120, 250, 250, 980, 15_000] {
        histogram.record(value)?;
    }
    let decoded = LatencyHistogram::decode_base64(&histogram.encode_base64()?)?;
    if decoded != histogram {
        return Err(AppError::metrics("Decoded histogram differs"));
    }
    if decoded.count() != 5 {
        return Err(AppError::metrics(format!(
            "Expected 5 samples, got {}",
            decoded.count()
        )));
    }
    Ok(())
}

#[test]
fn decoded_histogram_accepts_values_beyond_original_range() -> AppResult<()> {
    let mut small = LatencyHistogram::new()?;
    small.record(10)?;
    let mut decoded = LatencyHistogram::decode_base64(&small.encode_base64()?)?;
    decoded.record(50_000_000)?;
    let mut large = LatencyHistogram::new()?;
    large.record(90_000_000)?;
    decoded.merge(&large)?;
    if decoded.count() != 3 {
        return Err(AppError::metrics("Expected auto-resize after decode"));
    }
    Ok(())
}

#[test]
fn empty_histogram_reports_zeroes() -> AppResult<()> {
    let histogram = LatencyHistogram::new()?;
    if histogram.percentiles() != (0, 0, 0) || histogram.max() != 0 {
        return Err(AppError::metrics("Empty histogram must report zeroes"));
    }
    Ok(())
}

#[test]
fn invalid_payload_is_rejected() -> AppResult<()> {
    if LatencyHistogram::decode_base64("not base64!").is_ok() {
        return Err(AppError::metrics("Expected invalid base64 to fail"));
    }
    if LatencyHistogram::decode_base64("SGlzdG9ncmFt").is_ok() {
        return Err(AppError::metrics("Expected invalid histogram bytes to fail"));
    }
    Ok(())
}
