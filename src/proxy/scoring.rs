//! Proxy quality scoring

use crate::proxy::models::ProxyRecord;

/// Maps a record's observations onto a 0-100 quality score
pub trait ScoringPolicy: Send + Sync {
    fn score(&self, record: &ProxyRecord) -> f64;
}

/// Weighted score: success rate 50%, latency 30%, stability 20%
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScoring;

impl DefaultScoring {
    const SUCCESS_WEIGHT: f64 = 50.0;
    const LATENCY_WEIGHT: f64 = 30.0;
    const STABILITY_WEIGHT: f64 = 20.0;
    /// Response times at or above this many seconds earn no latency points
    const LATENCY_CEILING_SECS: f64 = 10.0;
    /// Successes needed for the full stability component
    const STABLE_SUCCESSES: f64 = 10.0;

    fn success_component(record: &ProxyRecord) -> f64 {
        if record.total_requests() > 0 {
            record.success_rate() * Self::SUCCESS_WEIGHT
        } else {
            Self::SUCCESS_WEIGHT / 2.0
        }
    }

    fn latency_component(record: &ProxyRecord) -> f64 {
        if record.response_time > 0.0 {
            ((Self::LATENCY_CEILING_SECS - record.response_time) / Self::LATENCY_CEILING_SECS
                * Self::LATENCY_WEIGHT)
                .clamp(0.0, Self::LATENCY_WEIGHT)
        } else {
            Self::LATENCY_WEIGHT / 2.0
        }
    }

    fn stability_component(record: &ProxyRecord) -> f64 {
        (f64::from(record.success_count) / Self::STABLE_SUCCESSES * Self::STABILITY_WEIGHT)
            .min(Self::STABILITY_WEIGHT)
    }
}

impl ScoringPolicy for DefaultScoring {
    fn score(&self, record: &ProxyRecord) -> f64 {
        let score = Self::success_component(record)
            + Self::latency_component(record)
            + Self::stability_component(record);
        score.clamp(0.0, 100.0)
    }
}
