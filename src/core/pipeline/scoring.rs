use serde::{Deserialize, Serialize};

use crate::core::domain::{AiEvaluation, RunSummary, ScoreBreakdown, ScoringResult};

const BONUS_RATE: f64 = 0.05;
const PENALTY_RATE: f64 = 0.10;
const PENALTY_CAP_RATE: f64 = 0.30;
const PENALTY_PASS_RATE_THRESHOLD: f64 = 0.5;

/// Reference averages and blend weights for the hybrid score. Scoring is
/// pure: identical inputs always produce an identical `ScoringResult`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub reference_avg_time_ms: f64,
    pub reference_avg_memory_mb: f64,
    pub rule_weight: f64,
    pub ai_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            reference_avg_time_ms: 100.0,
            reference_avg_memory_mb: 50.0,
            rule_weight: 0.7,
            ai_weight: 0.3,
        }
    }
}

impl ScoringPolicy {
    pub fn score(
        &self,
        run: &RunSummary,
        max_points: f64,
        ai_evaluation: Option<&AiEvaluation>,
    ) -> ScoringResult {
        let max_points = if max_points.is_finite() {
            max_points.max(0.0)
        } else {
            0.0
        };
        let breakdown = self.breakdown(run, max_points);
        let rule_based_score = round2(
            (breakdown.base + breakdown.time_bonus + breakdown.memory_bonus - breakdown.penalty)
                .clamp(0.0, max_points),
        );

        let ai_score = ai_evaluation.map(|e| round2(ai_score(e.quality, e.clarity)));
        let final_score = match ai_score {
            Some(ai_score) => round2(self.rule_weight * rule_based_score + self.ai_weight * ai_score),
            None => rule_based_score,
        };

        ScoringResult {
            rule_based_score,
            ai_score,
            final_score,
            breakdown: ScoreBreakdown {
                base: round2(breakdown.base),
                time_bonus: round2(breakdown.time_bonus),
                memory_bonus: round2(breakdown.memory_bonus),
                penalty: round2(breakdown.penalty),
                pass_rate_percent: breakdown.pass_rate_percent,
            },
        }
    }

    fn breakdown(&self, run: &RunSummary, max_points: f64) -> ScoreBreakdown {
        if run.total_count == 0 {
            return ScoreBreakdown::default();
        }

        let pass_rate = run.pass_rate();
        let base = pass_rate * max_points;

        let time_bonus = if run.avg_time_ms < self.reference_avg_time_ms {
            base * BONUS_RATE
        } else {
            0.0
        };
        let memory_bonus = if run.max_memory_mb < self.reference_avg_memory_mb {
            base * BONUS_RATE
        } else {
            0.0
        };

        // Below a 50% pass rate every failed case costs 10% of base, capped at 30%.
        let penalty = if pass_rate < PENALTY_PASS_RATE_THRESHOLD {
            (run.failed_count() as f64 * base * PENALTY_RATE).min(base * PENALTY_CAP_RATE)
        } else {
            0.0
        };

        ScoreBreakdown {
            base,
            time_bonus,
            memory_bonus,
            penalty,
            pass_rate_percent: (pass_rate * 1000.0).round() / 10.0,
        }
    }
}

/// Maps the two 1-10 sub-scores onto 0-100.
pub fn ai_score(quality: f64, clarity: f64) -> f64 {
    let score = (quality + clarity) / 2.0 * 10.0;
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
