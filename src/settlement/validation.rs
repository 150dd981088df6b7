//! Data-quality checks on settlement summaries.
//!
//! Hard errors reject a summary; warnings only flag it for review.

use super::{DailyModeSummary, ModeKey};
use crate::domain::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub pnl_min: Decimal,
    pub pnl_max: Decimal,
    pub max_trade_count: i64,
    /// Largest tolerated gap between stored and exchange unrealized P&L.
    pub unrealized_diff: Decimal,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            pnl_min: Decimal::from_i64(-10_000),
            pnl_max: Decimal::from_i64(10_000),
            max_trade_count: 500,
            unrealized_diff: Decimal::from_i64(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A summary that failed hard validation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("validation failed for {mode}: {}", .errors.join("; "))]
pub struct ValidationFailure {
    pub mode: ModeKey,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DataValidator {
    config: ValidationConfig,
}

impl DataValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Check one summary. `ALL` rows are derived and never checked.
    pub fn validate_summary(&self, summary: &DailyModeSummary) -> ValidationResult {
        let mut result = ValidationResult::default();
        if summary.mode.is_all() {
            return result;
        }

        let hundred = Decimal::hundred();
        if summary.win_rate.is_negative() || summary.win_rate > hundred {
            result.errors.push(format!(
                "Invalid win rate: {:.2}% (must be 0-100)",
                summary.win_rate.inner()
            ));
        }
        // Break-even trades count toward neither side, so only an excess is inconsistent
        if summary.win_count + summary.loss_count > summary.trade_count {
            result.errors.push(format!(
                "Win+Loss count mismatch: {} wins + {} losses > {} total trades",
                summary.win_count, summary.loss_count, summary.trade_count
            ));
        }
        if summary.trade_count < 0 {
            result
                .errors
                .push(format!("Negative trade count: {}", summary.trade_count));
        }

        if summary.total_pnl < self.config.pnl_min {
            result.warnings.push(format!(
                "Large loss: ${:.2} (below threshold ${:.2})",
                summary.total_pnl.inner(),
                self.config.pnl_min.inner()
            ));
        }
        if summary.total_pnl > self.config.pnl_max {
            result.warnings.push(format!(
                "Large profit: ${:.2} (above threshold ${:.2})",
                summary.total_pnl.inner(),
                self.config.pnl_max.inner()
            ));
        }
        if summary.trade_count > self.config.max_trade_count {
            result.warnings.push(format!(
                "High trade count: {} (threshold: {})",
                summary.trade_count, self.config.max_trade_count
            ));
        }
        if summary.largest_win.is_negative() {
            result.warnings.push(format!(
                "Suspicious largest win: ${:.2} (negative value)",
                summary.largest_win.inner()
            ));
        }
        if summary.largest_loss.is_positive() && summary.loss_count > 0 {
            result.warnings.push(format!(
                "Suspicious largest loss: ${:.2} (positive value)",
                summary.largest_loss.inner()
            ));
        }
        if summary.total_volume.is_negative() {
            result.warnings.push(format!(
                "Negative volume: ${:.2}",
                summary.total_volume.inner()
            ));
        }

        result
    }

    /// Warn when stored unrealized P&L drifts from the exchange's figure.
    pub fn validate_unrealized_pnl(&self, stored: Decimal, actual: Decimal) -> ValidationResult {
        let mut result = ValidationResult::default();
        let diff = (stored - actual).abs();
        if diff > self.config.unrealized_diff {
            result.warnings.push(format!(
                "Unrealized P&L mismatch: Stored=${:.2}, Exchange=${:.2} (diff: ${:.2})",
                stored.inner(),
                actual.inner(),
                diff.inner()
            ));
        }
        result
    }

    /// Copy warnings onto the summary's quality flag and notes.
    pub fn apply(&self, summary: &mut DailyModeSummary, result: &ValidationResult) {
        if !result.warnings.is_empty() {
            summary.data_quality_flag = true;
            summary.data_quality_notes = Some(result.warnings.join("; "));
        }
    }

    /// Validate, apply warnings, and reject on hard errors.
    ///
    /// # Errors
    /// Returns the hard errors when the summary is invalid. Warnings are applied either way.
    pub fn validate_and_apply(
        &self,
        summary: &mut DailyModeSummary,
    ) -> Result<ValidationResult, ValidationFailure> {
        let result = self.validate_summary(summary);
        self.apply(summary, &result);
        if result.is_valid() {
            Ok(result)
        } else {
            Err(ValidationFailure {
                mode: summary.mode,
                errors: result.errors,
            })
        }
    }

    /// Validate and apply every summary. Returns per-summary results and whether all passed.
    pub fn batch_validate(&self, summaries: &mut [DailyModeSummary]) -> (Vec<ValidationResult>, bool) {
        let mut all_valid = true;
        let results = summaries
            .iter_mut()
            .map(|summary| {
                let result = self.validate_summary(summary);
                self.apply(summary, &result);
                all_valid &= result.is_valid();
                result
            })
            .collect();
        (results, all_valid)
    }
}
