//! Cost rollup: subtotals → discount → tax → total.
//!
//! Fixed-point decimal arithmetic: currency at 2 decimal places, tax rate at 3.
//! Rounding is half-up (midpoint away from zero; all amounts are non-negative).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CURRENCY_DP: u32 = 2;
const RATE_DP: u32 = 3;

pub(crate) fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Sum amounts, failing instead of panicking when the result is out of range.
pub(crate) fn checked_sum<I>(amounts: I) -> Result<Decimal, CostError>
where
    I: IntoIterator<Item = Decimal>,
{
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| overflow("subtotal", acc.checked_add(v)))
}

pub(crate) fn overflow(what: &str, value: Option<Decimal>) -> Result<Decimal, CostError> {
    value.ok_or_else(|| CostError::Validation(format!("{what} is out of range")))
}

pub(crate) fn round_rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(RATE_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CostError {
    /// A subtotal component is negative. Subtotals are sums of non-negative
    /// line items, so this points at a bug upstream.
    #[error("negative subtotal: {component} = {value}")]
    NegativeSubtotal {
        component: &'static str,
        value: Decimal,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    #[default]
    None,
    Percent,
    Amount,
}

/// Discount as stored on the work order (`discount_type` + `discount_value`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Discount {
    pub discount_type: DiscountType,
    pub value: Decimal,
}

impl Discount {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn percent(value: Decimal) -> Self {
        Self {
            discount_type: DiscountType::Percent,
            value,
        }
    }

    pub fn amount(value: Decimal) -> Self {
        Self {
            discount_type: DiscountType::Amount,
            value,
        }
    }

    pub fn validate(&self) -> Result<(), CostError> {
        if self.value.is_sign_negative() && !self.value.is_zero() {
            return Err(CostError::Validation(
                "discount_value cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the total depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CostInputs {
    pub labor_subtotal: Decimal,
    pub parts_subtotal: Decimal,
    pub fees_subtotal: Decimal,
    pub discount: Discount,
    pub tax_rate_percent: Decimal,
}

/// Authoritative cost figures of a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub labor_subtotal: Decimal,
    pub parts_subtotal: Decimal,
    pub fees_subtotal: Decimal,
    pub subtotal: Decimal,
    pub discount: Discount,
    pub discount_amount: Decimal,
    pub taxable_amount: Decimal,
    pub tax_rate_percent: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

/// Compute the cost breakdown.
///
/// 1. `subtotal = labor + parts + fees`
/// 2. `discount_amount`: percent of subtotal, fixed amount, or zero; rounded
///    to cents and clamped to `[0, subtotal]`
/// 3. `taxable = subtotal - discount_amount`
/// 4. `tax_amount = taxable * rate / 100`, rounded half-up to cents
/// 5. `total = taxable + tax_amount`
pub fn compute_costs(inputs: &CostInputs) -> Result<CostBreakdown, CostError> {
    for (component, value) in [
        ("labor_subtotal", inputs.labor_subtotal),
        ("parts_subtotal", inputs.parts_subtotal),
        ("fees_subtotal", inputs.fees_subtotal),
    ] {
        if value < Decimal::ZERO {
            return Err(CostError::NegativeSubtotal { component, value });
        }
    }
    inputs.discount.validate()?;
    if inputs.tax_rate_percent < Decimal::ZERO {
        return Err(CostError::Validation(
            "tax_rate_percent cannot be negative".to_string(),
        ));
    }

    let subtotal = checked_sum([
        inputs.labor_subtotal,
        inputs.parts_subtotal,
        inputs.fees_subtotal,
    ])?;

    let raw_discount = match inputs.discount.discount_type {
        DiscountType::None => Decimal::ZERO,
        DiscountType::Percent => {
            overflow("discount", subtotal.checked_mul(inputs.discount.value))? / Decimal::ONE_HUNDRED
        }
        DiscountType::Amount => inputs.discount.value,
    };
    let discount_amount = round_currency(raw_discount).clamp(Decimal::ZERO, subtotal);

    let taxable_amount = subtotal - discount_amount;
    let tax_rate_percent = round_rate(inputs.tax_rate_percent);
    let tax_amount = round_currency(
        overflow("tax_amount", taxable_amount.checked_mul(tax_rate_percent))? / Decimal::ONE_HUNDRED,
    );
    let total_amount = overflow("total_amount", taxable_amount.checked_add(tax_amount))?;

    Ok(CostBreakdown {
        labor_subtotal: inputs.labor_subtotal,
        parts_subtotal: inputs.parts_subtotal,
        fees_subtotal: inputs.fees_subtotal,
        subtotal,
        discount: inputs.discount,
        discount_amount,
        taxable_amount,
        tax_rate_percent,
        tax_amount,
        total_amount,
    })
}
