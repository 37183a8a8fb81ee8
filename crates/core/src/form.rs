use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::InvoiceStatus;

/// Raw invoice form fields as submitted by the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvoiceForm {
    #[serde(rename = "customerId", default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Invoice fields after validation and cents conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInvoice {
    pub customer_id: String,
    pub amount_cents: i64,
    pub status: InvoiceStatus,
}

/// Per-field validation messages, keyed by the form field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<&'static str, Vec<String>>);

impl FieldErrors {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.keys().copied()
    }
}

/// Validates the submitted form and converts the amount into cents.
///
/// A blank or missing amount coerces to zero. Non-numeric, non-finite and
/// negative amounts are rejected, as is any status other than `pending` or
/// `paid`. Every failing field is reported, not just the first one.
pub fn validate(form: &InvoiceForm) -> Result<ValidatedInvoice, FieldErrors> {
    let mut errors = FieldErrors::default();

    let customer_id = match form.customer_id.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => {
            errors.push("customerId", "Please select a customer.");
            None
        }
    };

    let amount_cents = match coerce_amount(form.amount.as_deref()) {
        Ok(cents) => Some(cents),
        Err(message) => {
            errors.push("amount", message);
            None
        }
    };

    let status = match form.status.as_deref().map(str::parse::<InvoiceStatus>) {
        Some(Ok(status)) => Some(status),
        _ => {
            errors.push("status", "Please select an invoice status.");
            None
        }
    };

    match (customer_id, amount_cents, status) {
        (Some(customer_id), Some(amount_cents), Some(status)) => Ok(ValidatedInvoice {
            customer_id,
            amount_cents,
            status,
        }),
        _ => Err(errors),
    }
}

fn coerce_amount(raw: Option<&str>) -> Result<i64, &'static str> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    let amount = if trimmed.is_empty() {
        0.0
    } else {
        trimmed
            .parse::<f64>()
            .map_err(|_| "Please enter a numeric amount.")?
    };

    if !amount.is_finite() {
        return Err("Please enter a numeric amount.");
    }
    if amount < 0.0 {
        return Err("Please enter an amount of zero or more.");
    }

    to_cents(amount).ok_or("Amount is too large.")
}

/// Converts a decimal currency amount into integer cents, rounding to the
/// nearest cent.
pub fn to_cents(amount: f64) -> Option<i64> {
    let cents = (amount * 100.0).round();
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range.
    if cents >= i64::MAX as f64 || cents < i64::MIN as f64 {
        return None;
    }
    Some(cents as i64)
}
