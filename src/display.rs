//! Display formatting for dashboard values.
//!
//! Turns a [`ReconciledMetric`] (or its absence) into the text and state a
//! frontend shows. A zero is only ever shown as a confirmed zero; a value
//! whose sources could not be re-read is flagged as possibly stale, and a
//! metric that was never computed is unavailable rather than `R$ 0,00`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::Metric;
use crate::models::{MetricSource, ReconciledMetric};

/// Amounts below half a cent render as zero.
const ZERO_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Locale {
    #[default]
    #[serde(rename = "pt-BR")]
    PtBr,
    #[serde(rename = "en-US")]
    EnUs,
}

impl Locale {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pt-br" | "pt" => Some(Locale::PtBr),
            "en-us" | "en" => Some(Locale::EnUs),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Locale::PtBr => "pt-BR",
            Locale::EnUs => "en-US",
        }
    }

    fn separators(&self) -> (char, char) {
        match self {
            Locale::PtBr => ('.', ','),
            Locale::EnUs => (',', '.'),
        }
    }

    fn currency_prefix(&self) -> &'static str {
        match self {
            Locale::PtBr => "R$ ",
            Locale::EnUs => "$",
        }
    }

    fn unavailable_text(&self) -> &'static str {
        match self {
            Locale::PtBr => "indisponível",
            Locale::EnUs => "unavailable",
        }
    }

    fn stale_note(&self) -> &'static str {
        match self {
            Locale::PtBr => "pode estar desatualizado",
            Locale::EnUs => "may be out of date",
        }
    }
}

fn group_digits(mut whole: u64, separator: char) -> String {
    let mut groups = Vec::new();
    loop {
        groups.push(whole % 1000);
        whole /= 1000;
        if whole == 0 {
            break;
        }
    }
    let mut out = String::new();
    for (i, group) in groups.iter().rev().enumerate() {
        if i == 0 {
            out.push_str(&group.to_string());
        } else {
            out.push(separator);
            out.push_str(&format!("{group:03}"));
        }
    }
    out
}

/// Split into sign, whole and two-digit fraction, rounding to cents.
fn to_cents(value: f64) -> (bool, u64, u64) {
    let cents = (value.abs() * 100.0).round() as u64;
    (value < 0.0 && cents > 0, cents / 100, cents % 100)
}

/// `pt-BR`: `R$ 1.234,56`; `en-US`: `$1,234.56`. Negatives get a leading
/// minus before the symbol.
pub fn format_currency(value: f64, locale: Locale) -> String {
    let (negative, whole, fraction) = to_cents(value);
    let (group, decimal) = locale.separators();
    format!(
        "{}{}{}{decimal}{fraction:02}",
        if negative { "-" } else { "" },
        locale.currency_prefix(),
        group_digits(whole, group),
    )
}

/// Whole quantities without decimals, fractional ones with two, followed by
/// the unit when known.
pub fn format_quantity(value: f64, unit: Option<&str>, locale: Locale) -> String {
    let (group, decimal) = locale.separators();
    let number = if (value.round() - value).abs() < f64::EPSILON {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}{}", group_digits(value.abs().round() as u64, group))
    } else {
        let (negative, whole, fraction) = to_cents(value);
        format!(
            "{}{}{decimal}{fraction:02}",
            if negative { "-" } else { "" },
            group_digits(whole, group)
        )
    };
    match unit.map(str::trim).filter(|u| !u.is_empty()) {
        Some(unit) => format!("{number} {unit}"),
        None => number,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Confirmed,
    ConfirmedZero,
    PossiblyStale,
    Unavailable,
}

/// What a dashboard card shows for one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDisplay {
    pub metric_key: String,
    pub label: String,
    pub state: DisplayState,
    pub text: String,
    pub note: Option<String>,
    pub computed_at: Option<DateTime<Utc>>,
}

pub fn display_state(metric: Option<&ReconciledMetric>) -> DisplayState {
    match metric {
        None => DisplayState::Unavailable,
        Some(m) if m.source == MetricSource::Stale => DisplayState::PossiblyStale,
        Some(m) if m.value.abs() < ZERO_EPSILON => DisplayState::ConfirmedZero,
        Some(_) => DisplayState::Confirmed,
    }
}

pub fn render_metric(
    metric: Metric,
    value: Option<&ReconciledMetric>,
    locale: Locale,
) -> MetricDisplay {
    let state = display_state(value);
    let text = match value {
        Some(m) => format_currency(m.value, locale),
        None => locale.unavailable_text().to_string(),
    };
    let note = match state {
        DisplayState::PossiblyStale => Some(locale.stale_note().to_string()),
        _ => None,
    };
    MetricDisplay {
        metric_key: metric.key().to_string(),
        label: metric.label().to_string(),
        state,
        text,
        note,
        computed_at: value.map(|m| m.computed_at),
    }
}
