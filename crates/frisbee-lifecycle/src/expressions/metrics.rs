//! Metrics expressions
//!
//! A metrics expression points at a dashboard panel and describes when the
//! panel's metric is considered to have fired:
//!
//! ```text
//! avg() of query(wpFnYRwGk/2/bitrate, 15m, now) is below(14) for (1m) every(30s)
//! ```
//!
//! The parsed [`AlertDescriptor`] is not registered anywhere. See
//! [`crate::alerting`] for that.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use frisbee_common::Error;

use crate::Result;

/// Evaluation frequency when `every(..)` is omitted
pub const DEFAULT_EVALUATION_FREQUENCY: &str = "1m";

/// Stability window when `for (..)` is omitted
pub const DEFAULT_STABILITY_WINDOW: &str = "0s";

static METRICS_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<reducer>\w+)\(\)\s+of\s+query\((?P<dashboardUID>\w+)/(?P<panelID>\d+)/(?P<metric>.+),\s+(?P<from>\w+),\s+(?P<to>\w+)\)\s+is\s+(?P<evaluator>\w+)\((?P<params>-*\d*[\.,\s]*\d*)\)\s*(for\s+\((?P<for>\w+)\))*\s*(every\((?P<every>\w+)\))*\s*$",
    )
    .expect("metrics expression grammar is a valid regex")
});

/// Threshold check applied to the reduced metric
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluator {
    /// Operator in the vocabulary of the alerting backend (e.g. `lt`, `gt`)
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Vec<f64>,
}

impl std::fmt::Display for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params: Vec<String> = self.params.iter().map(f64::to_string).collect();
        write!(f, "{}({})", self.kind, params.join(","))
    }
}

/// A parsed metrics expression
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertDescriptor {
    pub dashboard_uid: String,
    pub panel_id: u32,
    pub metric: String,
    pub from: String,
    pub to: String,
    pub reducer: String,
    pub evaluator: Evaluator,
    pub every: String,
    pub for_duration: String,
}

/// Translate human words to the alerting backend's operators
pub fn evaluator_alias(word: &str) -> &str {
    match word {
        "below" => "lt",
        "above" => "gt",
        "novalue" => "no_value",
        other => other,
    }
}

fn parse_params(expr: &str, raw: &str) -> Result<Vec<f64>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(|p| {
            p.trim().parse::<f64>().map_err(|e| {
                Error::expression(expr, format!("erroneous parameter '{p}': {e}")).into()
            })
        })
        .collect()
}

/// Parse a metrics expression.
///
/// # Errors
///
/// An expression error if the text does not follow the grammar, the panel
/// id is not an unsigned integer, or a parameter is not a number.
pub fn parse_metrics_expr(expr: &str) -> Result<AlertDescriptor> {
    let caps = METRICS_EXPR
        .captures(expr)
        .ok_or_else(|| Error::expression(expr, "does not match the metrics grammar"))?;

    let group = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or_default();

    let panel_id = group("panelID")
        .parse::<u32>()
        .map_err(|e| Error::expression(expr, format!("erroneous panelID: {e}")))?;

    let or_default = |value: &str, default: &str| {
        if value.is_empty() {
            default.to_string()
        } else {
            value.to_string()
        }
    };

    Ok(AlertDescriptor {
        dashboard_uid: group("dashboardUID").to_string(),
        panel_id,
        metric: group("metric").to_string(),
        from: group("from").to_string(),
        to: group("to").to_string(),
        reducer: group("reducer").to_string(),
        evaluator: Evaluator {
            kind: evaluator_alias(group("evaluator")).to_string(),
            params: parse_params(expr, group("params"))?,
        },
        every: or_default(group("every"), DEFAULT_EVALUATION_FREQUENCY),
        for_duration: or_default(group("for"), DEFAULT_STABILITY_WINDOW),
    })
}
