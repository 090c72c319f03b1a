//! User-supplied conditions
//!
//! Two kinds of conditions gate the progress of a parent:
//! - metrics expressions, registered as alerts on an external dashboard and
//!   reported back through annotations on the parent ([`metrics`], [`alert`])
//! - state expressions, evaluated against the classified children ([`state`])
//!
//! [`condition`] combines both into a single verdict for a `ConditionalExpr`.

pub mod alert;
pub mod condition;
pub mod metrics;
pub mod state;

pub use alert::{alert_is_fired, dispatch_alert, AlertStatus, Endpoint, NoDataPolicy, NotifierBody};
pub use condition::{evaluate, Source, Verdict};
pub use metrics::{parse_metrics_expr, AlertDescriptor, Evaluator};
pub use state::{fired_state, StateOutcome};
