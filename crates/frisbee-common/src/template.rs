//! Rendering of job templates into queued job specs
//!
//! A grouped resource carries one template and a list of inputs. Each string
//! value of the template is rendered with minijinja under strict undefined
//! behavior, so a typo in `{{ inputs.port }}` fails initialization instead
//! of producing an empty field.
//!
//! Inputs are applied round-robin: instance `i` receives `inputs[i % len]`.
//!
//! Available variables:
//! - `inputs.<key>` - the input assigned to this instance
//! - `instance` - index of the instance
//! - `scenario` - scenario label of the parent (empty if unset)
//! - `namespace` - namespace of the parent

use std::collections::BTreeMap;

use minijinja::{context, Environment, UndefinedBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::Error;

/// Where a template is being rendered
#[derive(Clone, Debug, Default)]
pub struct RenderScope {
    /// Name of the parent owning the queue (used in error messages)
    pub parent: String,
    /// Scenario label of the parent
    pub scenario: String,
    /// Namespace of the parent
    pub namespace: String,
}

/// Renders templated job specs
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render `count` instances of `template`.
    ///
    /// # Errors
    ///
    /// - `count == 0`
    /// - a string references an undefined variable or has invalid syntax
    /// - a rendered value no longer fits the spec type
    pub fn render_jobs<T>(
        &self,
        template: &T,
        count: usize,
        inputs: &[BTreeMap<String, String>],
        scope: &RenderScope,
    ) -> Result<Vec<T>, Error>
    where
        T: Serialize + DeserializeOwned,
    {
        if count == 0 {
            return Err(Error::validation_for_field(
                scope.parent.clone(),
                "spec.instances",
                "cannot generate a queue of zero jobs",
            ));
        }

        let raw = serde_json::to_value(template)?;
        let empty = BTreeMap::new();

        (0..count)
            .map(|i| {
                let input = if inputs.is_empty() {
                    &empty
                } else {
                    &inputs[i % inputs.len()]
                };
                let ctx = context! {
                    inputs => input,
                    instance => i,
                    scenario => &scope.scenario,
                    namespace => &scope.namespace,
                };

                let rendered = self.render_value(&raw, &ctx).map_err(|e| {
                    Error::validation_for_field(
                        scope.parent.clone(),
                        "spec.template",
                        format!("instance {i}: {e}"),
                    )
                })?;

                serde_json::from_value(rendered).map_err(|e| {
                    Error::validation_for_field(
                        scope.parent.clone(),
                        "spec.template",
                        format!("instance {i} does not fit the spec: {e}"),
                    )
                })
            })
            .collect()
    }

    fn render_value(&self, value: &Value, ctx: &minijinja::Value) -> Result<Value, minijinja::Error> {
        Ok(match value {
            Value::String(s) if has_template_syntax(s) => {
                Value::String(self.env.render_str(s, ctx.clone())?)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.render_value(v, ctx)?)))
                    .collect::<Result<_, minijinja::Error>>()?,
            ),
            other => other.clone(),
        })
    }
}

/// Whether a string contains any template syntax
pub fn has_template_syntax(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        image: String,
        args: Vec<String>,
        replicas: u32,
    }

    fn job() -> Job {
        Job {
            image: "iperf:{{ inputs.version }}".to_string(),
            args: vec!["--port={{ inputs.port }}".to_string(), "-v".to_string()],
            replicas: 1,
        }
    }

    fn input(version: &str, port: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("version".to_string(), version.to_string()),
            ("port".to_string(), port.to_string()),
        ])
    }

    /// Story: seven instances over three inputs reuse the inputs in order,
    /// so instance 7 of a longer queue would get input 7 % 3 = 1.
    #[test]
    fn inputs_are_applied_round_robin() {
        let engine = TemplateEngine::new();
        let inputs = vec![input("1", "80"), input("2", "81"), input("3", "82")];

        let jobs = engine
            .render_jobs(&job(), 8, &inputs, &RenderScope::default())
            .unwrap();

        assert_eq!(jobs.len(), 8);
        assert_eq!(jobs[0].image, "iperf:1");
        assert_eq!(jobs[4].args[0], "--port=81");
        assert_eq!(jobs[7].image, "iperf:2");
        assert_eq!(jobs[7].args[1], "-v");
    }

    #[test]
    fn zero_instances_is_rejected() {
        let engine = TemplateEngine::new();
        let err = engine
            .render_jobs(&job(), 0, &[], &RenderScope::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn undefined_input_fails_rendering() {
        let engine = TemplateEngine::new();
        let scope = RenderScope {
            parent: "servers".to_string(),
            ..Default::default()
        };
        let err = engine.render_jobs(&job(), 1, &[], &scope).unwrap_err();
        assert!(err.to_string().contains("servers"));
    }

    #[test]
    fn scope_variables_are_available() {
        let engine = TemplateEngine::new();
        let tmpl = Job {
            image: "{{ scenario }}-{{ namespace }}-{{ instance }}".to_string(),
            args: vec![],
            replicas: 2,
        };
        let scope = RenderScope {
            parent: "p".to_string(),
            scenario: "demo".to_string(),
            namespace: "ns".to_string(),
        };
        let jobs = engine.render_jobs(&tmpl, 2, &[], &scope).unwrap();
        assert_eq!(jobs[1].image, "demo-ns-1");
        assert_eq!(jobs[1].replicas, 2);
    }
}
