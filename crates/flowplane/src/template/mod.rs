//! Expression evaluation over the workflow variable bag.
//!
//! Jinja2-style expressions via minijinja. Condition steps evaluate boolean
//! expressions ("amount > 1000"); step configuration values (task titles,
//! API URLs, automated-action params) support `{{ ... }}` substitution
//! against the instance's variables. Evaluation never mutates the bag.

use minijinja::{Environment, Error, ErrorKind, Value};
use serde_json::Map;

use crate::error::{EngineError, EngineResult};

/// Expression evaluator with a fixed environment.
pub struct ExpressionEvaluator {
    env: Environment<'static>,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_filter("fromjson", filter_fromjson);
        env.add_function("now", fn_now);
        Self { env }
    }

    /// Render a template string against the variable bag.
    ///
    /// Strings without template syntax pass through untouched.
    pub fn render(
        &self,
        template: &str,
        variables: &Map<String, serde_json::Value>,
    ) -> EngineResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let ctx = Value::from_serialize(variables);
        let tmpl = self.env.template_from_str(template).map_err(|e| {
            EngineError::ExpressionEvaluation(format!("template parse error: {}", e))
        })?;
        tmpl.render(ctx).map_err(|e| {
            EngineError::ExpressionEvaluation(format!("template render error: {}", e))
        })
    }

    /// Render a template and coerce the result back to a JSON value.
    pub fn render_to_value(
        &self,
        template: &str,
        variables: &Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let rendered = self.render(template, variables)?;
        let trimmed = rendered.trim();

        if (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        {
            if let Ok(value) = serde_json::from_str(trimmed) {
                return Ok(value);
            }
        }
        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(serde_json::Value::Bool(b));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(serde_json::Value::Number(i.into()));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(serde_json::Value::Number(n));
            }
        }
        if trimmed.is_empty() || trimmed == "null" || trimmed == "none" {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::Value::String(rendered))
    }

    /// Render a nested JSON structure recursively.
    ///
    /// String leaves are rendered (and re-typed when the result parses as
    /// JSON), object keys and array items recurse, everything else is
    /// cloned.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        variables: &Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, variables),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    result.insert(k.clone(), self.render_value(v, variables)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let items: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, variables)).collect();
                Ok(serde_json::Value::Array(items?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a boolean condition against the variable bag.
    ///
    /// Bare expressions are wrapped in `{{ }}`; the rendered result counts
    /// as true for "true", "1", and "yes" (case-insensitive).
    pub fn evaluate_condition(
        &self,
        condition: &str,
        variables: &Map<String, serde_json::Value>,
    ) -> EngineResult<bool> {
        let template = if contains_template_syntax(condition) {
            condition.to_string()
        } else {
            format!("{{{{ {} }}}}", condition)
        };

        let rendered = self.render(&template, variables)?;
        let trimmed = rendered.trim().to_lowercase();
        Ok(matches!(trimmed.as_str(), "true" | "1" | "yes"))
    }
}

/// Check for Jinja2 template syntax.
fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Parse a JSON string into a template value.
fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let s = value.to_string();
    let parsed: serde_json::Value = serde_json::from_str(&s).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("fromjson error: {}", e))
    })?;
    Ok(Value::from_serialize(&parsed))
}

/// Current UTC time as an RFC 3339 string.
fn fn_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_variables() -> Map<String, serde_json::Value> {
        let mut vars = Map::new();
        vars.insert("amount".to_string(), json!(1500));
        vars.insert("customer".to_string(), json!({"name": "Acme", "tier": "gold"}));
        vars.insert("approved".to_string(), json!(true));
        vars
    }

    #[test]
    fn test_render_plain_string_passthrough() {
        let eval = ExpressionEvaluator::new();
        let result = eval.render("no templates here", &make_variables()).unwrap();
        assert_eq!(result, "no templates here");
    }

    #[test]
    fn test_render_variable() {
        let eval = ExpressionEvaluator::new();
        let result = eval
            .render("Deal for {{ customer.name }}", &make_variables())
            .unwrap();
        assert_eq!(result, "Deal for Acme");
    }

    #[test]
    fn test_evaluate_condition_comparisons() {
        let eval = ExpressionEvaluator::new();
        let vars = make_variables();

        assert!(eval.evaluate_condition("amount > 1000", &vars).unwrap());
        assert!(!eval.evaluate_condition("amount > 2000", &vars).unwrap());
        assert!(eval
            .evaluate_condition("customer.tier == 'gold'", &vars)
            .unwrap());
        assert!(eval.evaluate_condition("approved", &vars).unwrap());
    }

    #[test]
    fn test_evaluate_condition_malformed() {
        let eval = ExpressionEvaluator::new();
        let err = eval
            .evaluate_condition("amount >", &make_variables())
            .unwrap_err();
        assert!(matches!(err, EngineError::ExpressionEvaluation(_)));
    }

    #[test]
    fn test_render_to_value_number() {
        let eval = ExpressionEvaluator::new();
        let result = eval.render_to_value("{{ amount }}", &make_variables()).unwrap();
        assert_eq!(result, json!(1500));
    }

    #[test]
    fn test_render_value_nested() {
        let eval = ExpressionEvaluator::new();
        let value = json!({
            "greeting": "Hello {{ customer.name }}",
            "limit": "{{ amount }}",
            "nested": {"flag": "{{ approved }}"}
        });

        let result = eval.render_value(&value, &make_variables()).unwrap();
        assert_eq!(result["greeting"], "Hello Acme");
        assert_eq!(result["limit"], json!(1500));
        assert_eq!(result["nested"]["flag"], json!(true));
    }

    #[test]
    fn test_fromjson_filter() {
        let eval = ExpressionEvaluator::new();
        let mut vars = Map::new();
        vars.insert("raw".to_string(), json!("{\"a\": 1}"));

        let result = eval
            .render("{{ (raw | fromjson).a }}", &vars)
            .unwrap();
        assert_eq!(result, "1");
    }
}
