//! Payload rendering using minijinja templates.
//!
//! String fields in action payloads may contain `{{ ... }}` placeholders
//! resolved against the assignment's context variables before dispatch:
//!
//! ```json
//! { "template_key": "docs-reminder", "context": { "greeting": "Hello {{ client_name }}" } }
//! ```
//!
//! Rendering is best-effort: a template that fails to render is passed
//! through unrendered rather than failing the action, since the payload is
//! advisory content for a collaborator, not a gate.

use minijinja::Environment;
use tracing::debug;

/// Render every string leaf of a JSON value against the given context.
pub fn render_value(
  value: &serde_json::Value,
  context: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
  match value {
    serde_json::Value::String(s) if s.contains("{{") => {
      serde_json::Value::String(render_str(s, context))
    }
    serde_json::Value::Array(items) => {
      serde_json::Value::Array(items.iter().map(|v| render_value(v, context)).collect())
    }
    serde_json::Value::Object(map) => serde_json::Value::Object(
      map
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, context)))
        .collect(),
    ),
    other => other.clone(),
  }
}

fn render_str(template: &str, context: &serde_json::Map<String, serde_json::Value>) -> String {
  let env = Environment::new();
  match env.render_str(template, context) {
    Ok(rendered) => rendered,
    Err(e) => {
      debug!(template = %template, error = %e, "payload template failed to render");
      template.to_string()
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn context() -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("client_name".to_string(), json!("Acme Co"));
    map.insert("documents_received".to_string(), json!(2));
    map
  }

  #[test]
  fn renders_string_leaves_recursively() {
    let payload = json!({
      "subject": "Documents for {{ client_name }}",
      "lines": ["{{ documents_received }} received", "static"],
      "count": 2
    });

    let rendered = render_value(&payload, &context());
    assert_eq!(rendered["subject"], "Documents for Acme Co");
    assert_eq!(rendered["lines"][0], "2 received");
    assert_eq!(rendered["lines"][1], "static");
    assert_eq!(rendered["count"], 2);
  }

  #[test]
  fn plain_strings_pass_through_untouched() {
    let payload = json!({ "subject": "no placeholders" });
    assert_eq!(render_value(&payload, &context()), payload);
  }
}
