//! Request/response shape transforms applied around the opaque `request`
//! sub-object the engine otherwise never interprets.

use serde_json::Value;

use crate::config::{RuntimeConfig, SafetySetting};

/// The model/request pair after shape and safety-settings transforms have
/// been applied, cached so retry attempts don't redo that work.
#[derive(Debug, Clone)]
pub struct AssembledRequest {
    pub model: String,
    pub request: Value,
}

pub fn assemble(model: &str, request: Value, config: &RuntimeConfig) -> AssembledRequest {
    let request = if config.uses_public_shape(model) {
        strip_to_public_shape(request)
    } else {
        request
    };
    let request = merge_safety_settings(request, &config.default_safety_settings);
    AssembledRequest {
        model: model.to_owned(),
        request,
    }
}

/// Envelopes the assembled request with the project bound to whichever
/// credential is serving this attempt. Cheap: no re-merge, no re-strip.
pub fn envelope(assembled: &AssembledRequest, project: &str) -> Value {
    serde_json::json!({
        "model": assembled.model,
        "project": project,
        "request": assembled.request,
    })
}

/// Public-shape requests only accept a minimal `generationConfig`: drop
/// everything except the image sub-config, if present — which also drops
/// `thinkingConfig`, since it lives under `generationConfig` and isn't on
/// the allowlist. Tool use isn't offered on the public shape either, so
/// `tools` is dropped outright rather than forwarded.
fn strip_to_public_shape(mut request: Value) -> Value {
    let Some(obj) = request.as_object_mut() else {
        return request;
    };
    if let Some(generation_config) = obj.remove("generationConfig") {
        if let Some(image_config) = generation_config.get("imageConfig").cloned() {
            obj.insert(
                "generationConfig".to_owned(),
                serde_json::json!({ "imageConfig": image_config }),
            );
        }
    }
    obj.remove("tools");
    request
}

/// Incremental merge: the caller's safety settings win; only categories the
/// caller never mentioned get a default appended.
fn merge_safety_settings(mut request: Value, defaults: &[SafetySetting]) -> Value {
    let Some(obj) = request.as_object_mut() else {
        return request;
    };
    let user_settings: Vec<Value> = obj
        .get("safetySettings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let user_categories: std::collections::HashSet<&str> = user_settings
        .iter()
        .filter_map(|s| s.get("category").and_then(Value::as_str))
        .collect();

    let mut merged = user_settings;
    for default in defaults {
        if !user_categories.contains(default.category.as_str()) {
            merged.push(serde_json::json!({
                "category": default.category,
                "threshold": default.threshold,
            }));
        }
    }
    obj.insert("safetySettings".to_owned(), Value::Array(merged));
    request
}

/// Unwraps the upstream's `{"response": ...}` envelope, if present.
pub fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => obj.remove("response").unwrap_or(Value::Object(obj)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn config(public_models: &[&str], defaults: Vec<SafetySetting>) -> RuntimeConfig {
        RuntimeConfig {
            base_endpoint: "https://x".into(),
            operator_token: None,
            retry_429_enabled: true,
            retry_429_max_retries: 3,
            retry_429_interval: Duration::from_secs(1),
            auto_ban_enabled: true,
            auto_ban_error_codes: HashSet::new(),
            public_api_models: public_models.iter().map(|m| m.to_string()).collect(),
            default_safety_settings: defaults,
            credential_refresh_delay: Duration::from_millis(500),
            ban_duration: Duration::from_secs(86_400),
            ban_operation_window: Duration::from_secs(3600),
            ban_operation_max: 3,
            ban_min_today_requests: 80,
            ip_store_flush_period: Duration::from_secs(60),
            ip_sweep_period: Duration::from_secs(1800),
        }
    }

    #[test]
    fn absent_safety_settings_get_all_defaults() {
        let cfg = config(
            &[],
            vec![SafetySetting {
                category: "HARM_CATEGORY_HATE".into(),
                threshold: "BLOCK_ONLY_HIGH".into(),
            }],
        );
        let assembled = assemble("gemini-pro", serde_json::json!({}), &cfg);
        let settings = assembled.request["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0]["category"], "HARM_CATEGORY_HATE");
    }

    #[test]
    fn user_category_is_never_overridden() {
        let cfg = config(
            &[],
            vec![SafetySetting {
                category: "HARM_CATEGORY_HATE".into(),
                threshold: "BLOCK_ONLY_HIGH".into(),
            }],
        );
        let request = serde_json::json!({
            "safetySettings": [{"category": "HARM_CATEGORY_HATE", "threshold": "BLOCK_NONE"}]
        });
        let assembled = assemble("gemini-pro", request, &cfg);
        let settings = assembled.request["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0]["threshold"], "BLOCK_NONE");
    }

    #[test]
    fn public_shape_strips_generation_config_to_image_config_only() {
        let cfg = config(&["gemini-public"], vec![]);
        let request = serde_json::json!({
            "generationConfig": {"temperature": 0.9, "imageConfig": {"aspectRatio": "1:1"}}
        });
        let assembled = assemble("gemini-public", request, &cfg);
        let gen_config = &assembled.request["generationConfig"];
        assert!(gen_config.get("temperature").is_none());
        assert_eq!(gen_config["imageConfig"]["aspectRatio"], "1:1");
    }

    #[test]
    fn public_shape_drops_generation_config_without_image_config() {
        let cfg = config(&["gemini-public"], vec![]);
        let request = serde_json::json!({ "generationConfig": {"temperature": 0.9} });
        let assembled = assemble("gemini-public", request, &cfg);
        assert!(assembled.request.get("generationConfig").is_none());
    }

    #[test]
    fn internal_shape_leaves_generation_config_untouched() {
        let cfg = config(&[], vec![]);
        let request = serde_json::json!({ "generationConfig": {"temperature": 0.9} });
        let assembled = assemble("gemini-internal", request, &cfg);
        assert_eq!(assembled.request["generationConfig"]["temperature"], 0.9);
    }

    #[test]
    fn public_shape_drops_thinking_config_along_with_generation_config() {
        let cfg = config(&["gemini-public"], vec![]);
        let request = serde_json::json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1024}}
        });
        let assembled = assemble("gemini-public", request, &cfg);
        assert!(assembled.request.get("generationConfig").is_none());
    }

    #[test]
    fn internal_shape_leaves_thinking_config_untouched() {
        let cfg = config(&[], vec![]);
        let request = serde_json::json!({
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 1024}}
        });
        let assembled = assemble("gemini-internal", request, &cfg);
        assert_eq!(
            assembled.request["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1024
        );
    }

    #[test]
    fn public_shape_drops_tools() {
        let cfg = config(&["gemini-public"], vec![]);
        let request = serde_json::json!({ "tools": [{"functionDeclarations": []}] });
        let assembled = assemble("gemini-public", request, &cfg);
        assert!(assembled.request.get("tools").is_none());
    }

    #[test]
    fn internal_shape_leaves_tools_untouched() {
        let cfg = config(&[], vec![]);
        let request = serde_json::json!({ "tools": [{"functionDeclarations": []}] });
        let assembled = assemble("gemini-internal", request, &cfg);
        assert_eq!(assembled.request["tools"][0]["functionDeclarations"], serde_json::json!([]));
    }

    #[test]
    fn envelope_binds_project_without_touching_request() {
        let cfg = config(&[], vec![]);
        let assembled = assemble("gemini-pro", serde_json::json!({"a": 1}), &cfg);
        let env = envelope(&assembled, "project-a");
        assert_eq!(env["model"], "gemini-pro");
        assert_eq!(env["project"], "project-a");
        assert_eq!(env["request"]["a"], 1);
    }

    #[test]
    fn unwrap_envelope_lifts_response_key() {
        let wrapped = serde_json::json!({"response": {"candidates": []}});
        assert_eq!(unwrap_envelope(wrapped), serde_json::json!({"candidates": []}));
    }

    #[test]
    fn unwrap_envelope_passes_through_when_no_response_key() {
        let plain = serde_json::json!({"candidates": []});
        assert_eq!(unwrap_envelope(plain.clone()), plain);
    }
}
