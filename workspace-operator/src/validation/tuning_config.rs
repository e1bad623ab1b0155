use k8s_openapi::api::core::v1::ConfigMap;
use kaito_types::TuningMethod;
use kube::{Api, Client};
use serde_yaml::Value;

use crate::util::Error;

/// Key inside the tuning ConfigMap that carries the YAML document.
pub const TRAINING_CONFIG_KEY: &str = "training_config.yaml";

/// The only sections allowed under `training_config`. The section bodies are
/// opaque; validation only probes the few keys it has policy over.
const ALLOWED_SECTIONS: &[&str] = &[
    "ModelConfig",
    "QuantizationConfig",
    "LoraConfig",
    "TrainingArguments",
    "DatasetConfig",
    "DataCollator",
];

/// ConfigMap consulted when `tuning.config` is unset.
pub fn default_config_name(method: TuningMethod) -> String {
    format!("{method}-params-template")
}

/// Fetches the named ConfigMap and runs the schema policy against its
/// training config document. All findings are returned as a flat error list.
pub async fn fetch_and_validate(
    client: Client,
    namespace: &str,
    name: &str,
    method: TuningMethod,
) -> Result<Vec<String>, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let config_map = match api.get(name).await {
        Ok(cm) => cm,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Ok(vec![format!(
                "tuning ConfigMap '{namespace}/{name}' does not exist"
            )]);
        }
        Err(e) => return Err(e.into()),
    };
    let Some(yaml) = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(TRAINING_CONFIG_KEY))
    else {
        return Ok(vec![format!(
            "tuning ConfigMap '{namespace}/{name}' is missing key '{TRAINING_CONFIG_KEY}'"
        )]);
    };
    Ok(validate_config_yaml(yaml, method))
}

/// Schema policy over the training config document:
/// - top-level sections restricted to a fixed set;
/// - `TrainingArguments.output_dir` must normalize under `/mnt`;
/// - qlora requires `load_in_4bit` or `load_in_8bit`; lora forbids both;
/// - the two load flags are mutually exclusive.
pub fn validate_config_yaml(yaml: &str, method: TuningMethod) -> Vec<String> {
    let mut errors = Vec::new();
    let root: Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(e) => return vec![format!("training config is not valid YAML: {e}")],
    };
    let Some(config) = root.get("training_config") else {
        return vec!["training config is missing the 'training_config' section".to_string()];
    };
    let Some(sections) = config.as_mapping() else {
        return vec!["'training_config' must be a mapping".to_string()];
    };

    for key in sections.keys() {
        match key.as_str() {
            Some(name) if ALLOWED_SECTIONS.contains(&name) => {}
            Some(name) => errors.push(format!("unknown section '{name}' under 'training_config'")),
            None => errors.push("section names under 'training_config' must be strings".to_string()),
        }
    }

    if let Some(dir) = output_dir(config) {
        match normalize_output_dir(dir) {
            Some(_) => {}
            None => errors.push(format!(
                "TrainingArguments.output_dir '{dir}' escapes the '/mnt' prefix"
            )),
        }
    }

    errors.extend(validate_quantization(config, method));
    errors
}

fn output_dir(config: &Value) -> Option<&str> {
    config
        .get("TrainingArguments")?
        .get("TrainingArguments")?
        .get("output_dir")?
        .as_str()
}

/// Normalizes `dir` relative to `/mnt`, resolving `.` and `..` lexically.
/// Returns `None` when the path climbs out of the prefix.
pub fn normalize_output_dir(dir: &str) -> Option<String> {
    let relative = if dir == "/mnt" {
        ""
    } else if let Some(rest) = dir.strip_prefix("/mnt/") {
        rest
    } else {
        dir.trim_start_matches('/')
    };
    let mut stack: Vec<&str> = Vec::new();
    for component in relative.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }
    let mut normalized = "/mnt".to_string();
    for component in stack {
        normalized.push('/');
        normalized.push_str(component);
    }
    Some(normalized)
}

fn validate_quantization(config: &Value, method: TuningMethod) -> Vec<String> {
    let mut errors = Vec::new();
    let quant = config
        .get("QuantizationConfig")
        .and_then(|s| s.get("QuantizationConfig"));

    let load_in_4bit = match load_flag(quant, "load_in_4bit") {
        Ok(v) => v,
        Err(e) => {
            errors.push(e);
            None
        }
    };
    let load_in_8bit = match load_flag(quant, "load_in_8bit") {
        Ok(v) => v,
        Err(e) => {
            errors.push(e);
            None
        }
    };

    if load_in_4bit == Some(true) && load_in_8bit == Some(true) {
        errors.push(
            "QuantizationConfig: 'load_in_4bit' and 'load_in_8bit' are mutually exclusive"
                .to_string(),
        );
        return errors;
    }
    match method {
        TuningMethod::Qlora => {
            if load_in_4bit != Some(true) && load_in_8bit != Some(true) {
                errors.push(
                    "QuantizationConfig: qlora requires 'load_in_4bit' or 'load_in_8bit' to be true"
                        .to_string(),
                );
            }
        }
        TuningMethod::Lora => {
            if load_in_4bit == Some(true) || load_in_8bit == Some(true) {
                errors.push(
                    "QuantizationConfig: lora requires 'load_in_4bit' and 'load_in_8bit' to be false or absent"
                        .to_string(),
                );
            }
        }
    }
    errors
}

fn load_flag(quant: Option<&Value>, key: &str) -> Result<Option<bool>, String> {
    let Some(value) = quant.and_then(|q| q.get(key)) else {
        return Ok(None);
    };
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        _ => Err(format!("QuantizationConfig: '{key}' must be a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(quant: &str) -> String {
        format!(
            r#"
training_config:
  ModelConfig:
    torch_dtype: bfloat16
  QuantizationConfig:
    QuantizationConfig:
{quant}
  TrainingArguments:
    TrainingArguments:
      output_dir: results
"#
        )
    }

    #[test]
    fn accepts_a_well_formed_qlora_config() {
        let doc = yaml("      load_in_4bit: true");
        assert!(validate_config_yaml(&doc, TuningMethod::Qlora).is_empty());
    }

    #[test]
    fn qlora_without_any_load_flag_is_rejected() {
        let doc = yaml("      {}");
        let errors = validate_config_yaml(&doc, TuningMethod::Qlora);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("QuantizationConfig"));
    }

    #[test]
    fn lora_with_a_load_flag_is_rejected() {
        let doc = yaml("      load_in_8bit: true");
        let errors = validate_config_yaml(&doc, TuningMethod::Lora);
        assert!(errors.iter().any(|e| e.contains("lora requires")));
    }

    #[test]
    fn load_flags_are_mutually_exclusive() {
        let doc = yaml("      load_in_4bit: true\n      load_in_8bit: true");
        let errors = validate_config_yaml(&doc, TuningMethod::Qlora);
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let doc = r#"
training_config:
  ModelConfig: {}
  SpeculativeDecoding: {}
"#;
        let errors = validate_config_yaml(doc, TuningMethod::Lora);
        assert!(errors.iter().any(|e| e.contains("SpeculativeDecoding")));
    }

    #[test]
    fn non_boolean_load_flag_is_rejected() {
        let doc = yaml("      load_in_4bit: \"yes\"");
        let errors = validate_config_yaml(&doc, TuningMethod::Qlora);
        assert!(errors.iter().any(|e| e.contains("must be a boolean")));
    }

    #[test]
    fn output_dir_normalizes_under_mnt() {
        assert_eq!(normalize_output_dir("results"), Some("/mnt/results".into()));
        assert_eq!(
            normalize_output_dir("a/./b/../c"),
            Some("/mnt/a/c".into())
        );
        assert_eq!(normalize_output_dir("/mnt/out"), Some("/mnt/out".into()));
        assert_eq!(normalize_output_dir("../escape"), None);
        assert_eq!(normalize_output_dir("a/../../.."), None);
    }

    #[test]
    fn escaping_output_dir_is_rejected() {
        let doc = r#"
training_config:
  TrainingArguments:
    TrainingArguments:
      output_dir: ../../etc
"#;
        let errors = validate_config_yaml(doc, TuningMethod::Lora);
        assert!(errors.iter().any(|e| e.contains("escapes")));
    }

    #[test]
    fn default_config_names_follow_the_method() {
        assert_eq!(default_config_name(TuningMethod::Lora), "lora-params-template");
        assert_eq!(default_config_name(TuningMethod::Qlora), "qlora-params-template");
    }
}
