use crate::infra::secrets::pointer::escape_pointer_token;
use crate::infra::secrets::resolver::{SecretRef, ENV_ID_RULE};
use anyhow::Result;
use serde_json::Value;

/// Validation errors for configuration, reported with JSON-pointer paths.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate the subtrees of a config document that the secrets core
/// interprets. Returns every issue found.
pub fn validate_config(doc: &Value) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    validate_api_key_sites(doc, "/models/providers", &mut errors);
    validate_api_key_sites(doc, "/skills/entries", &mut errors);
    validate_googlechat(doc, &mut errors);
    validate_secret_sources(doc, &mut errors);

    errors
}

/// Validate and return `Ok` or a single error joining every issue.
pub fn validate_config_object(doc: &Value) -> Result<()> {
    let errors = validate_config(doc);
    if errors.is_empty() {
        Ok(())
    } else {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        anyhow::bail!("Configuration validation failed:\n{}", messages.join("\n"));
    }
}

fn validate_api_key_sites(doc: &Value, base_ptr: &str, errors: &mut Vec<ConfigValidationError>) {
    let Some(map) = doc.pointer(base_ptr).and_then(Value::as_object) else {
        return;
    };
    for (id, entry) in map {
        let path = format!("{base_ptr}/{}/apiKey", escape_pointer_token(id));
        let Some(api_key) = entry.get("apiKey") else {
            continue;
        };
        match api_key {
            Value::String(_) | Value::Null => {}
            Value::Object(_) => validate_ref_shape(api_key, &path, errors),
            _ => errors.push(ConfigValidationError {
                path,
                message: "apiKey must be a string or a secret reference".to_string(),
            }),
        }
    }
}

fn validate_googlechat(doc: &Value, errors: &mut Vec<ConfigValidationError>) {
    let mut sites: Vec<String> = Vec::new();
    if doc.pointer("/channels/googlechat").and_then(Value::as_object).is_some() {
        sites.push("/channels/googlechat".to_string());
    }
    if let Some(accounts) = doc
        .pointer("/channels/googlechat/accounts")
        .and_then(Value::as_object)
    {
        for account_id in accounts.keys() {
            sites.push(format!(
                "/channels/googlechat/accounts/{}",
                escape_pointer_token(account_id)
            ));
        }
    }

    for site in sites {
        let Some(obj) = doc.pointer(&site).and_then(Value::as_object) else {
            continue;
        };
        if let Some(service_account) = obj.get("serviceAccount") {
            match service_account {
                Value::String(_) | Value::Object(_) | Value::Null => {}
                _ => errors.push(ConfigValidationError {
                    path: format!("{site}/serviceAccount"),
                    message: "serviceAccount must be a string, an object, or a secret reference"
                        .to_string(),
                }),
            }
        }
        if let Some(reference) = obj.get("serviceAccountRef") {
            validate_ref_shape(reference, &format!("{site}/serviceAccountRef"), errors);
        }
    }
}

fn validate_secret_sources(doc: &Value, errors: &mut Vec<ConfigValidationError>) {
    let Some(file) = doc.pointer("/secrets/sources/file") else {
        return;
    };
    let path = "/secrets/sources/file";
    let Some(obj) = file.as_object() else {
        errors.push(ConfigValidationError {
            path: path.to_string(),
            message: "file source must be an object".to_string(),
        });
        return;
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("sops") => {}
        Some(other) => errors.push(ConfigValidationError {
            path: format!("{path}/type"),
            message: format!("unsupported file source type \"{other}\": only \"sops\" is supported"),
        }),
        None => errors.push(ConfigValidationError {
            path: format!("{path}/type"),
            message: "file source requires type \"sops\"".to_string(),
        }),
    }
    match obj.get("path").and_then(Value::as_str) {
        Some(p) if !p.trim().is_empty() => {}
        _ => errors.push(ConfigValidationError {
            path: format!("{path}/path"),
            message: "file source requires a non-empty path".to_string(),
        }),
    }
    if let Some(timeout) = obj.get("timeoutMs") {
        if !timeout.is_number() && !timeout.is_null() {
            errors.push(ConfigValidationError {
                path: format!("{path}/timeoutMs"),
                message: "timeoutMs must be a number".to_string(),
            });
        }
    }
}

/// Check that an object in a reference position is a well-formed SecretRef.
fn validate_ref_shape(value: &Value, path: &str, errors: &mut Vec<ConfigValidationError>) {
    match SecretRef::parse(value) {
        Some(secret_ref) => {
            if let Err(e) = secret_ref.validate() {
                errors.push(ConfigValidationError {
                    path: path.to_string(),
                    message: e.to_string(),
                });
            }
        }
        None => errors.push(ConfigValidationError {
            path: path.to_string(),
            message: format!(
                "not a valid secret reference: expected {{ source: \"env\" | \"file\", id }} \
                 with an env id matching {ENV_ID_RULE} or an absolute JSON pointer"
            ),
        }),
    }
}
