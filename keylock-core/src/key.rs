//! Lock key derivation from call metadata.
//!
//! Templates reference arguments by name (`{orderId}`), by position (`{0}`)
//! or by a dotted path into a JSON argument (`{order.id}`, `{0.items.1}`).
//! `{{` and `}}` produce literal braces.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::LockError;
use crate::types::{CallContext, LockConfig, LockRecord};

#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    prefix: String,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace every derived key, e.g. `keylock:`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the lock record for one call. Identical calls yield identical
    /// keys in every process.
    pub fn derive(&self, call: &CallContext, config: &LockConfig) -> Result<LockRecord, LockError> {
        let body = match config.key_template.as_deref() {
            Some(template) => render_template(template, call)?,
            None => default_key(call, config.hash_arguments)?,
        };
        LockRecord::new(
            format!("{}{}", self.prefix, body),
            config.wait_seconds,
            config.lease_seconds,
            config.message.clone(),
        )
    }
}

fn default_key(call: &CallContext, hash_arguments: bool) -> Result<String, LockError> {
    let base = format!("{}.{}", call.target.type_name, call.target.method);
    if !hash_arguments {
        return Ok(base);
    }
    Ok(format!("{}:{}", base, arguments_digest(call)?))
}

/// Hex SHA-256 of the ordered argument values serialized as a JSON array.
/// Object keys serialize sorted, so equal values hash equally.
pub fn arguments_digest(call: &CallContext) -> Result<String, LockError> {
    let values: Vec<&Value> = call.arguments.iter().map(|a| &a.value).collect();
    let bytes = serde_json::to_vec(&values)
        .map_err(|e| LockError::malformed(format!("arguments cannot be serialized: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn render_template(template: &str, call: &CallContext) -> Result<String, LockError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut placeholder = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => placeholder.push(ch),
                        None => {
                            return Err(LockError::malformed(format!(
                                "unterminated placeholder in key template '{}'",
                                template
                            )));
                        }
                    }
                }
                let path = placeholder.trim();
                let value = resolve(call, path).ok_or_else(|| {
                    LockError::malformed(format!(
                        "unresolved placeholder '{{{}}}' in key template '{}'",
                        path, template
                    ))
                })?;
                push_value(&mut out, value);
            }
            '}' => {
                return Err(LockError::malformed(format!(
                    "unmatched '}}' in key template '{}'",
                    template
                )));
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn resolve<'a>(call: &'a CallContext, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let head = segments.next().filter(|s| !s.is_empty())?;

    // Names win over positions so an argument literally called "0" still resolves.
    let mut value = call
        .argument(head)
        .or_else(|| head.parse::<usize>().ok().and_then(|i| call.argument_at(i)))?;

    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Array(_) | Value::Object(_) => out.push_str(&value.to_string()),
    }
}
