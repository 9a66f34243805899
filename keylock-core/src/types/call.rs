use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which operation is being protected, e.g. `OrderService` / `pay`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub type_name: String,
    pub method: String,
}

impl TargetIdentity {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
        }
    }
}

/// A named argument value captured from an intercepted call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArgument {
    pub name: String,
    pub value: Value,
}

/// What the interception layer knows about one protected call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    pub target: TargetIdentity,
    /// Arguments in declaration order
    #[serde(default)]
    pub arguments: Vec<CallArgument>,
}

impl CallContext {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: TargetIdentity::new(type_name, method),
            arguments: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.push(CallArgument {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Append an argument of any serializable type.
    pub fn arg_serialized<T: Serialize>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.arg(name, value))
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn argument_at(&self, index: usize) -> Option<&Value> {
        self.arguments.get(index).map(|a| &a.value)
    }
}

fn default_wait_seconds() -> u64 {
    3
}

fn default_lease_seconds() -> u64 {
    10
}

fn default_message() -> String {
    "request is being processed, do not submit it again".to_string()
}

/// Per-operation lock settings supplied alongside the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// e.g. `order.pay.{orderId}`. Absent means `<type>.<method>`.
    #[serde(default)]
    pub key_template: Option<String>,
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_message")]
    pub message: String,
    /// Suffix the default key with a hash of the arguments.
    #[serde(default)]
    pub hash_arguments: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_template: None,
            wait_seconds: default_wait_seconds(),
            lease_seconds: default_lease_seconds(),
            message: default_message(),
            hash_arguments: false,
        }
    }
}

impl LockConfig {
    pub fn keyed(template: impl Into<String>) -> Self {
        Self {
            key_template: Some(template.into()),
            ..Self::default()
        }
    }

    pub fn wait_seconds(mut self, seconds: u64) -> Self {
        self.wait_seconds = seconds;
        self
    }

    pub fn lease_seconds(mut self, seconds: u64) -> Self {
        self.lease_seconds = seconds;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn hash_arguments(mut self) -> Self {
        self.hash_arguments = true;
        self
    }
}
