//! Parameters: references that resolve at execution time to a static value
//! or a registry lookup. Resolution is purely functional over the passed
//! context and never mutates it.

use crate::core::errors::{EngineError, Result};
use crate::engine::context::ExecContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Discriminator for [`Parameter::EntityOutput`] lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Action,
    Task,
}

impl EntityKind {
    fn label(&self) -> &'static str {
        match self {
            EntityKind::Action => "action",
            EntityKind::Task => "task",
        }
    }
}

/// A value reference, resolved against the shared registry when the owning
/// action executes. The variant set is closed; concrete actions compose
/// these rather than defining their own lookup schemes.
#[derive(Debug, Clone)]
pub enum Parameter {
    /// A fixed value, resolved as-is without touching the registry.
    Static(Value),
    /// Output published by an earlier action, optionally a single field.
    ActionOutput {
        action_id: String,
        field: Option<String>,
    },
    /// Result-provider value stored by an earlier action.
    ActionResult {
        action_id: String,
        field: Option<String>,
    },
    /// Output published by an earlier task run.
    TaskOutput {
        task_id: String,
        field: Option<String>,
    },
    /// Result-provider value stored by an earlier task run.
    TaskResult {
        task_id: String,
        field: Option<String>,
    },
    /// Output-first lookup with a result-provider fallback, for callers that
    /// do not care which of the two the producer used.
    EntityOutput {
        kind: EntityKind,
        id: String,
        field: Option<String>,
    },
}

impl Parameter {
    pub fn value(value: Value) -> Self {
        Parameter::Static(value)
    }

    /// Static parameter from any serializable value.
    pub fn serialized<T: Serialize>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::resolution(format!("cannot serialize static value: {e}")))?;
        Ok(Parameter::Static(value))
    }

    pub fn string<S: Into<String>>(value: S) -> Self {
        Parameter::Static(Value::String(value.into()))
    }

    /// Static duration, stored as a duration literal (`"1h 30m"`).
    pub fn duration(value: Duration) -> Self {
        Parameter::Static(Value::String(humantime::format_duration(value).to_string()))
    }

    pub fn action_output<S: Into<String>>(action_id: S, field: Option<&str>) -> Self {
        Parameter::ActionOutput {
            action_id: action_id.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn action_result<S: Into<String>>(action_id: S, field: Option<&str>) -> Self {
        Parameter::ActionResult {
            action_id: action_id.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn task_output<S: Into<String>>(task_id: S, field: Option<&str>) -> Self {
        Parameter::TaskOutput {
            task_id: task_id.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn task_result<S: Into<String>>(task_id: S, field: Option<&str>) -> Self {
        Parameter::TaskResult {
            task_id: task_id.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn entity_output<S: Into<String>>(kind: EntityKind, id: S, field: Option<&str>) -> Self {
        Parameter::EntityOutput {
            kind,
            id: id.into(),
            field: field.map(str::to_string),
        }
    }

    /// Resolve against the registry carried by `ctx`. Lookups on a context
    /// with no registry attached are resolution errors; `Static` resolves
    /// regardless.
    pub fn resolve(&self, ctx: &ExecContext) -> Result<Value> {
        let registry = || {
            ctx.global().ok_or_else(|| {
                EngineError::resolution("no global context attached to the execution context")
            })
        };

        match self {
            Parameter::Static(value) => Ok(value.clone()),
            Parameter::ActionOutput { action_id, field } => {
                let output = registry()?.action_output(action_id).ok_or_else(|| {
                    EngineError::resolution(format!(
                        "no output recorded for action '{action_id}'"
                    ))
                })?;
                apply_field(output, "action", action_id, field.as_deref())
            }
            Parameter::ActionResult { action_id, field } => {
                let provider = registry()?.action_result(action_id).ok_or_else(|| {
                    EngineError::resolution(format!(
                        "no result provider recorded for action '{action_id}'"
                    ))
                })?;
                let result = provider.result().ok_or_else(|| {
                    EngineError::resolution(format!(
                        "result provider for action '{action_id}' holds no result"
                    ))
                })?;
                apply_field(result, "action", action_id, field.as_deref())
            }
            Parameter::TaskOutput { task_id, field } => {
                let output = registry()?.task_output(task_id).ok_or_else(|| {
                    EngineError::resolution(format!("no output recorded for task '{task_id}'"))
                })?;
                apply_field(output, "task", task_id, field.as_deref())
            }
            Parameter::TaskResult { task_id, field } => {
                let provider = registry()?.task_result(task_id).ok_or_else(|| {
                    EngineError::resolution(format!(
                        "no result provider recorded for task '{task_id}'"
                    ))
                })?;
                let result = provider.result().ok_or_else(|| {
                    EngineError::resolution(format!(
                        "result provider for task '{task_id}' holds no result"
                    ))
                })?;
                apply_field(result, "task", task_id, field.as_deref())
            }
            Parameter::EntityOutput { kind, id, field } => {
                // Output entry wins; the result provider is only consulted
                // when no output exists, with or without a sub-key.
                let global = registry()?;
                let output = match kind {
                    EntityKind::Action => global.action_output(id),
                    EntityKind::Task => global.task_output(id),
                };
                if let Some(output) = output {
                    return apply_field(output, kind.label(), id, field.as_deref());
                }
                let provider = match kind {
                    EntityKind::Action => global.action_result(id),
                    EntityKind::Task => global.task_result(id),
                };
                let provider = provider.ok_or_else(|| {
                    EngineError::resolution(format!(
                        "{} '{id}' has neither an output nor a result provider",
                        kind.label()
                    ))
                })?;
                let result = provider.result().ok_or_else(|| {
                    EngineError::resolution(format!(
                        "result provider for {} '{id}' holds no result",
                        kind.label()
                    ))
                })?;
                apply_field(result, kind.label(), id, field.as_deref())
            }
        }
    }
}

fn apply_field(value: Value, entity: &str, id: &str, field: Option<&str>) -> Result<Value> {
    let Some(field) = field else {
        return Ok(value);
    };
    match value {
        Value::Object(map) => map.get(field).cloned().ok_or_else(|| {
            EngineError::resolution(format!(
                "field '{field}' not present in the value published by {entity} '{id}'"
            ))
        }),
        other => Err(EngineError::resolution(format!(
            "value published by {entity} '{id}' is {}, not an object; cannot index field '{field}'",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Resolve to a string. An omitted parameter yields `""`.
///
/// Accepts a literal string, a byte array (UTF-8 decoded), or a scalar
/// formatted as text.
pub fn resolve_string(param: Option<&Parameter>, ctx: &ExecContext) -> Result<String> {
    match param {
        None => Ok(String::new()),
        Some(p) => coerce_string(p.resolve(ctx)?),
    }
}

/// Resolve to a bool. An omitted parameter yields `false`.
pub fn resolve_bool(param: Option<&Parameter>, ctx: &ExecContext) -> Result<bool> {
    match param {
        None => Ok(false),
        Some(p) => coerce_bool(p.resolve(ctx)?),
    }
}

/// Resolve to a list of strings. An omitted parameter yields an empty list.
///
/// A string value is split on commas when any are present, otherwise on
/// whitespace; pieces are trimmed and empty pieces dropped.
pub fn resolve_string_list(param: Option<&Parameter>, ctx: &ExecContext) -> Result<Vec<String>> {
    match param {
        None => Ok(Vec::new()),
        Some(p) => coerce_string_list(p.resolve(ctx)?),
    }
}

/// Resolve to a duration. An omitted parameter yields `Duration::ZERO`.
///
/// Accepts an integer (seconds), a float (seconds), or a duration literal
/// such as `"1h 30m"`.
pub fn resolve_duration(param: Option<&Parameter>, ctx: &ExecContext) -> Result<Duration> {
    match param {
        None => Ok(Duration::ZERO),
        Some(p) => coerce_duration(p.resolve(ctx)?),
    }
}

/// Resolve to any deserializable type. An omitted parameter yields the
/// type's default; a shape mismatch is an error naming the target type.
pub fn resolve_typed<T>(param: Option<&Parameter>, ctx: &ExecContext) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match param {
        None => Ok(T::default()),
        Some(p) => {
            let value = p.resolve(ctx)?;
            serde_json::from_value(value).map_err(|e| {
                EngineError::resolution(format!(
                    "cannot deserialize resolved value into {}: {e}",
                    std::any::type_name::<T>()
                ))
            })
        }
    }
}

fn coerce_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|v| v.as_u64().filter(|b| *b <= 255).map(|b| b as u8))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| {
                    EngineError::resolution("cannot coerce an array to string unless it is a byte buffer")
                })?;
            String::from_utf8(bytes)
                .map_err(|e| EngineError::resolution(format!("byte buffer is not valid UTF-8: {e}")))
        }
        other => Err(EngineError::resolution(format!(
            "cannot coerce {} to string",
            json_type_name(&other)
        ))),
    }
}

fn coerce_bool(value: Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            other => Err(EngineError::resolution(format!(
                "cannot interpret '{other}' as a bool"
            ))),
        },
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i != 0)
            } else if let Some(f) = n.as_f64() {
                Ok(f != 0.0)
            } else {
                Ok(n.as_u64().map(|u| u != 0).unwrap_or(false))
            }
        }
        other => Err(EngineError::resolution(format!(
            "cannot coerce {} to bool",
            json_type_name(&other)
        ))),
    }
}

fn coerce_string_list(value: Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items.into_iter().map(coerce_string).collect(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Vec::new());
            }
            let pieces: Vec<String> = if s.contains(',') {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            } else {
                s.split_whitespace().map(str::to_string).collect()
            };
            Ok(pieces)
        }
        other => Err(EngineError::resolution(format!(
            "cannot coerce {} to a string list",
            json_type_name(&other)
        ))),
    }
}

fn coerce_duration(value: Value) -> Result<Duration> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                Ok(Duration::from_secs(secs))
            } else if let Some(secs) = n.as_f64().filter(|f| *f >= 0.0) {
                Ok(Duration::from_secs_f64(secs))
            } else {
                Err(EngineError::resolution(
                    "a duration in seconds cannot be negative",
                ))
            }
        }
        Value::String(s) => humantime::parse_duration(s.trim())
            .map_err(|e| EngineError::resolution(format!("invalid duration literal '{s}': {e}"))),
        other => Err(EngineError::resolution(format!(
            "cannot coerce {} to a duration",
            json_type_name(&other)
        ))),
    }
}
