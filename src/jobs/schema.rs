use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FieldError, JobplaneError, Result};
use crate::jobs::job::JobArguments;

pub const DRYRUN_VAR: &str = "dryrun";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VarKind {
    String {
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        pattern: Option<String>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Boolean,
    Choice {
        choices: Vec<String>,
    },
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
    /// Values of sensitive variables are never persisted past the run and
    /// are scrubbed from the execution's log.
    #[serde(default)]
    pub sensitive: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: String::new(),
            sensitive: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(
            name,
            VarKind::String {
                min_length: None,
                max_length: None,
                pattern: None,
            },
        )
    }

    pub fn integer(name: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        Self::new(name, VarKind::Integer { min, max })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, VarKind::Boolean)
    }

    pub fn choice(name: impl Into<String>, choices: &[&str]) -> Self {
        Self::new(
            name,
            VarKind::Choice {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
        )
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match &self.kind {
            VarKind::String {
                min_length,
                max_length,
                pattern,
            } => {
                let s = value.as_str().ok_or("expected a string")?;
                let len = s.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        return Err(format!("must be at least {} characters", min));
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        return Err(format!("must be at most {} characters", max));
                    }
                }
                if let Some(pattern) = pattern {
                    let re = Regex::new(pattern)
                        .map_err(|e| format!("invalid pattern {:?}: {}", pattern, e))?;
                    if !re.is_match(s) {
                        return Err(format!("does not match {}", pattern));
                    }
                }
                Ok(())
            }
            VarKind::Integer { min, max } => {
                let n = value.as_i64().ok_or("expected an integer")?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(format!("must be >= {}", min));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(format!("must be <= {}", max));
                    }
                }
                Ok(())
            }
            VarKind::Float { min, max } => {
                let n = value.as_f64().ok_or("expected a number")?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(format!("must be >= {}", min));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(format!("must be <= {}", max));
                    }
                }
                Ok(())
            }
            VarKind::Boolean => value
                .as_bool()
                .map(|_| ())
                .ok_or_else(|| "expected a boolean".to_string()),
            VarKind::Choice { choices } => {
                let s = value.as_str().ok_or("expected a string")?;
                if choices.iter().any(|c| c == s) {
                    Ok(())
                } else {
                    Err(format!("must be one of: {}", choices.join(", ")))
                }
            }
            VarKind::Json => Ok(()),
        }
    }
}

/// Declared inputs of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub variables: Vec<Variable>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Adds the implicit `dryrun` flag for jobs that support dry runs.
    pub fn with_dryrun(mut self, default: bool) -> Self {
        if self.get(DRYRUN_VAR).is_none() {
            self.variables.push(
                Variable::boolean(DRYRUN_VAR)
                    .with_default(Value::Bool(default))
                    .with_description("Run without making changes"),
            );
        }
        self
    }

    pub fn sensitive_names(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| v.sensitive)
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Checks `args` against the schema and returns them with defaults
    /// filled in. Every problem is reported, not only the first.
    pub fn validate(&self, args: &JobArguments) -> Result<JobArguments> {
        let mut errors = Vec::new();
        let mut out = JobArguments::new();

        for key in args.keys() {
            if self.get(key).is_none() {
                errors.push(FieldError::new(key.clone(), "unknown variable"));
            }
        }

        for var in &self.variables {
            match args.get(&var.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &var.default {
                        out.insert(var.name.clone(), default.clone());
                    } else if var.required {
                        errors.push(FieldError::new(var.name.clone(), "this field is required"));
                    }
                }
                Some(value) => match var.check(value) {
                    Ok(()) => {
                        out.insert(var.name.clone(), value.clone());
                    }
                    Err(message) => errors.push(FieldError::new(var.name.clone(), message)),
                },
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(JobplaneError::Validation(errors))
        }
    }
}
