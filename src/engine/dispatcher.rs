//! Step dispatcher: binds step text to handler actions.
//!
//! At registration each handler's pattern templates get the resource name
//! substituted and compiled to anchored regexes. Dispatch matches a step's
//! (variable-substituted) text against every compiled pattern: a unique
//! match wins, zero matches is an undefined step, several matches is an
//! ambiguous step.

use regex::Regex;

use crate::error::ConfigError;
use crate::handler::stepdef::{StepCategory, compile_pattern};

/// One compiled, resource-bound step pattern.
struct CompiledStep {
    resource: String,
    action: &'static str,
    regex: Regex,
}

/// Outcome of resolving a step's text.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one pattern matched.
    Match {
        /// The owning resource's name.
        resource: String,
        /// The handler action to invoke.
        action: &'static str,
        /// Capture-group values, in order.
        captures: Vec<String>,
    },
    /// No pattern matched.
    Undefined,
    /// More than one pattern matched.
    Ambiguous {
        /// How many patterns matched.
        count: usize,
    },
}

/// Holds every registered step pattern for the run.
#[derive(Default)]
pub struct Dispatcher {
    steps: Vec<CompiledStep>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler's vocabulary under its resource name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a substituted pattern fails
    /// to compile.
    pub fn register(&mut self, resource: &str, category: &StepCategory) -> Result<(), ConfigError> {
        for step in &category.steps {
            let regex = compile_pattern(step.pattern, resource).map_err(|e| {
                ConfigError::InvalidValue {
                    field: format!("step pattern for resource '{resource}'"),
                    reason: e.to_string(),
                }
            })?;
            self.steps.push(CompiledStep {
                resource: String::from(resource),
                action: step.action,
                regex,
            });
        }
        Ok(())
    }

    /// Number of registered patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no patterns are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve a step's text to a unique handler action.
    #[must_use]
    pub fn resolve(&self, text: &str) -> Resolution {
        let mut matches = self
            .steps
            .iter()
            .filter_map(|step| step.regex.captures(text).map(|captures| (step, captures)));

        let Some((first, captures)) = matches.next() else {
            return Resolution::Undefined;
        };

        let extra = matches.count();
        if extra > 0 {
            return Resolution::Ambiguous { count: extra + 1 };
        }

        let values = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|m| String::from(m.as_str())).unwrap_or_default())
            .collect();
        Resolution::Match {
            resource: first.resource.clone(),
            action: first.action,
            captures: values,
        }
    }
}
