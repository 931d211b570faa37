//! Declarative filters over objects.
//!
//! An [`Interest`] is a type filter plus constraints. Constraints within one
//! interest are ANDed; an object manager ORs its interests.
//!
//! Subjects are strings (property values, or intrinsic fields rendered as
//! strings). Each is converted to the operand's scalar type before the
//! comparison; a subject that does not convert never equals the operand.

use std::fmt;
use std::mem;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flags::Features;
use crate::object::Object;
use crate::object_type::ObjectType;
use crate::properties::Properties;

/// Where a constraint looks up its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subject {
    /// Registry properties announced with the global.
    GlobalProperty,
    /// Info properties, available once the object has the info feature.
    Property,
    /// Intrinsic fields such as `bound-id` or `object-type`.
    Field,
}

impl Subject {
    fn category(&self) -> MatchResult {
        match self {
            Subject::GlobalProperty => MatchResult::GLOBAL_PROPERTIES,
            Subject::Property => MatchResult::PROPERTIES,
            Subject::Field => MatchResult::FIELDS,
        }
    }
}

/// Scalar operand of a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    fn same_kind(&self, other: &Value) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Convert `subject` to this value's type and compare.
    fn equals_str(&self, subject: &str) -> bool {
        match self {
            Value::Bool(b) => parse_bool(subject) == Some(*b),
            Value::Int(i) => subject.trim().parse::<i64>().ok() == Some(*i),
            Value::Float(f) => subject
                .trim()
                .parse::<f64>()
                .map(|v| (v - f).abs() < f64::from(f32::EPSILON))
                .unwrap_or(false),
            Value::String(s) => s == subject,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Comparison applied to the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Equals(Value),
    /// Also passes when the subject is absent.
    NotEquals(Value),
    /// Shell-style glob over the subject string.
    Matches(String),
    /// Inclusive numeric range.
    InRange(Value, Value),
    InList(Vec<Value>),
    IsPresent,
    IsAbsent,
}

impl Verb {
    fn evaluate(&self, subject: Option<&str>) -> bool {
        let Some(s) = subject else {
            return matches!(self, Verb::NotEquals(_) | Verb::IsAbsent);
        };
        match self {
            Verb::Equals(v) => v.equals_str(s),
            Verb::NotEquals(v) => !v.equals_str(s),
            Verb::Matches(pattern) => glob::Pattern::new(pattern)
                .map(|p| p.matches(s))
                .unwrap_or(false),
            Verb::InRange(lo, hi) => in_range(lo, hi, s),
            Verb::InList(values) => values.iter().any(|v| v.equals_str(s)),
            Verb::IsPresent => true,
            Verb::IsAbsent => false,
        }
    }
}

fn in_range(lo: &Value, hi: &Value, subject: &str) -> bool {
    match (lo, hi) {
        (Value::Int(lo), Value::Int(hi)) => subject
            .trim()
            .parse::<i64>()
            .map(|v| *lo <= v && v <= *hi)
            .unwrap_or(false),
        (Value::Float(lo), Value::Float(hi)) => subject
            .trim()
            .parse::<f64>()
            .map(|v| *lo <= v && v <= *hi)
            .unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("constraint has an empty key")]
    EmptyKey,

    #[error("constraint on {key:?}: range bounds must both be integers or both floats")]
    RangeBounds { key: String },

    #[error("constraint on {key:?}: value list is empty")]
    EmptyList { key: String },

    #[error("constraint on {key:?}: value list mixes types")]
    MixedList { key: String },

    #[error("constraint on {key:?}: invalid glob pattern: {message}")]
    BadPattern { key: String, message: String },
}

/// One test applied to one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub subject: Subject,
    pub key: String,
    pub verb: Verb,
}

impl Constraint {
    pub fn new(subject: Subject, key: impl Into<String>, verb: Verb) -> Self {
        Self {
            subject,
            key: key.into(),
            verb,
        }
    }

    pub fn global(key: impl Into<String>, verb: Verb) -> Self {
        Self::new(Subject::GlobalProperty, key, verb)
    }

    pub fn property(key: impl Into<String>, verb: Verb) -> Self {
        Self::new(Subject::Property, key, verb)
    }

    pub fn field(key: impl Into<String>, verb: Verb) -> Self {
        Self::new(Subject::Field, key, verb)
    }

    pub fn validate(&self) -> Result<(), ConstraintError> {
        if self.key.is_empty() {
            return Err(ConstraintError::EmptyKey);
        }
        let key = || self.key.clone();
        match &self.verb {
            Verb::InRange(lo, hi) => {
                if !lo.is_numeric() || !lo.same_kind(hi) {
                    return Err(ConstraintError::RangeBounds { key: key() });
                }
            }
            Verb::InList(values) => {
                let Some(first) = values.first() else {
                    return Err(ConstraintError::EmptyList { key: key() });
                };
                if values.iter().any(|v| !v.same_kind(first)) {
                    return Err(ConstraintError::MixedList { key: key() });
                }
            }
            Verb::Matches(pattern) => {
                if let Err(e) = glob::Pattern::new(pattern) {
                    return Err(ConstraintError::BadPattern {
                        key: key(),
                        message: e.to_string(),
                    });
                }
            }
            Verb::Equals(_) | Verb::NotEquals(_) | Verb::IsPresent | Verb::IsAbsent => {}
        }
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = match self.subject {
            Subject::GlobalProperty => "global",
            Subject::Property => "property",
            Subject::Field => "field",
        };
        write!(f, "{}:{} ", subject, self.key)?;
        match &self.verb {
            Verb::Equals(v) => write!(f, "= {v}"),
            Verb::NotEquals(v) => write!(f, "!= {v}"),
            Verb::Matches(p) => write!(f, "matches {p:?}"),
            Verb::InRange(lo, hi) => write!(f, "in [{lo}, {hi}]"),
            Verb::InList(values) => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "in {{{}}}", rendered.join(", "))
            }
            Verb::IsPresent => write!(f, "present"),
            Verb::IsAbsent => write!(f, "absent"),
        }
    }
}

bitflags! {
    /// Which parts of an interest a candidate satisfied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchResult: u8 {
        const TYPE = 1 << 0;
        const GLOBAL_PROPERTIES = 1 << 1;
        const PROPERTIES = 1 << 2;
        const FIELDS = 1 << 3;
    }
}

/// What a candidate offers for matching. Missing sources make the
/// constraints that need them fail.
#[derive(Debug, Clone, Copy)]
pub struct MatchSubject<'a> {
    pub object_type: ObjectType,
    pub global_properties: Option<&'a Properties>,
    pub properties: Option<&'a Properties>,
    pub object: Option<&'a Object>,
}

/// A type filter plus ANDed constraints, and the features wanted on matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Interest {
    pub object_type: ObjectType,
    pub constraints: Vec<Constraint>,
    pub features: Features,
}

impl Interest {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            constraints: Vec::new(),
            features: Features::empty(),
        }
    }

    pub fn constrain(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Remove malformed constraints, returning why each was rejected.
    pub fn drop_invalid_constraints(&mut self) -> Vec<ConstraintError> {
        let mut errors = Vec::new();
        self.constraints.retain(|c| match c.validate() {
            Ok(()) => true,
            Err(e) => {
                errors.push(e);
                false
            }
        });
        errors
    }

    pub fn has_property_constraints(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| c.subject == Subject::Property)
    }

    /// Check every constraint and report which categories passed.
    ///
    /// Malformed constraints are skipped.
    pub fn matches_full(&self, subject: &MatchSubject<'_>) -> MatchResult {
        let mut result = MatchResult::all();

        if !subject.object_type.is_a(self.object_type) {
            result.remove(MatchResult::TYPE);
        }

        for constraint in &self.constraints {
            if constraint.validate().is_err() {
                continue;
            }
            let field;
            let value = match constraint.subject {
                Subject::GlobalProperty => subject
                    .global_properties
                    .and_then(|p| p.get(&constraint.key)),
                Subject::Property => subject.properties.and_then(|p| p.get(&constraint.key)),
                Subject::Field => {
                    field = subject.object.and_then(|o| o.field(&constraint.key));
                    field.as_deref()
                }
            };
            if !constraint.verb.evaluate(value) {
                result.remove(constraint.subject.category());
            }
        }

        result
    }

    /// Full match against a live object.
    pub fn matches(&self, object: &Object) -> bool {
        let global_properties = object.global_properties();
        let properties = object.properties();
        let subject = MatchSubject {
            object_type: object.object_type(),
            global_properties: global_properties.as_ref(),
            properties: properties.as_ref(),
            object: Some(object),
        };
        self.matches_full(&subject) == MatchResult::all()
    }
}
