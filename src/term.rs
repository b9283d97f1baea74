//! Term descriptors and predicate compilation.
//!
//! A [`Term`] names a boolean test over a log line: raw substring, regular
//! expression, or a jq expression evaluated against the line decoded as JSON
//! or YAML. Compilation happens once, at matcher construction; the compiled
//! predicate is a plain `line -> bool` function with no I/O.
//!
//! jq predicates decode the line at most once per distinct line: the decoder
//! memoizes the last line it saw, so a rule with several jq terms pays for a
//! single deserialization per entry.

use std::fmt;

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, Filter, Native, RcIter};
use jaq_json::Val;
use tracing::debug;

/// Errors produced while compiling a term into a predicate.
#[derive(Debug)]
#[non_exhaustive]
pub enum TermError {
    /// Raw terms must be non-empty; an empty substring matches everything.
    Empty,
    /// Invalid regular expression.
    Regex(regex::Error),
    /// The jq expression failed to parse.
    JqParse { expr: String },
    /// The jq expression parsed but failed to compile.
    JqCompile { expr: String },
}

impl fmt::Display for TermError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty term"),
            Self::Regex(err) => write!(f, "fail regex compile: {err}"),
            Self::JqParse { expr } => write!(f, "fail jq parse '{expr}'"),
            Self::JqCompile { expr } => write!(f, "fail jq compile '{expr}'"),
        }
    }
}

impl std::error::Error for TermError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Regex(err) => Some(err),
            _ => None,
        }
    }
}

/// How a term's value is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TermKind {
    /// Substring containment.
    Raw,
    /// Regular expression match.
    Regex,
    /// jq expression over the line decoded as JSON.
    JqJson,
    /// jq expression over the line decoded as YAML.
    JqYaml,
}

/// A term descriptor.
///
/// Equality and hashing are structural on `(kind, value)`; matchers use this
/// to detect duplicate terms in a rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Term {
    pub kind: TermKind,
    pub value: String,
}

const JQ_JSON_PREFIX: &str = "jq_json:";
const JQ_YAML_PREFIX: &str = "jq_yaml:";

// The byte set regex quoting treats as meta; a value containing any of these
// is classified as a pattern rather than a raw substring.
const REGEX_META: &[u8] = br"\.+*?()|[]{}^$";

impl Term {
    pub fn raw(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::Raw,
            value: value.into(),
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::Regex,
            value: value.into(),
        }
    }

    pub fn jq_json(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::JqJson,
            value: value.into(),
        }
    }

    pub fn jq_yaml(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::JqYaml,
            value: value.into(),
        }
    }

    /// Classifies a bare string the way rule files spell terms: a `jq_json:`
    /// or `jq_yaml:` prefix selects jq, a value containing regex
    /// metacharacters compiles as a pattern, anything else is a substring.
    pub fn parse(value: &str) -> Self {
        if let Some(expr) = value.strip_prefix(JQ_JSON_PREFIX) {
            Self::jq_json(expr)
        } else if let Some(expr) = value.strip_prefix(JQ_YAML_PREFIX) {
            Self::jq_yaml(expr)
        } else if value.bytes().any(|b| REGEX_META.contains(&b)) {
            Self::regex(value)
        } else {
            Self::raw(value)
        }
    }

    /// Compiles the term into a predicate.
    pub fn compile(&self) -> Result<Predicate, TermError> {
        match self.kind {
            TermKind::Raw => {
                if self.value.is_empty() {
                    return Err(TermError::Empty);
                }
                let needle = self.value.clone();
                Ok(Box::new(move |line: &str| line.contains(&needle)))
            }
            TermKind::Regex => {
                let exp = regex::Regex::new(&self.value).map_err(TermError::Regex)?;
                Ok(Box::new(move |line: &str| exp.is_match(line)))
            }
            TermKind::JqJson => JqPredicate::compile(&self.value, decode_json),
            TermKind::JqYaml => JqPredicate::compile(&self.value, decode_yaml),
        }
    }
}

/// A compiled `line -> bool` test.
///
/// Mutable because jq predicates carry a one-line decode memo. Predicates are
/// single-owner state, like the matcher that holds them.
pub type Predicate = Box<dyn FnMut(&str) -> bool>;

type DecodeFn = fn(&str) -> Result<serde_json::Value, String>;

fn decode_json(line: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(line).map_err(|err| err.to_string())
}

fn decode_yaml(line: &str) -> Result<serde_json::Value, String> {
    serde_yaml::from_str(line).map_err(|err| err.to_string())
}

struct JqPredicate {
    filter: Filter<Native<Val>>,
    expr: String,
    decode: DecodeFn,
    memo_line: String,
    // None means the memoized line failed to decode.
    memo_val: Option<Val>,
}

impl JqPredicate {
    fn compile(expr: &str, decode: DecodeFn) -> Result<Predicate, TermError> {
        let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
        let arena = Arena::default();

        let program = File {
            code: expr,
            path: (),
        };
        let modules = loader.load(&arena, program).map_err(|_| TermError::JqParse {
            expr: expr.to_owned(),
        })?;

        let filter = Compiler::default()
            .with_funs(jaq_std::funs().chain(jaq_json::funs()))
            .compile(modules)
            .map_err(|_| TermError::JqCompile {
                expr: expr.to_owned(),
            })?;

        let mut state = Self {
            filter,
            expr: expr.to_owned(),
            decode,
            memo_line: String::new(),
            memo_val: None,
        };
        Ok(Box::new(move |line: &str| state.matches(line)))
    }

    fn matches(&mut self, line: &str) -> bool {
        if line != self.memo_line || self.memo_line.is_empty() {
            self.memo_line.clear();
            self.memo_line.push_str(line);
            self.memo_val = match (self.decode)(line) {
                Ok(value) => Some(Val::from(value)),
                Err(err) => {
                    debug!(%err, line, "fail decode log line");
                    None
                }
            };
        }

        let Some(value) = self.memo_val.clone() else {
            return false;
        };

        let inputs = RcIter::new(core::iter::empty());
        let out = self.filter.run((Ctx::new([], &inputs), value));

        // The expression matches when the iterator produces at least one
        // value that is neither null nor false. A runtime error (including
        // halt) ends evaluation without a match.
        let mut matched = false;
        for result in out {
            match result {
                Ok(Val::Null) | Ok(Val::Bool(false)) => {}
                Ok(_) => matched = true,
                Err(_) => {
                    debug!(line, expr = %self.expr, "fail jq query on log line");
                    matched = false;
                    break;
                }
            }
        }
        matched
    }
}
