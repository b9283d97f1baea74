//! Single-term presence matcher.

use crate::entry::LogEntry;
use crate::term::{Predicate, Term, TermError};

use super::{Hits, Matcher};

/// Emits one hit for every entry whose line matches the term.
///
/// Stateless apart from the compiled predicate; `eval` is a no-op.
pub struct MatchSingle {
    matcher: Predicate,
}

impl MatchSingle {
    pub fn new(term: &Term) -> Result<Self, TermError> {
        Ok(Self {
            matcher: term.compile()?,
        })
    }
}

impl Matcher for MatchSingle {
    fn scan(&mut self, entry: LogEntry) -> Hits {
        let mut hits = Hits::default();
        if (self.matcher)(&entry.line) {
            hits.cnt = 1;
            hits.logs = vec![entry];
        }
        hits
    }

    fn eval(&mut self, _clock: i64) -> Hits {
        Hits::default()
    }
}
