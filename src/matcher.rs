//! Pattern compilation for channel takers.
//!
//! A pattern describes which inputs a taker is interested in; compilation
//! turns it into a shareable boolean predicate over the input value.

use std::sync::Arc;

use crate::value::Value;

/// A predicate function over channel input.
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a taker can match on.
#[derive(Clone)]
pub enum Pattern {
    /// Matches every input.
    Wildcard,
    /// Matches actions whose kind equals the literal.
    Kind(String),
    /// Arbitrary predicate.
    Predicate(PredicateFn),
    /// Disjunction: matches if any sub-pattern matches.
    Any(Vec<Pattern>),
}

impl Pattern {
    pub fn kind(kind: impl Into<String>) -> Self {
        Pattern::Kind(kind.into())
    }

    pub fn predicate(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Pattern::Predicate(Arc::new(f))
    }

    pub fn any(patterns: Vec<Pattern>) -> Self {
        Pattern::Any(patterns)
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Wildcard => write!(f, "*"),
            Pattern::Kind(k) => write!(f, "{:?}", k),
            Pattern::Predicate(_) => write!(f, "<predicate>"),
            Pattern::Any(ps) => f.debug_list().entries(ps.iter()).finish(),
        }
    }
}

impl From<&str> for Pattern {
    fn from(kind: &str) -> Self {
        Pattern::kind(kind)
    }
}

impl From<String> for Pattern {
    fn from(kind: String) -> Self {
        Pattern::Kind(kind)
    }
}

/// A compiled pattern. Compilation is a pure function of the pattern;
/// matchers are cheap to clone and share.
#[derive(Clone)]
pub struct Matcher(PredicateFn);

impl Matcher {
    pub fn compile(pattern: &Pattern) -> Matcher {
        match pattern {
            Pattern::Wildcard => Matcher(Arc::new(|_| true)),
            Pattern::Kind(kind) => {
                let kind = kind.clone();
                Matcher(Arc::new(move |input| {
                    matches!(input, Value::Action(a) if a.kind == kind)
                }))
            }
            Pattern::Predicate(f) => Matcher(f.clone()),
            Pattern::Any(patterns) => {
                let compiled: Vec<Matcher> = patterns.iter().map(Matcher::compile).collect();
                Matcher(Arc::new(move |input| {
                    compiled.iter().any(|m| m.matches(input))
                }))
            }
        }
    }

    pub fn wildcard() -> Matcher {
        Matcher::compile(&Pattern::Wildcard)
    }

    pub fn matches(&self, input: &Value) -> bool {
        (self.0)(input)
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Action;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_matches_everything() {
        let m = Matcher::compile(&Pattern::Wildcard);
        assert!(m.matches(&Value::action("A")));
        assert!(m.matches(&Value::Int(42)));
        assert!(m.matches(&Value::End));
    }

    #[test]
    fn test_kind_matches_action_kind_only() {
        let m = Matcher::compile(&Pattern::kind("PING"));
        assert!(m.matches(&Value::action("PING")));
        assert!(!m.matches(&Value::action("PONG")));
        assert!(!m.matches(&Value::String("PING".into())));
    }

    #[test]
    fn test_predicate() {
        let m = Matcher::compile(&Pattern::predicate(|v| {
            v.as_action().map(|a| a.payload.as_int() == Some(1)).unwrap_or(false)
        }));
        assert!(m.matches(&Value::Action(Action::with_payload("A", Value::Int(1)))));
        assert!(!m.matches(&Value::Action(Action::with_payload("A", Value::Int(2)))));
    }

    #[test]
    fn test_any_is_disjunction() {
        let m = Matcher::compile(&Pattern::any(vec![
            Pattern::kind("A"),
            Pattern::kind("B"),
        ]));
        assert!(m.matches(&Value::action("A")));
        assert!(m.matches(&Value::action("B")));
        assert!(!m.matches(&Value::action("C")));
    }

    #[test]
    fn test_empty_any_matches_nothing() {
        let m = Matcher::compile(&Pattern::any(vec![]));
        assert!(!m.matches(&Value::action("A")));
    }

    proptest! {
        // A compiled wildcard accepts every input.
        #[test]
        fn prop_wildcard_matches_any_value(n in any::<i64>(), kind in "[A-Z]{1,8}") {
            let m = Matcher::compile(&Pattern::Wildcard);
            prop_assert!(m.matches(&Value::Int(n)));
            prop_assert!(m.matches(&Value::action(kind)));
            prop_assert!(m.matches(&Value::End));
            prop_assert!(m.matches(&Value::Bool(n % 2 == 0)));
        }

        // A kind literal matches exactly the actions of that kind, and
        // never a bare value that happens to carry the same string.
        #[test]
        fn prop_kind_matches_exactly_that_action_kind(kind in "[A-E]", input in "[A-E]") {
            let m = Matcher::compile(&Pattern::kind(kind.clone()));
            prop_assert_eq!(m.matches(&Value::action(input.clone())), kind == input);
            prop_assert!(!m.matches(&Value::String(input)));
        }

        // A disjunction matches an input iff some sub-pattern matches it.
        #[test]
        fn prop_any_matches_iff_some_sub_pattern_matches(
            kinds in proptest::collection::vec("[A-E]", 0..6),
            input in "[A-E]",
        ) {
            let patterns: Vec<Pattern> =
                kinds.iter().map(|k| Pattern::kind(k.clone())).collect();
            let m = Matcher::compile(&Pattern::any(patterns));
            let expected = kinds.iter().any(|k| k == &input);
            prop_assert_eq!(m.matches(&Value::action(input)), expected);
        }
    }
}
