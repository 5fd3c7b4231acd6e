use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declarative pass/fail contract attached to a task. The referee
/// evaluates predicates in declared order and short-circuits on the
/// first failure, recording evidence for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractSpec {
    pub predicates: Vec<Predicate>,
}

/// One predicate over the final observable state string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Final state contains the literal needle.
    Contains { needle: String },
    /// Final state does not contain the literal needle.
    NotContains { needle: String },
    /// Final state matches the regex.
    Matches { pattern: String },
    /// Final state equals the value exactly (after trimming).
    Equals { value: String },
    /// Final state parses as JSON and the array at the dotted path has at
    /// least `min` items.
    JsonPathCountAtLeast { path: String, min: usize },
}

/// The outcome of evaluating one predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateOutcome {
    pub index: usize,
    pub passed: bool,
    pub evidence: String,
}

/// The outcome of evaluating a whole contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractResult {
    pub passed: bool,
    /// Outcomes up to and including the first failure.
    pub outcomes: Vec<PredicateOutcome>,
}

impl ContractSpec {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate against the final-state evidence string. A predicate that
    /// cannot be evaluated (bad regex, unparsable JSON) counts as failed,
    /// with the error recorded as its evidence.
    pub fn evaluate(&self, final_state: &str) -> ContractResult {
        let mut outcomes = Vec::new();
        for (index, pred) in self.predicates.iter().enumerate() {
            let (passed, evidence) = pred.check(final_state);
            let failed = !passed;
            outcomes.push(PredicateOutcome {
                index,
                passed,
                evidence,
            });
            if failed {
                return ContractResult {
                    passed: false,
                    outcomes,
                };
            }
        }
        ContractResult {
            passed: true,
            outcomes,
        }
    }
}

impl Predicate {
    fn check(&self, state: &str) -> (bool, String) {
        match self {
            Predicate::Contains { needle } => {
                let hit = state.contains(needle);
                (hit, format!("contains({needle:?}) = {hit}"))
            }
            Predicate::NotContains { needle } => {
                let hit = !state.contains(needle);
                (hit, format!("not_contains({needle:?}) = {hit}"))
            }
            Predicate::Matches { pattern } => match regex::Regex::new(pattern) {
                Ok(re) => {
                    let hit = re.is_match(state);
                    (hit, format!("matches({pattern:?}) = {hit}"))
                }
                Err(e) => (false, format!("invalid pattern {pattern:?}: {e}")),
            },
            Predicate::Equals { value } => {
                let hit = state.trim() == value.trim();
                (hit, format!("equals({value:?}) = {hit}"))
            }
            Predicate::JsonPathCountAtLeast { path, min } => {
                let parsed: Value = match serde_json::from_str(state) {
                    Ok(v) => v,
                    Err(e) => return (false, format!("final state is not JSON: {e}")),
                };
                match lookup_path(&parsed, path) {
                    Some(Value::Array(items)) => {
                        let hit = items.len() >= *min;
                        (hit, format!("len({path}) = {} (min {min})", items.len()))
                    }
                    Some(other) => (
                        false,
                        format!("{path} is not an array: {}", type_name(other)),
                    ),
                    None => (false, format!("{path} not found")),
                }
            }
        }
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_short_circuits() {
        let spec = ContractSpec {
            predicates: vec![
                Predicate::Contains {
                    needle: "missing".into(),
                },
                Predicate::Contains { needle: "x".into() },
            ],
        };
        let result = spec.evaluate("nothing here");
        assert!(!result.passed);
        assert_eq!(result.outcomes.len(), 1);
    }

    #[test]
    fn test_all_pass() {
        let spec = ContractSpec {
            predicates: vec![
                Predicate::Contains {
                    needle: "rows=3".into(),
                },
                Predicate::Matches {
                    pattern: r"rows=\d+".into(),
                },
            ],
        };
        let result = spec.evaluate("rows=3");
        assert!(result.passed);
        assert_eq!(result.outcomes.len(), 2);
    }

    #[test]
    fn test_bad_regex_counts_as_fail() {
        let spec = ContractSpec {
            predicates: vec![Predicate::Matches {
                pattern: "(".into(),
            }],
        };
        let result = spec.evaluate("anything");
        assert!(!result.passed);
        assert!(result.outcomes[0].evidence.contains("invalid pattern"));
    }

    #[test]
    fn test_json_path_count() {
        let spec = ContractSpec {
            predicates: vec![Predicate::JsonPathCountAtLeast {
                path: "data.items".into(),
                min: 2,
            }],
        };
        let ok = spec.evaluate(r#"{"data":{"items":[1,2,3]}}"#);
        assert!(ok.passed);
        let short = spec.evaluate(r#"{"data":{"items":[1]}}"#);
        assert!(!short.passed);
        let not_json = spec.evaluate("plain text");
        assert!(!not_json.passed);
        assert!(not_json.outcomes[0].evidence.contains("not JSON"));
    }

    #[test]
    fn test_empty_contract_passes() {
        let spec = ContractSpec::default();
        assert!(spec.is_empty());
        assert!(spec.evaluate("anything").passed);
    }
}
