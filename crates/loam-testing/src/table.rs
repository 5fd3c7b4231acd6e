use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use loam_core::{Result, ToolAdapter, ToolOutcome, ToolSpec};

type Row = BTreeMap<String, Value>;

/// Command vocabulary of one table dialect. The two bundled dialects
/// share semantics but rename the surface, which is exactly what the
/// transfer lane has to bridge.
#[derive(Debug, Clone)]
pub struct Dialect {
    pub family: &'static str,
    pub adapter: &'static str,
    pub verb_filter: &'static str,
    pub verb_sort: &'static str,
    pub verb_aggregate: &'static str,
    pub arrow: &'static str,
}

/// `gridtool`: `KEEP age gt 30`, `SORT age asc`, `TALLY sum age -> total`.
pub fn gridtool() -> TableAdapter {
    TableAdapter::new(Dialect {
        family: "table",
        adapter: "gridtool",
        verb_filter: "KEEP",
        verb_sort: "SORT",
        verb_aggregate: "TALLY",
        arrow: "->",
    })
}

/// `fluxtool`: same semantics, renamed surface —
/// `SIFT age gt 30`, `ORDER age asc`, `GROUP sum age => total`.
pub fn fluxtool() -> TableAdapter {
    TableAdapter::new(Dialect {
        family: "flux",
        adapter: "fluxtool",
        verb_filter: "SIFT",
        verb_sort: "ORDER",
        verb_aggregate: "GROUP",
        arrow: "=>",
    })
}

const OPERATORS: &[&str] = &["gt", "lt", "eq", "ne", "ge", "le"];
const AGG_FNS: &[&str] = &["sum", "count", "avg"];

/// An in-memory table behind the Adapter SPI. Each session owns its own
/// instance, so isolation between sessions is structural.
pub struct TableAdapter {
    dialect: Dialect,
    rows: Mutex<Vec<Row>>,
    aggregates: Mutex<BTreeMap<String, f64>>,
    docs_manifest: Vec<PathBuf>,
}

impl TableAdapter {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            rows: Mutex::new(default_fixture()),
            aggregates: Mutex::new(BTreeMap::new()),
            docs_manifest: vec![],
        }
    }

    /// Replace the fixture rows.
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        *self.rows.lock() = rows;
        self
    }

    /// Attach documentation files for the strict-mode critic.
    pub fn with_docs(mut self, docs: Vec<PathBuf>) -> Self {
        self.docs_manifest = docs;
        self
    }

    fn state_signature(&self) -> String {
        let rows = self.rows.lock();
        let aggregates = self.aggregates.lock();
        // Digest covers row order, so a sort that changes nothing is
        // detectable as no-progress.
        let mut digest: u64 = 0xcbf29ce484222325;
        for row in rows.iter() {
            for (key, value) in row {
                for b in key.bytes().chain(value.to_string().bytes()) {
                    digest ^= b as u64;
                    digest = digest.wrapping_mul(0x100000001b3);
                }
            }
            digest = digest.rotate_left(7);
        }
        format!(
            "rows={} aggs={} digest={:08x}",
            rows.len(),
            aggregates.len(),
            digest as u32
        )
    }

    fn run_command(&self, command: &str) -> std::result::Result<String, String> {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        let Some(&verb) = tokens.first() else {
            return Err("syntax error: empty command".into());
        };

        if verb.eq_ignore_ascii_case(self.dialect.verb_filter) {
            return self.cmd_filter(&tokens);
        }
        if verb.eq_ignore_ascii_case(self.dialect.verb_sort) {
            return self.cmd_sort(&tokens);
        }
        if verb.eq_ignore_ascii_case(self.dialect.verb_aggregate) {
            return self.cmd_aggregate(&tokens);
        }
        Err(format!(
            "unknown command '{verb}' (expected {}, {}, or {})",
            self.dialect.verb_filter, self.dialect.verb_sort, self.dialect.verb_aggregate
        ))
    }

    /// `<FILTER> <col> <op> <value>` — operators are words, not symbols.
    fn cmd_filter(&self, tokens: &[&str]) -> std::result::Result<String, String> {
        let [_, col, op, value] = tokens else {
            return Err(format!(
                "syntax error: expected {} <column> <op> <value>",
                self.dialect.verb_filter
            ));
        };
        if !OPERATORS.contains(op) {
            return Err(format!(
                "syntax error: unknown operator '{op}' (operators are words: gt, lt, eq, ne, ge, le)"
            ));
        }
        let mut rows = self.rows.lock();
        if !rows.is_empty() && !rows[0].contains_key(*col) {
            return Err(format!("unknown column '{col}'"));
        }
        let before = rows.len();
        rows.retain(|row| cell_matches(row.get(*col), op, value));
        Ok(format!("{} of {before} rows kept", rows.len()))
    }

    /// `<SORT> <col> <asc|desc>`.
    fn cmd_sort(&self, tokens: &[&str]) -> std::result::Result<String, String> {
        let [_, col, direction] = tokens else {
            return Err(format!(
                "syntax error: expected {} <column> <asc|desc>",
                self.dialect.verb_sort
            ));
        };
        if *direction != "asc" && *direction != "desc" {
            return Err(format!(
                "sort direction must be asc or desc, got '{direction}'"
            ));
        }
        let mut rows = self.rows.lock();
        if !rows.is_empty() && !rows[0].contains_key(*col) {
            return Err(format!("unknown column '{col}'"));
        }
        rows.sort_by(|a, b| compare_cells(a.get(*col), b.get(*col)));
        if *direction == "desc" {
            rows.reverse();
        }
        Ok(format!("{} rows sorted by {col} {direction}", rows.len()))
    }

    /// `<AGGREGATE> <fn> <col> <arrow> <out>` — aggregation functions are
    /// lowercase words.
    fn cmd_aggregate(&self, tokens: &[&str]) -> std::result::Result<String, String> {
        let [_, agg_fn, col, arrow, out] = tokens else {
            return Err(format!(
                "syntax error: expected {} <fn> <column> {} <name>",
                self.dialect.verb_aggregate, self.dialect.arrow
            ));
        };
        if *arrow != self.dialect.arrow {
            return Err(format!(
                "syntax error: expected '{}' before the output name, got '{arrow}'",
                self.dialect.arrow
            ));
        }
        if !AGG_FNS.contains(agg_fn) {
            let lowered = agg_fn.to_lowercase();
            if AGG_FNS.contains(&lowered.as_str()) {
                return Err(format!(
                    "unknown function '{agg_fn}': aggregation functions are lowercase (sum, count, avg)"
                ));
            }
            return Err(format!(
                "unknown function '{agg_fn}' (expected sum, count, or avg)"
            ));
        }
        let rows = self.rows.lock();
        if !rows.is_empty() && !rows[0].contains_key(*col) {
            return Err(format!("unknown column '{col}'"));
        }
        let numbers: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(*col).and_then(Value::as_f64))
            .collect();
        let result = match *agg_fn {
            "count" => rows.len() as f64,
            "sum" => numbers.iter().sum(),
            "avg" if numbers.is_empty() => 0.0,
            "avg" => numbers.iter().sum::<f64>() / numbers.len() as f64,
            _ => unreachable!("checked against AGG_FNS"),
        };
        drop(rows);
        self.aggregates.lock().insert(out.to_string(), result);
        Ok(format!("{out} = {result}"))
    }
}

#[async_trait]
impl ToolAdapter for TableAdapter {
    fn tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.dialect.adapter.to_string(),
            description: format!(
                "Process the working table. Commands: {} <column> <op> <value> \
                 (filter), {} <column> <asc|desc> (sort), {} <fn> <column> {} \
                 <name> (aggregate).",
                self.dialect.verb_filter,
                self.dialect.verb_sort,
                self.dialect.verb_aggregate,
                self.dialect.arrow,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            docs_manifest: self.docs_manifest.clone(),
        }
    }

    fn domain_key(&self) -> String {
        format!("{}:{}", self.dialect.family, self.dialect.adapter)
    }

    async fn execute(&self, payload: &Value) -> Result<ToolOutcome> {
        let command = payload
            .get("command")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let before = self.state_signature();
        let result = self.run_command(command);
        let after = self.state_signature();

        Ok(match result {
            Ok(output) => ToolOutcome {
                output,
                error: None,
                state_delta: Some(json!({
                    "changed": before != after,
                    "before": before,
                    "after": after,
                })),
            },
            Err(error) => ToolOutcome::failed(error),
        })
    }

    async fn capture_final_state(&self) -> Result<String> {
        let rows = self.rows.lock();
        let aggregates = self.aggregates.lock();
        let mut state = format!("rows={}\n", rows.len());
        for row in rows.iter() {
            let cells: Vec<String> = row.iter().map(|(k, v)| format!("{k}={v}")).collect();
            state.push_str(&cells.join(" "));
            state.push('\n');
        }
        for (name, value) in aggregates.iter() {
            state.push_str(&format!("{name}={value}\n"));
        }
        Ok(state)
    }
}

fn default_fixture() -> Vec<Row> {
    let people = [
        ("ada", 36, 91),
        ("brin", 28, 74),
        ("chen", 45, 62),
        ("dara", 52, 88),
    ];
    people
        .iter()
        .map(|(name, age, score)| {
            let mut row = Row::new();
            row.insert("name".into(), json!(name));
            row.insert("age".into(), json!(age));
            row.insert("score".into(), json!(score));
            row
        })
        .collect()
}

fn cell_matches(cell: Option<&Value>, op: &str, value: &str) -> bool {
    let Some(cell) = cell else {
        return false;
    };
    let ordering = match (cell.as_f64(), value.parse::<f64>().ok()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => cell.as_str().map(|s| s.cmp(value)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "gt" => ordering.is_gt(),
        "lt" => ordering.is_lt(),
        "eq" => ordering.is_eq(),
        "ne" => !ordering.is_eq(),
        "ge" => ordering.is_ge(),
        "le" => ordering.is_le(),
        _ => false,
    }
}

fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => std::cmp::Ordering::Equal,
    }
}
