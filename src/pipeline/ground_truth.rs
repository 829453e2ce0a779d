//! Ground-truth fact extraction from verified execution output.
//!
//! Facts bound what the narrative phases may claim: every numeric statement
//! downstream must be traceable to a fact extracted here. Facts are computed
//! once per turn, only from a successful execution, and never cached across
//! turns.

use serde::Serialize;

use crate::executor::ExecutionResult;

/// How many leading list elements become individual facts.
const MAX_LIST_FACTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    Text,
    Count,
    Percentage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            FactValue::Text(_) => None,
        }
    }
}

/// One verified literal or derived value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundTruthFact {
    pub source_key: String,
    pub value: FactValue,
    pub formatted_value: String,
    pub value_type: ValueType,
}

impl GroundTruthFact {
    fn number(key: impl Into<String>, value: f64) -> Self {
        Self {
            source_key: key.into(),
            formatted_value: format_number(value),
            value: FactValue::Number(value),
            value_type: ValueType::Number,
        }
    }

    fn count(key: impl Into<String>, value: f64) -> Self {
        Self {
            source_key: key.into(),
            formatted_value: format_number(value),
            value: FactValue::Number(value),
            value_type: ValueType::Count,
        }
    }

    fn text(key: impl Into<String>, value: &str) -> Self {
        Self {
            source_key: key.into(),
            formatted_value: value.to_string(),
            value: FactValue::Text(value.to_string()),
            value_type: ValueType::Text,
        }
    }
}

/// Extract literal facts plus derived percentage facts.
///
/// Returns an empty list unless the execution succeeded.
pub fn extract_ground_truth(result: &ExecutionResult) -> Vec<GroundTruthFact> {
    if !result.success {
        return Vec::new();
    }
    let mut facts = walk_outputs(&result.results);
    let derived = derive_percentages(&facts);
    facts.extend(derived);
    facts
}

fn walk_outputs(results: &serde_json::Map<String, serde_json::Value>) -> Vec<GroundTruthFact> {
    let mut facts = Vec::new();

    for (key, value) in results {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    facts.push(GroundTruthFact::number(key.clone(), f));
                }
            }
            serde_json::Value::String(s) => {
                facts.push(GroundTruthFact::text(key.clone(), s));
            }
            serde_json::Value::Array(items) => {
                collect_list_facts(&mut facts, key, items);
            }
            serde_json::Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
                // Figures carry no verifiable numbers worth narrating.
                Some("plotly_figure") => {}
                Some("dataframe") => collect_dataframe_facts(&mut facts, key, obj),
                Some("series") => {
                    if let Some(len) = obj.get("length").and_then(|v| v.as_f64()) {
                        facts.push(GroundTruthFact::count(format!("{}.length", key), len));
                    }
                    if let Some(items) = obj.get("data").and_then(|v| v.as_array()) {
                        collect_numeric_elements(&mut facts, key, items);
                    }
                }
                // Nested plain mapping of scalars.
                _ => {
                    for (sub, v) in obj {
                        match v {
                            serde_json::Value::Number(n) => {
                                if let Some(f) = n.as_f64() {
                                    facts.push(GroundTruthFact::number(
                                        format!("{}.{}", key, sub),
                                        f,
                                    ));
                                }
                            }
                            serde_json::Value::String(s) => {
                                facts.push(GroundTruthFact::text(format!("{}.{}", key, sub), s));
                            }
                            _ => {}
                        }
                    }
                }
            },
            _ => {}
        }
    }

    facts
}

fn collect_list_facts(facts: &mut Vec<GroundTruthFact>, key: &str, items: &[serde_json::Value]) {
    facts.push(GroundTruthFact::count(
        format!("{}.length", key),
        items.len() as f64,
    ));
    collect_numeric_elements(facts, key, items);
}

fn collect_numeric_elements(
    facts: &mut Vec<GroundTruthFact>,
    key: &str,
    items: &[serde_json::Value],
) {
    for (index, item) in items.iter().take(MAX_LIST_FACTS).enumerate() {
        if let Some(f) = item.as_f64() {
            facts.push(GroundTruthFact::number(format!("{}.{}", key, index), f));
        }
    }
}

fn collect_dataframe_facts(
    facts: &mut Vec<GroundTruthFact>,
    key: &str,
    obj: &serde_json::Map<String, serde_json::Value>,
) {
    if let Some(rows) = obj.get("total_rows").and_then(|v| v.as_f64()) {
        facts.push(GroundTruthFact::count(format!("{}.row_count", key), rows));
    }
    if let Some(head) = obj.get("head").and_then(|v| v.as_array()) {
        for record in head {
            let Some(record) = record.as_object() else {
                continue;
            };
            for (column, cell) in record {
                if let Some(f) = cell.as_f64() {
                    facts.push(GroundTruthFact::number(format!("{}.{}", key, column), f));
                }
            }
        }
    }
}

/// Derive `min/max × 100` percentage facts for related numeric pairs.
///
/// Two facts are related iff their keys carry the same dot-qualified
/// top-level prefix; bare top-level scalars never pair. Both values must be
/// positive, and the ratio uses min over max, so the result is always in
/// (0, 100].
pub fn derive_percentages(facts: &[GroundTruthFact]) -> Vec<GroundTruthFact> {
    let numeric: Vec<(&str, &str, f64)> = facts
        .iter()
        .filter_map(|fact| {
            let value = fact.value.as_number()?;
            if value <= 0.0 {
                return None;
            }
            let prefix = fact.source_key.split_once('.')?.0;
            Some((prefix, fact.source_key.as_str(), value))
        })
        .collect();

    let mut derived = Vec::new();
    for (i, &(prefix_a, key_a, value_a)) in numeric.iter().enumerate() {
        for &(prefix_b, key_b, value_b) in &numeric[i + 1..] {
            if prefix_a != prefix_b {
                continue;
            }
            let (lo_key, lo, hi_key, hi) = if value_a <= value_b {
                (key_a, value_a, key_b, value_b)
            } else {
                (key_b, value_b, key_a, value_a)
            };
            let percent = lo / hi * 100.0;
            derived.push(GroundTruthFact {
                source_key: format!("{}/{}", lo_key, hi_key),
                formatted_value: format!("{:.1}%", percent),
                value: FactValue::Number(percent),
                value_type: ValueType::Percentage,
            });
        }
    }
    derived
}

/// Expand a fact into the textual renderings a narration might use.
///
/// For numbers: integer form, two-decimal form, comma-grouped form, and for
/// values in [0, 1] the 0- and 1-decimal percentage forms. Deduplicated,
/// insertion-ordered.
pub fn representations(fact: &GroundTruthFact) -> Vec<String> {
    let mut forms = Vec::new();
    let mut push = |form: String| {
        if !forms.contains(&form) {
            forms.push(form);
        }
    };

    match &fact.value {
        FactValue::Text(s) => push(s.clone()),
        FactValue::Number(n) => {
            push(format!("{}", n.round() as i64));
            push(format!("{:.2}", n));
            push(group_thousands(n.round() as i64));
            if (0.0..=1.0).contains(n) {
                push(format!("{:.0}%", n * 100.0));
                push(format!("{:.1}%", n * 100.0));
            }
        }
    }
    forms
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}
