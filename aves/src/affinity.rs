use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::AvesError;

const OPERATORS: [&str; 6] = ["In", "NotIn", "Exists", "DoesNotExist", "Gt", "Lt"];

/// One node-selector requirement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn parse(index: usize, item: &Value) -> Result<Self, AvesError> {
        let object = item.as_object().ok_or_else(|| {
            AvesError::validation(format!("requiredSelector[{index}] is not an object"))
        })?;

        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        if keys != ["key", "operator", "values"] {
            return Err(AvesError::validation(format!(
                "requiredSelector[{index}] must have exactly the keys key, operator, values (got {})",
                keys.join(", ")
            )));
        }

        let key = string_field(object, "key", index)?;
        let operator = string_field(object, "operator", index)?;
        if !OPERATORS.contains(&operator.as_str()) {
            return Err(AvesError::validation(format!(
                "requiredSelector[{index}] has unknown operator {operator:?}"
            )));
        }

        let values = object["values"]
            .as_array()
            .ok_or_else(|| {
                AvesError::validation(format!("requiredSelector[{index}].values is not a list"))
            })?
            .iter()
            .map(|value| {
                value.as_str().map(str::to_string).ok_or_else(|| {
                    AvesError::validation(format!(
                        "requiredSelector[{index}].values must contain strings"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            key,
            operator,
            values,
        })
    }
}

fn string_field(object: &Map<String, Value>, field: &str, index: usize) -> Result<String, AvesError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AvesError::validation(format!("requiredSelector[{index}].{field} must be a non-empty string"))
        })
}

/// Parse a bare selector list.
pub fn parse_selector(selector: &Value) -> Result<Vec<SelectorRequirement>, AvesError> {
    let items = selector
        .as_array()
        .ok_or_else(|| AvesError::validation("requiredSelector is not a list"))?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| SelectorRequirement::parse(index, item))
        .collect()
}

/// Extract the selector from a role's scheduling strategy
/// (`resourceLevel.requiredSelector`). No strategy means no constraints.
pub fn selector_from_strategy(
    strategy: Option<&Value>,
) -> Result<Vec<SelectorRequirement>, AvesError> {
    let Some(strategy) = strategy.filter(|value| !value.is_null()) else {
        return Ok(Vec::new());
    };
    let selector = strategy
        .get("resourceLevel")
        .ok_or_else(|| AvesError::validation("ScheduleStrategy is missing resourceLevel"))?
        .get("requiredSelector")
        .ok_or_else(|| AvesError::validation("resourceLevel is missing requiredSelector"))?;
    parse_selector(selector)
}

/// Render requirements as a required node-affinity block; empty input
/// renders an empty object.
pub fn node_affinity(requirements: &[SelectorRequirement]) -> Value {
    if requirements.is_empty() {
        return json!({});
    }
    json!({
        "nodeAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": [
                    { "matchExpressions": requirements }
                ]
            }
        }
    })
}

/// Validate and render a role's scheduling strategy in one step.
pub fn affinity_for(strategy: Option<&Value>) -> Result<Value, AvesError> {
    selector_from_strategy(strategy).map(|requirements| node_affinity(&requirements))
}
