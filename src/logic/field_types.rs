use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use itertools::Itertools;
use regex::Regex;
use serde_json::Value;

use crate::model::{FieldDef, FieldError, FieldType, Id};

/// A filter value parsed from a request query parameter, shaped by the
/// field's type.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Ints(Vec<i64>),
    Strings(Vec<String>),
    DateRange(DateTime<Utc>, DateTime<Utc>),
}

/// Coerce and validate one submitted value against its field descriptor.
/// Returns the normalised JSON value to persist.
pub fn coerce_value(field: &FieldDef, raw: &Value) -> Result<Value, FieldError> {
    if raw.is_null() {
        if field.validation.mandatory {
            return Err(FieldError::new(&field.name, "field is mandatory"));
        }
        return Ok(Value::Null);
    }
    match field.field_type {
        FieldType::Int
        | FieldType::Enum
        | FieldType::Concept
        | FieldType::CodingSystem
        | FieldType::GroupSelect
        | FieldType::Datetime
        | FieldType::Code
        | FieldType::String
        | FieldType::StringInputbox
        | FieldType::Textarea
        | FieldType::TextareaMarkdown
        | FieldType::IntArray
        | FieldType::Tags
        | FieldType::Collections
        | FieldType::DataSources
        | FieldType::StringArray
        | FieldType::ListOfInputboxes
        | FieldType::UrlList
        | FieldType::Publication => coerce_typed(field, raw),
        // Child concept payloads are validated by the write path itself.
        FieldType::ClinicalConcept => Ok(raw.clone()),
    }
}

fn coerce_typed(field: &FieldDef, raw: &Value) -> Result<Value, FieldError> {
    match field.field_type {
        FieldType::Int
        | FieldType::Enum
        | FieldType::Concept
        | FieldType::CodingSystem
        | FieldType::GroupSelect => coerce_int(field, raw).map(Value::from),
        FieldType::IntArray | FieldType::Tags | FieldType::Collections | FieldType::DataSources => {
            let items = as_array(field, raw)?;
            let ints = items
                .iter()
                .map(|v| coerce_int(field, v))
                .collect::<Result<Vec<i64>, FieldError>>()?;
            Ok(Value::from(ints))
        }
        FieldType::String
        | FieldType::StringInputbox
        | FieldType::Textarea
        | FieldType::TextareaMarkdown
        | FieldType::Code => coerce_string(field, raw).map(Value::from),
        FieldType::StringArray | FieldType::ListOfInputboxes => {
            let items = as_array(field, raw)?;
            let strings = items
                .iter()
                .map(|v| coerce_string(field, v))
                .collect::<Result<Vec<String>, FieldError>>()?;
            Ok(Value::from(strings))
        }
        FieldType::Datetime => {
            let text = raw
                .as_str()
                .ok_or_else(|| FieldError::new(&field.name, "expected a datetime string"))?;
            let parsed = parse_datetime(text)
                .ok_or_else(|| FieldError::new(&field.name, "invalid datetime"))?;
            Ok(Value::String(parsed.to_rfc3339()))
        }
        FieldType::UrlList | FieldType::Publication => coerce_structured(field, raw),
        FieldType::ClinicalConcept => Ok(raw.clone()),
    }
}

fn coerce_int(field: &FieldDef, raw: &Value) -> Result<i64, FieldError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| FieldError::new(&field.name, "expected an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| FieldError::new(&field.name, "expected an integer")),
        _ => Err(FieldError::new(&field.name, "expected an integer")),
    }
}

fn coerce_string(field: &FieldDef, raw: &Value) -> Result<String, FieldError> {
    let mut text = raw
        .as_str()
        .ok_or_else(|| FieldError::new(&field.name, "expected a string"))?
        .to_string();
    if field.validation.sanitise {
        text = sanitise(&text);
    }
    if let Some((min, max)) = field.validation.length {
        let len = text.chars().count();
        if len < min || len > max {
            return Err(FieldError::new(
                &field.name,
                format!("length must be between {} and {}", min, max),
            ));
        }
    }
    if let Some(pattern) = &field.validation.regex {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(&text) => {
                return Err(FieldError::new(&field.name, "value does not match pattern"))
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("invalid regex on field '{}': {}", field.name, err);
            }
        }
    }
    Ok(text)
}

/// Element-wise structural validation: every element must be an object
/// carrying the mandatory subfields declared in `composition`.
fn coerce_structured(field: &FieldDef, raw: &Value) -> Result<Value, FieldError> {
    let items = as_array(field, raw)?;
    let required: Vec<&str> = field
        .validation
        .composition
        .as_ref()
        .map(|c| c.iter().map(String::as_str).collect())
        .unwrap_or_default();
    for item in items {
        let Some(obj) = item.as_object() else {
            return Err(FieldError::new(&field.name, "expected a list of objects"));
        };
        for key in &required {
            if !obj.contains_key(*key) || obj[*key].is_null() {
                return Err(FieldError::new(
                    &field.name,
                    format!("element is missing '{}'", key),
                ));
            }
        }
    }
    Ok(raw.clone())
}

fn as_array<'a>(field: &FieldDef, raw: &'a Value) -> Result<&'a Vec<Value>, FieldError> {
    raw.as_array()
        .ok_or_else(|| FieldError::new(&field.name, "expected a list"))
}

/// Strip markup from a free-text value.
pub fn sanitise(text: &str) -> String {
    match Regex::new(r"<[^>]*>") {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.trim().to_string(),
    }
}

/// Parse a request filter parameter (CSV) into a typed filter value.
pub fn parse_filter_values(field: &FieldDef, raw: &str) -> Option<FilterValue> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    match field.field_type {
        FieldType::Int
        | FieldType::Enum
        | FieldType::IntArray
        | FieldType::Concept
        | FieldType::CodingSystem
        | FieldType::GroupSelect
        | FieldType::Tags
        | FieldType::Collections
        | FieldType::DataSources => {
            let ints = parts
                .iter()
                .map(|p| p.parse::<i64>())
                .collect::<Result<Vec<i64>, _>>()
                .ok()?;
            // Repeated ids in the query string are harmless, drop them.
            Some(FilterValue::Ints(ints.into_iter().unique().collect()))
        }
        FieldType::Datetime => {
            if parts.len() != 2 {
                return None;
            }
            let mut min = parse_date(parts[0])?;
            let mut max = parse_date(parts[1])?;
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
            let start = Utc.from_utc_datetime(&min.and_hms_opt(0, 0, 0)?);
            let end = Utc.from_utc_datetime(&max.and_hms_milli_opt(23, 59, 59, 999)?);
            Some(FilterValue::DateRange(start, end))
        }
        _ => Some(FilterValue::Strings(
            parts.iter().map(|p| p.to_string()).collect(),
        )),
    }
}

/// Evaluate a parsed filter against the stored value of one field.
/// `expanded_ids`, when given, replaces the filter's id set (ontology
/// descent already applied).
pub fn value_matches(
    field: &FieldDef,
    stored: &Value,
    filter: &FilterValue,
    expanded_ids: Option<&BTreeSet<Id>>,
) -> bool {
    match filter {
        FilterValue::Ints(ids) => {
            let wanted: BTreeSet<i64> = match expanded_ids {
                Some(expanded) => expanded.iter().copied().collect(),
                None => ids.iter().copied().collect(),
            };
            match field.field_type {
                FieldType::IntArray
                | FieldType::Tags
                | FieldType::Collections
                | FieldType::DataSources => stored
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_i64)
                            .any(|id| wanted.contains(&id))
                    })
                    .unwrap_or(false),
                _ => stored.as_i64().map(|id| wanted.contains(&id)).unwrap_or(false),
            }
        }
        FilterValue::Strings(values) => stored
            .as_str()
            .map(|s| values.iter().any(|v| v.eq_ignore_ascii_case(s)))
            .unwrap_or(false),
        FilterValue::DateRange(min, max) => stored
            .as_str()
            .and_then(parse_datetime_str)
            .map(|at| at >= *min && at <= *max)
            .unwrap_or(false),
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .ok()
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = parse_date(text)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn parse_datetime_str(text: &str) -> Option<DateTime<Utc>> {
    parse_datetime(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mandatory_null_is_rejected() {
        let field = FieldDef::new("name", "Name", FieldType::String).mandatory();
        assert!(coerce_value(&field, &Value::Null).is_err());

        let optional = FieldDef::new("definition", "Definition", FieldType::Textarea);
        assert_eq!(coerce_value(&optional, &Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn int_arrays_coerce_string_elements() {
        let field = FieldDef::new("tags", "Tags", FieldType::Tags);
        let out = coerce_value(&field, &json!(["3", 4])).unwrap();
        assert_eq!(out, json!([3, 4]));
        assert!(coerce_value(&field, &json!(["x"])).is_err());
    }

    #[test]
    fn sanitised_strings_lose_markup() {
        let mut field = FieldDef::new("definition", "Definition", FieldType::Textarea);
        field.validation.sanitise = true;
        let out = coerce_value(&field, &json!("<script>bad</script> text")).unwrap();
        assert_eq!(out, json!("bad text"));
    }

    #[test]
    fn length_and_regex_bounds_apply() {
        let mut field = FieldDef::new("code", "Code", FieldType::Code);
        field.validation.length = Some((2, 5));
        field.validation.regex = Some("^[A-Z]".to_string());
        assert!(coerce_value(&field, &json!("I10")).is_ok());
        assert!(coerce_value(&field, &json!("i10")).is_err());
        assert!(coerce_value(&field, &json!("TOOLONG")).is_err());
    }

    #[test]
    fn publications_require_their_composition() {
        let mut field = FieldDef::new("publications", "Publications", FieldType::Publication);
        field.validation.composition = Some(vec!["details".to_string()]);
        assert!(coerce_value(&field, &json!([{ "details": "doi" }])).is_ok());
        assert!(coerce_value(&field, &json!([{ "doi": "x" }])).is_err());
    }

    #[test]
    fn datetime_filters_normalise_to_day_bounds() {
        let field = FieldDef::new("created", "Date", FieldType::Datetime);
        let Some(FilterValue::DateRange(min, max)) =
            parse_filter_values(&field, "2024-01-01,2024-01-31")
        else {
            panic!("expected a date range");
        };
        assert_eq!(min.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(max.to_rfc3339().starts_with("2024-01-31T23:59:59"));
    }

    #[test]
    fn int_array_overlap_matching() {
        let field = FieldDef::new("tags", "Tags", FieldType::Tags);
        let filter = FilterValue::Ints(vec![2, 9]);
        assert!(value_matches(&field, &json!([1, 2, 3]), &filter, None));
        assert!(!value_matches(&field, &json!([4, 5]), &filter, None));
        assert!(!value_matches(&field, &json!(null), &filter, None));
    }

    #[test]
    fn expanded_ids_override_the_raw_filter() {
        let field = FieldDef::new("ontology", "Ontology", FieldType::IntArray);
        let filter = FilterValue::Ints(vec![1]);
        let expanded: BTreeSet<Id> = [1, 4].into_iter().collect();
        assert!(value_matches(&field, &json!([4]), &filter, Some(&expanded)));
        assert!(!value_matches(&field, &json!([4]), &filter, None));
    }
}
