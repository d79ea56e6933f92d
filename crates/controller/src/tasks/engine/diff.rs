//! Desired-vs-observed comparison.
//!
//! The API server adds defaults, status and bookkeeping metadata to every
//! object, so observed state is never equal to what we wrote. An object is
//! considered converged when every field we set is present with the same
//! value; extra observed fields are ignored.
//!
//! Resource quantities are compared by value: the server rewrites `1000m` as
//! `1` and `1024Mi` as `1Gi`.

use serde_json::Value;

/// Maps whose values are all quantities (`resources.limits`, `resources.requests`)
const QUANTITY_MAPS: [&str; 2] = ["limits", "requests"];
/// Single quantity fields (`emptyDir.sizeLimit`)
const QUANTITY_FIELDS: [&str; 1] = ["sizeLimit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Plain,
    QuantityMap,
    Quantity,
}

impl Field {
    fn child(self, key: &str) -> Self {
        if self == Self::QuantityMap || QUANTITY_FIELDS.contains(&key) {
            Self::Quantity
        } else if QUANTITY_MAPS.contains(&key) {
            Self::QuantityMap
        } else {
            Self::Plain
        }
    }
}

/// True when `desired` is contained in `observed`.
///
/// Objects match key by key, arrays must have the same length and match
/// element-wise, scalars must be equal. Empty or null desired values match
/// an absent field since the server drops them.
#[must_use]
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    subset(desired, observed, Field::Plain)
}

fn subset(desired: &Value, observed: &Value, field: Field) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            match have.get(key) {
                Some(found) => subset(value, found, field.child(key)),
                None => is_empty(value),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want
                    .iter()
                    .zip(have)
                    .all(|(w, h)| subset(w, h, Field::Plain))
        }
        (want, Value::Null) => is_empty(want),
        (Value::String(want), Value::String(have)) if field == Field::Quantity => {
            want == have || same_quantity(want, have)
        }
        (want, have) => want == have,
    }
}

fn same_quantity(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Value of a quantity in billionths of a unit, rounded up.
/// `None` when `input` is not a quantity or does not fit.
fn parse_quantity(input: &str) -> Option<i128> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
        .unwrap_or(input.len());
    let (number, suffix) = input.split_at(split);
    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{whole}{fraction}");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mantissa: i128 = digits.parse().ok()?;

    let (base, exponent): (i128, i32) = match suffix {
        "" => (1, 0),
        "n" => (1, -9),
        "u" => (1, -6),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        other => (1, other.strip_prefix(['e', 'E'])?.parse().ok()?),
    };

    let scale = exponent + 9 - i32::try_from(fraction.len()).ok()?;
    let scaled = mantissa.checked_mul(base)?;
    let value = if scale >= 0 {
        scaled.checked_mul(10_i128.checked_pow(u32::try_from(scale).ok()?)?)?
    } else {
        let divisor = 10_i128.checked_pow(scale.unsigned_abs())?;
        (scaled + divisor - 1) / divisor
    };
    Some(if negative { -value } else { value })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.values().all(is_empty),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_added_fields_are_ignored() {
        let desired = json!({"metadata": {"name": "app"}, "spec": {"replicas": 2}});
        let observed = json!({
            "metadata": {"name": "app", "uid": "123", "resourceVersion": "9"},
            "spec": {"replicas": 2, "revisionHistoryLimit": 10},
            "status": {"readyReplicas": 2}
        });
        assert!(is_subset(&desired, &observed));
    }

    #[test]
    fn changed_scalar_is_detected() {
        let desired = json!({"spec": {"replicas": 3}});
        let observed = json!({"spec": {"replicas": 2}});
        assert!(!is_subset(&desired, &observed));
    }

    #[test]
    fn arrays_must_match_in_length() {
        let desired = json!({"env": [{"name": "A"}]});
        let observed = json!({"env": [{"name": "A"}, {"name": "B"}]});
        assert!(!is_subset(&desired, &observed));

        let observed = json!({"env": [{"name": "A", "valueFrom": null}]});
        assert!(is_subset(&desired, &observed));
    }

    #[test]
    fn empty_desired_matches_missing() {
        let desired = json!({"spec": {"args": [], "annotations": {}}});
        let observed = json!({"spec": {}});
        assert!(is_subset(&desired, &observed));
    }

    #[test]
    fn quantities_match_in_canonical_form() {
        let desired = json!({"spec": {
            "containers": [{"resources": {
                "limits": {"cpu": "1000m", "memory": "1024Mi"},
                "requests": {"cpu": "0.5", "memory": "1e3"}
            }}],
            "volumes": [{"emptyDir": {"sizeLimit": "2048Mi"}}]
        }});
        let observed = json!({"spec": {
            "containers": [{"resources": {
                "limits": {"cpu": "1", "memory": "1Gi"},
                "requests": {"cpu": "500m", "memory": "1k"}
            }}],
            "volumes": [{"emptyDir": {"sizeLimit": "2Gi"}}]
        }});
        assert!(is_subset(&desired, &observed));

        let resized = json!({"spec": {"containers": [{
            "resources": {"limits": {"cpu": "250m"}}
        }]}});
        assert!(!is_subset(&resized, &observed));
    }

    #[test]
    fn other_strings_are_compared_verbatim() {
        let desired = json!({"env": [{"name": "WORKERS", "value": "1.0"}]});
        let observed = json!({"env": [{"name": "WORKERS", "value": "1"}]});
        assert!(!is_subset(&desired, &observed));
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity("1"), Some(1_000_000_000));
        assert_eq!(parse_quantity("100m"), parse_quantity("0.1"));
        assert_eq!(parse_quantity("1Ki"), Some(1024 * 1_000_000_000));
        assert_eq!(parse_quantity("1n"), Some(1));
        assert_eq!(parse_quantity("2.5Gi"), parse_quantity("2560Mi"));
        assert_eq!(parse_quantity("abc"), None);
        assert_eq!(parse_quantity("1Xi"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn missing_value_is_detected() {
        let desired = json!({"spec": {"host": "a.example.com"}});
        let observed = json!({"spec": {}});
        assert!(!is_subset(&desired, &observed));
    }
}
