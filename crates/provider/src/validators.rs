//! Attribute validators
//!
//! A validator receives the attribute name and its known, non-null value.
//! String validators applied to a list check every element.

use std::net::Ipv4Addr;
use std::sync::Arc;

use base64::Engine;
use harvester_common::ids::{id_parts, is_dns1123_subdomain};
use harvester_common::net::is_ipv4_cidr;

use crate::state::Value;

pub type Validator = Arc<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

fn each_string(
    value: &Value,
    check: impl Fn(&str) -> Result<(), String>,
) -> Result<(), String> {
    match value {
        Value::String(s) => check(s),
        Value::List(items) => items
            .iter()
            .filter_map(Value::as_str)
            .try_for_each(check),
        _ => Ok(()),
    }
}

pub fn not_empty() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| {
            if s.trim().is_empty() {
                Err(format!("{} must not be empty", name))
            } else {
                Ok(())
            }
        })
    })
}

pub fn int_between(min: i64, max: i64) -> Validator {
    Arc::new(move |name, value| match value.as_i64() {
        Some(v) if v < min || v > max => Err(format!(
            "expected {} to be in the range ({} - {}), got {}",
            name, min, max, v
        )),
        Some(_) => Ok(()),
        None => Err(format!("expected type of {} to be integer", name)),
    })
}

pub fn int_at_least(min: i64) -> Validator {
    Arc::new(move |name, value| match value.as_i64() {
        Some(v) if v < min => Err(format!(
            "expected {} to be at least ({}), got {}",
            name, min, v
        )),
        _ => Ok(()),
    })
}

pub fn string_in_slice(allowed: &'static [&'static str]) -> Validator {
    Arc::new(move |name, value| {
        each_string(value, |s| {
            if allowed.contains(&s) {
                Ok(())
            } else {
                Err(format!(
                    "expected {} to be one of [{}], got {}",
                    name,
                    allowed.join(" "),
                    s
                ))
            }
        })
    })
}

pub fn cidr() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| {
            if is_ipv4_cidr(s) {
                Ok(())
            } else {
                Err(format!("expected {} to be a valid IPv4 CIDR, got {}", name, s))
            }
        })
    })
}

pub fn ipv4() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| match s.parse::<Ipv4Addr>() {
            Ok(_) => Ok(()),
            Err(_) => Err(format!("expected {} to contain a valid IPv4 address, got: {}", name, s)),
        })
    })
}

pub fn quantity() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| {
            if parse_quantity(s).is_some() {
                Ok(())
            } else {
                Err(format!(
                    "{} is not a valid Kubernetes quantity: {}",
                    name, s
                ))
            }
        })
    })
}

pub fn namespaced_name() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| match id_parts(s) {
            Ok(_) => Ok(()),
            Err(_) => Err(format!(
                "expected {} to be a name or namespace/name, got {}",
                name, s
            )),
        })
    })
}

pub fn dns1123() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| {
            if is_dns1123_subdomain(s) {
                Ok(())
            } else {
                Err(format!(
                    "{} {:?} must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character",
                    name, s
                ))
            }
        })
    })
}

pub fn base64() -> Validator {
    Arc::new(|name, value| {
        each_string(value, |s| {
            match base64::engine::general_purpose::STANDARD.decode(s) {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("{} is not valid base64: {}", name, e)),
            }
        })
    })
}

/// Parse a Kubernetes resource quantity such as `10Gi`, `500m` or `1e3`
/// into its numeric value.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..].parse().ok()?;
            10f64.powi(power)
        }
        _ => return None,
    };
    Some(number * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{int_value, string_list_value, string_value};

    #[test]
    fn test_not_empty() {
        let v = not_empty();
        assert_eq!(
            v("display_name", &string_value("")).unwrap_err(),
            "display_name must not be empty"
        );
        assert!(v("display_name", &string_value("ubuntu")).is_ok());
    }

    #[test]
    fn test_int_between() {
        let v = int_between(0, 4094);
        assert!(v("vlan_id", &int_value(0)).is_ok());
        assert!(v("vlan_id", &int_value(4094)).is_ok());
        assert_eq!(
            v("vlan_id", &int_value(4095)).unwrap_err(),
            "expected vlan_id to be in the range (0 - 4094), got 4095"
        );
    }

    #[test]
    fn test_string_in_slice_checks_lists() {
        let v = string_in_slice(&["virtio", "sata"]);
        assert!(v("bus", &string_value("virtio")).is_ok());
        assert!(v("bus", &string_list_value(["virtio", "ide"])).is_err());
    }

    #[test]
    fn test_network_validators() {
        assert!(cidr()("route_cidr", &string_value("172.16.0.0/24")).is_ok());
        assert!(cidr()("route_cidr", &string_value("172.16.0.0")).is_err());
        assert!(ipv4()("gateway", &string_value("10.0.0.1")).is_ok());
        assert!(ipv4()("gateway", &string_value("10.0.0")).is_err());
    }

    #[test]
    fn test_quantity() {
        assert_eq!(parse_quantity("2Gi"), Some(2.0 * 1024f64.powi(3)));
        assert_eq!(parse_quantity("500m"), Some(0.5));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert!(parse_quantity("10GB").is_none());
        assert!(parse_quantity("").is_none());
        assert!(quantity()("memory", &string_value("1Gi")).is_ok());
    }

    #[test]
    fn test_names() {
        assert!(namespaced_name()("image", &string_value("default/ubuntu")).is_ok());
        assert!(namespaced_name()("image", &string_value("a/b/c")).is_err());
        assert!(dns1123()("name", &string_value("Bad_Name")).is_err());
        assert!(base64()("user_data_base64", &string_value("aGVsbG8=")).is_ok());
        assert!(base64()("user_data_base64", &string_value("%%%")).is_err());
    }
}
