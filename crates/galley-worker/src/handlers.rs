//! Handlers compiled into the worker binary.
//!
//! The pool never ships a handler to a worker; it picks one of these by
//! name on the command line.

use std::time::Duration;

use clap::ValueEnum;
use serde_json::Value;

/// Built-in job handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Handler {
    /// Return the payload unchanged.
    Identity,
    /// Uppercase string payloads.
    Upper,
    /// Reverse strings and arrays.
    Reverse,
    /// Double numeric payloads.
    Double,
    /// Tag the payload with the worker's process id.
    Pid,
    /// Sleep for `payload` milliseconds, then echo it.
    Sleep,
    /// Panic on the payload `"boom"`, echo anything else.
    Boom,
}

impl Handler {
    /// Run the handler on a JSON payload.
    pub fn apply(self, payload: Value) -> Value {
        match self {
            Self::Identity => payload,
            Self::Upper => match payload {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            },
            Self::Reverse => match payload {
                Value::String(s) => Value::String(s.chars().rev().collect()),
                Value::Array(mut items) => {
                    items.reverse();
                    Value::Array(items)
                }
                other => other,
            },
            Self::Double => double(payload),
            Self::Pid => Value::String(format!(
                "{} ran in {}",
                as_text(&payload),
                std::process::id()
            )),
            Self::Sleep => {
                if let Some(ms) = payload.as_u64() {
                    std::thread::sleep(Duration::from_millis(ms));
                }
                payload
            }
            Self::Boom => {
                if payload.as_str() == Some("boom") {
                    panic!("handler failed on payload \"boom\"");
                }
                payload
            }
        }
    }

    /// Run the handler on a plain string payload (for non-self-describing codecs).
    pub fn apply_text(self, payload: String) -> String {
        let payload = match self {
            // Numeric handlers parse their input from the text.
            Self::Sleep | Self::Double => match payload.parse::<u64>() {
                Ok(n) => Value::from(n),
                Err(_) => Value::String(payload),
            },
            _ => Value::String(payload),
        };
        as_text(&self.apply(payload))
    }
}

fn double(payload: Value) -> Value {
    if let Some(n) = payload.as_i64()
        && let Some(doubled) = n.checked_mul(2)
    {
        return Value::from(doubled);
    }
    if let Some(n) = payload.as_u64()
        && let Some(doubled) = n.checked_mul(2)
    {
        return Value::from(doubled);
    }
    if let Some(n) = payload.as_f64() {
        return Value::from(n * 2.0);
    }
    payload
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity() {
        for value in [json!(0), json!("job 0"), json!({"a": [1, 2]}), json!(null)] {
            assert_eq!(Handler::Identity.apply(value.clone()), value);
        }
    }

    #[test]
    fn test_upper_and_reverse() {
        assert_eq!(Handler::Upper.apply(json!("job 1")), json!("JOB 1"));
        assert_eq!(Handler::Upper.apply(json!(3)), json!(3));
        assert_eq!(Handler::Reverse.apply(json!("abc")), json!("cba"));
        assert_eq!(Handler::Reverse.apply(json!([1, 2, 3])), json!([3, 2, 1]));
    }

    #[test]
    fn test_double() {
        assert_eq!(Handler::Double.apply(json!(21)), json!(42));
        assert_eq!(Handler::Double.apply(json!(-4)), json!(-8));
        assert_eq!(Handler::Double.apply(json!(1.5)), json!(3.0));
        assert_eq!(Handler::Double.apply(json!("x")), json!("x"));
    }

    #[test]
    fn test_pid_tag() {
        let tagged = Handler::Pid.apply(json!("job 3"));
        let expected = format!("job 3 ran in {}", std::process::id());
        assert_eq!(tagged, json!(expected));
    }

    #[test]
    fn test_boom_passes_other_payloads() {
        assert_eq!(Handler::Boom.apply(json!("ok")), json!("ok"));
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_boom_panics() {
        Handler::Boom.apply(json!("boom"));
    }

    #[test]
    fn test_apply_text() {
        assert_eq!(Handler::Upper.apply_text("abc".to_string()), "ABC");
        assert_eq!(Handler::Double.apply_text("21".to_string()), "42");
        assert_eq!(Handler::Identity.apply_text("7".to_string()), "7");
        assert_eq!(Handler::Sleep.apply_text("1".to_string()), "1");
    }
}
