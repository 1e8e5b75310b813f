//! Scenario-scoped variable store.
//!
//! Steps capture values (a response field, a header) under a name; every
//! subsequent step's text is run through [`VariableStore::replace`] before
//! dispatch, substituting `{{name}}` with the stored value. The store is
//! cleared at scenario boundaries.
//!
//! A handful of dynamic generators are built in:
//!
//! - `{{uuid}}` — random UUID v4
//! - `{{timestamp}}` — current RFC 3339 timestamp (UTC)
//! - `{{timestamp:unix}}` — Unix timestamp in seconds
//! - `{{random:N}}` — random alphanumeric string of length N
//! - `{{random:N:numeric}}` — random numeric string of length N
//! - `{{sequence:name}}` — auto-incrementing sequence per name

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use rand::Rng;
use regex::{Captures, Regex};
use uuid::Uuid;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"));

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const NUMERIC: &[u8] = b"0123456789";

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    sequences: HashMap<String, u64>,
}

/// Thread-safe store for captured scenario values.
///
/// Passed into handlers as an explicit shared object rather than living as
/// a process-wide static.
#[derive(Default)]
pub struct VariableStore {
    inner: RwLock<Inner>,
}

impl VariableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a name, replacing any previous value.
    pub fn set(&self, name: &str, value: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.values.insert(String::from(name), String::from(value));
        }
    }

    /// Fetch a stored value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.values.get(name).cloned())
    }

    /// Clear all values and sequences. Called at scenario boundaries.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.values.clear();
            inner.sequences.clear();
        }
    }

    /// Substitute every `{{name}}` placeholder in `input`.
    ///
    /// Dynamic generators take precedence over stored values; placeholders
    /// that resolve to neither are left verbatim.
    #[must_use]
    pub fn replace(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures<'_>| {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                if let Some(generated) = self.generate_dynamic(name) {
                    return generated;
                }
                self.get(name)
                    .unwrap_or_else(|| caps.get(0).map(|m| String::from(m.as_str())).unwrap_or_default())
            })
            .into_owned()
    }

    fn generate_dynamic(&self, name: &str) -> Option<String> {
        match name {
            "uuid" => return Some(Uuid::new_v4().to_string()),
            "timestamp" => {
                return Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
            }
            "timestamp:unix" => return Some(chrono::Utc::now().timestamp().to_string()),
            _ => {}
        }

        if let Some(spec) = name.strip_prefix("random:") {
            return generate_random(spec);
        }
        if let Some(sequence) = name.strip_prefix("sequence:") {
            return self.next_sequence(sequence);
        }
        None
    }

    fn next_sequence(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        let mut inner = self.inner.write().ok()?;
        let counter = inner.sequences.entry(String::from(name)).or_insert(0);
        *counter += 1;
        Some(counter.to_string())
    }
}

/// `random:N` or `random:N:numeric`.
fn generate_random(spec: &str) -> Option<String> {
    let mut parts = spec.split(':');
    let length: usize = parts.next()?.parse().ok().filter(|len| *len > 0)?;
    let charset = match parts.next() {
        Some("numeric") => NUMERIC,
        None => ALPHANUMERIC,
        Some(_) => return None,
    };

    let mut rng = rand::thread_rng();
    Some(
        (0..length)
            .map(|_| char::from(charset[rng.gen_range(0..charset.len())]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn stored_values_substitute_into_text() {
        let store = VariableStore::new();
        store.set("user_id", "42");
        assert_eq!(
            store.replace("\"api\" sends \"GET\" to \"/users/{{user_id}}\""),
            "\"api\" sends \"GET\" to \"/users/42\""
        );
    }

    #[rstest]
    fn unknown_placeholders_stay_verbatim() {
        let store = VariableStore::new();
        assert_eq!(store.replace("value is {{nope}}"), "value is {{nope}}");
    }

    #[rstest]
    fn reset_clears_values_and_sequences() {
        let store = VariableStore::new();
        store.set("token", "abc");
        assert_eq!(store.replace("{{sequence:order}}"), "1");

        store.reset();
        assert_eq!(store.get("token"), None);
        // Sequence restarts after reset.
        assert_eq!(store.replace("{{sequence:order}}"), "1");
    }

    #[rstest]
    fn uuid_generator_produces_valid_uuids() {
        let store = VariableStore::new();
        let generated = store.replace("{{uuid}}");
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[rstest]
    fn timestamp_generators_produce_parseable_values() {
        let store = VariableStore::new();

        let rfc3339 = store.replace("{{timestamp}}");
        assert!(chrono::DateTime::parse_from_rfc3339(&rfc3339).is_ok());

        let unix = store.replace("{{timestamp:unix}}");
        assert!(unix.parse::<i64>().is_ok());
    }

    #[rstest]
    #[case("{{random:8}}", 8)]
    #[case("{{random:12:numeric}}", 12)]
    fn random_generators_respect_length(#[case] input: &str, #[case] length: usize) {
        let store = VariableStore::new();
        let generated = store.replace(input);
        assert_eq!(generated.len(), length);
        if input.contains("numeric") {
            assert!(generated.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[rstest]
    fn sequences_increment_independently_per_name() {
        let store = VariableStore::new();
        assert_eq!(store.replace("{{sequence:a}}"), "1");
        assert_eq!(store.replace("{{sequence:a}}"), "2");
        assert_eq!(store.replace("{{sequence:b}}"), "1");
    }

    #[rstest]
    fn dynamic_generators_win_over_stored_values() {
        let store = VariableStore::new();
        store.set("uuid", "not-a-uuid");
        let generated = store.replace("{{uuid}}");
        assert_ne!(generated, "not-a-uuid");
    }

    #[rstest]
    fn malformed_random_spec_stays_verbatim() {
        let store = VariableStore::new();
        assert_eq!(store.replace("{{random:zero}}"), "{{random:zero}}");
        assert_eq!(store.replace("{{random:4:hex}}"), "{{random:4:hex}}");
    }
}
