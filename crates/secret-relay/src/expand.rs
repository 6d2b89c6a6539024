//! Environment-variable expansion for config values.
//!
//! Supports `$VAR` and `${VAR}`; unset variables expand to the empty
//! string. The config schema decides which fields are expanded, one
//! explicit call per string field.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex")
});

pub(crate) fn expand(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

pub(crate) fn in_place(value: &mut String) {
    *value = expand(value);
}

pub(crate) fn each(values: &mut [String]) {
    for value in values {
        in_place(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(expand("https://vault:8200"), "https://vault:8200");
    }

    #[test]
    fn dollar_form_expands() {
        std::env::set_var("TEST_EXPAND_A", "value-a");
        assert_eq!(expand("$TEST_EXPAND_A"), "value-a");
    }

    #[test]
    fn braced_form_expands() {
        std::env::set_var("TEST_EXPAND_B", "value-b");
        assert_eq!(expand("prefix-${TEST_EXPAND_B}-suffix"), "prefix-value-b-suffix");
    }

    #[test]
    fn unset_variables_expand_to_empty() {
        assert_eq!(expand("x${TEST_EXPAND_DEFINITELY_UNSET}y"), "xy");
    }

    #[test]
    fn multiple_variables_in_one_string() {
        std::env::set_var("TEST_EXPAND_C", "c");
        std::env::set_var("TEST_EXPAND_D", "d");
        assert_eq!(expand("$TEST_EXPAND_C/${TEST_EXPAND_D}"), "c/d");
    }

    #[test]
    fn lone_dollar_is_untouched() {
        assert_eq!(expand("cost: 5$"), "cost: 5$");
    }
}
