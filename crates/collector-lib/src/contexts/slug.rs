//! Identifier normalisation for chart and dimension ids

/// Characters replaced by `_` when building ids from label values
const REPLACED: &[char] = &[' ', '.', '-', '/', ':', '=', ',', '(', ')'];

/// Lower-case `value` and replace separator characters with `_`, one for
/// one. Everything else, non-ASCII included, is kept.
pub fn slugify(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if REPLACED.contains(&c) { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_values() {
        assert_eq!(slugify("test(value)"), "test_value_");
        assert_eq!(slugify("  test  "), "__test__");
        assert_eq!(slugify(".-/:=,()"), "________");
        assert_eq!(
            slugify("test.value-123/path:name=key,val(1)"),
            "test_value_123_path_name_key_val_1_"
        );
        assert_eq!(slugify("Café"), "café");
        assert_eq!(slugify("SYSTEM.DEFAULT.LOCAL.QUEUE"), "system_default_local_queue");
        assert_eq!(slugify(""), "");
    }

    proptest! {
        #[test]
        fn prop_deterministic(s in ".*") {
            prop_assert_eq!(slugify(&s), slugify(&s));
        }

        #[test]
        fn prop_no_separators_left(s in ".*") {
            let slug = slugify(&s);
            prop_assert!(!slug.chars().any(|c| REPLACED.contains(&c)));
        }

        #[test]
        fn prop_ascii_length_preserved(s in "[ -~]*") {
            prop_assert_eq!(slugify(&s).len(), s.len());
        }

        #[test]
        fn prop_idempotent(s in "[ -~]*") {
            let once = slugify(&s);
            prop_assert_eq!(slugify(&once), once.clone());
        }
    }
}
