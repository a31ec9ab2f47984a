/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Redaction and truncation helpers shared by request capture and exception snapshots.

use serde_json::Value;
use std::fmt::Debug;

use crate::MASK_SENTINEL;

/// Longest representation kept for a captured local binding.
pub const MAX_REPR_LEN: usize = 100;

/// Replaces the value of every object key for which `is_masked` returns true, recursing
/// through nested objects and arrays.
pub fn mask_in_place(value: &mut Value, is_masked: &dyn Fn(&str) -> bool) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if is_masked(key) {
                    *inner = Value::String(MASK_SENTINEL.to_string());
                } else {
                    mask_in_place(inner, is_masked);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                mask_in_place(item, is_masked);
            }
        }
        _ => (),
    }
}

/// Cuts `s` down to at most `max_chars` characters, marking the cut with a trailing `...`
/// that counts towards the limit.
pub fn truncate_marked(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Like [`truncate_marked`] but appends the marker after `max_chars` characters.
pub fn truncate_appended(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// `Debug` representation bounded to [`MAX_REPR_LEN`] characters.
pub fn safe_repr(value: &dyn Debug) -> String {
    truncate_marked(&format!("{value:?}"), MAX_REPR_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_nested_keys() {
        let mut body = json!({
            "user": {"name": "ann", "password": "pw"},
            "tokens": [{"token": "t1"}, {"kind": "x"}],
            "Secret": "s"
        });
        mask_in_place(&mut body, &|k| ["password", "token", "secret"].contains(&k.to_lowercase().as_str()));

        assert_eq!(body["user"]["password"], json!(MASK_SENTINEL));
        assert_eq!(body["user"]["name"], json!("ann"));
        assert_eq!(body["tokens"][0]["token"], json!(MASK_SENTINEL));
        assert_eq!(body["tokens"][1]["kind"], json!("x"));
        assert_eq!(body["Secret"], json!(MASK_SENTINEL));
    }

    #[test]
    fn masked_subtree_is_replaced_whole() {
        let mut body = json!({"secret": {"inner": 1}});
        mask_in_place(&mut body, &|k| k == "secret");
        assert_eq!(body["secret"], json!(MASK_SENTINEL));
    }

    #[test]
    fn repr_is_bounded() {
        let long = "x".repeat(500);
        let repr = safe_repr(&long);
        assert_eq!(repr.chars().count(), MAX_REPR_LEN);
        assert!(repr.ends_with("..."));
        assert_eq!(safe_repr(&42), "42");
    }

    #[test]
    fn appended_truncation_keeps_prefix() {
        assert_eq!(truncate_appended("abcdef", 3), "abc...");
        assert_eq!(truncate_appended("abc", 3), "abc");
        assert_eq!(truncate_marked("ééééé", 4), "é...");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const SECRET: &str = "s3cr3t-value";

        fn random_case(key: &str, flips: &[bool]) -> String {
            key.chars()
                .zip(flips.iter().cycle())
                .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c })
                .collect()
        }

        fn nest(leaf: Value, path: &[(bool, String)]) -> Value {
            path.iter().rev().fold(leaf, |inner, (in_array, key)| {
                if *in_array {
                    json!([{ "other": 1 }, inner])
                } else {
                    json!({ key.clone(): inner, "plain": "kept" })
                }
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn masked_key_never_keeps_its_value(
                key in prop::sample::select(vec!["password", "token", "api_key"]),
                flips in prop::collection::vec(any::<bool>(), 1..8),
                path in prop::collection::vec((any::<bool>(), "[a-z]{1,6}"), 0..5),
            ) {
                let cased = random_case(key, &flips);
                let mut body = nest(json!({ cased: SECRET }), &path);
                mask_in_place(&mut body, &|k| {
                    ["password", "token", "api_key"].contains(&k.to_ascii_lowercase().as_str())
                });

                let rendered = body.to_string();
                prop_assert!(!rendered.contains(SECRET));
                prop_assert!(rendered.contains(MASK_SENTINEL));
            }
        }
    }
}
