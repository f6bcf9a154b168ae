use crate::types::METRIC_NAME_LABEL;
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Identity of a label set.
///
/// Pairs are visited in name order, `__name__` is skipped, and every pair is
/// terminated by a `0xff` byte. FNV-1a keeps identities stable across
/// restarts, unlike `DefaultHasher`.
///
/// # Examples
///
/// ```
/// use oxrule_common::hash_labels;
/// use std::collections::BTreeMap;
///
/// let mut a = BTreeMap::new();
/// a.insert("job".to_string(), "node".to_string());
/// let mut b = a.clone();
/// b.insert("__name__".to_string(), "up".to_string());
/// assert_eq!(hash_labels(&a), hash_labels(&b));
/// ```
pub fn hash_labels(labels: &BTreeMap<String, String>) -> u64 {
    let mut h = FnvHasher::default();
    for (name, value) in labels {
        if name == METRIC_NAME_LABEL {
            continue;
        }
        h.write(name.as_bytes());
        h.write(value.as_bytes());
        h.write(&[0xff]);
    }
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn fnv_matches_reference_vectors() {
        let mut h = FnvHasher::default();
        assert_eq!(h.finish(), 0xcbf2_9ce4_8422_2325);
        h.write(b"a");
        assert_eq!(h.finish(), 0xaf63_dc4c_8601_ec8c);
        h.write(b"bc");
        assert_eq!(h.finish(), 0xe71f_a219_0541_574b);
    }

    #[test]
    fn hash_is_insertion_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let b = labels(&[("a", "1"), ("b", "2")]);
        assert_eq!(hash_labels(&a), hash_labels(&b));
    }

    #[test]
    fn hash_terminates_each_pair_not_each_field() {
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        // name and value are written back to back; only pairs are terminated
        assert_eq!(hash_labels(&a), hash_labels(&b));
        let c = labels(&[("a", "b"), ("c", "")]);
        assert_ne!(hash_labels(&a), hash_labels(&c));
    }

    #[test]
    fn hash_differs_for_different_values() {
        assert_ne!(
            hash_labels(&labels(&[("job", "a")])),
            hash_labels(&labels(&[("job", "b")]))
        );
    }
}
