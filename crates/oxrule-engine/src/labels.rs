use oxrule_common::types::METRIC_NAME_LABEL;
use oxrule_common::Metric;
use std::collections::BTreeMap;

/// Two views over the labels of one query result row.
///
/// `origin` keeps the labels as received (extra labels only fill gaps) and
/// is what templates see. `processed` is attached to the alert and written
/// series; extra labels win there and a displaced original value moves to
/// `exported_<name>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSet {
    pub origin: BTreeMap<String, String>,
    pub processed: BTreeMap<String, String>,
}

impl LabelSet {
    /// Seeds both views from a metric; `__name__` is dropped from `processed`.
    pub fn from_metric(m: &Metric) -> Self {
        let mut ls = Self::default();
        for l in &m.labels {
            ls.origin.insert(l.name.clone(), l.value.clone());
            if l.name == METRIC_NAME_LABEL {
                continue;
            }
            ls.processed.insert(l.name.clone(), l.value.clone());
        }
        ls
    }

    pub fn add(&mut self, k: &str, v: &str) {
        self.processed.insert(k.to_string(), v.to_string());
        match self.origin.get(k) {
            None => {
                self.origin.insert(k.to_string(), v.to_string());
            }
            Some(ov) if ov != v => {
                self.processed.insert(format!("exported_{k}"), ov.clone());
            }
            Some(_) => {}
        }
    }
}

/// Renders a label map as `{k="v", ...}` for error messages.
pub fn fmt_labels(labels: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", pairs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_extra_label_is_exported() {
        let m = Metric::instant(&[("__name__", "up"), ("job", "bar")], 0, 1.0);
        let mut ls = LabelSet::from_metric(&m);
        ls.add("job", "baz");
        assert_eq!(ls.processed["job"], "baz");
        assert_eq!(ls.processed["exported_job"], "bar");
        assert_eq!(ls.origin["job"], "bar");
        assert!(!ls.processed.contains_key("__name__"));
        assert_eq!(ls.origin["__name__"], "up");
    }

    #[test]
    fn equal_or_new_labels_are_not_exported() {
        let m = Metric::instant(&[("job", "bar")], 0, 1.0);
        let mut ls = LabelSet::from_metric(&m);
        ls.add("job", "bar");
        ls.add("env", "prod");
        assert_eq!(ls.processed.len(), 2);
        assert_eq!(ls.origin["env"], "prod");
    }
}
