use std::collections::BTreeMap;

/// Equality based selector matching every label in `labels`, e.g. `app=web,tier=db`
pub(crate) fn format_label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(",")
}
