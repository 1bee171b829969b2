use anyhow::Result;

use fedsearch_core::capabilities::SourceCapabilities;

use crate::config::Config;
use crate::traits::BackendRegistry;

/// One line per filter: `field(op|op)`.
pub fn describe_filters(caps: &SourceCapabilities) -> String {
    if caps.filters.is_empty() {
        return "-".to_string();
    }
    caps.filters
        .iter()
        .map(|f| {
            let ops: Vec<&str> = f.operators.iter().map(|o| o.as_str()).collect();
            format!("{}({})", f.field, ops.join("|"))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tally modes and their grouping fields, or `None` for search-only sources.
pub fn describe_modes(caps: &SourceCapabilities) -> Option<String> {
    if caps.modes.is_empty() {
        return None;
    }
    let modes: Vec<&str> = caps.modes.iter().map(|m| m.as_str()).collect();
    let mut out = modes.join(",");
    if !caps.group_by.is_empty() {
        out.push_str(&format!(" by {}", caps.group_by.join("|")));
    }
    Some(out)
}

fn kind_label(caps: &SourceCapabilities) -> String {
    match serde_json::to_value(caps.kind) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "other".to_string(),
    }
}

/// Print every configured backend and what it accepts.
pub fn list_sources(config: &Config) -> Result<()> {
    let registry = BackendRegistry::from_config(config)?;

    println!("{:<18} {:<16} {:<30} FILTERS", "SOURCE", "KIND", "METHODS");
    for backend in registry.backends() {
        let caps = backend.capabilities();
        let methods: Vec<&str> = caps.methods.iter().map(|m| m.as_str()).collect();
        println!(
            "{:<18} {:<16} {:<30} {}",
            caps.name,
            kind_label(caps),
            methods.join(","),
            describe_filters(caps)
        );
        if !caps.aliases.is_empty() {
            println!("{:<18} aliases: {}", "", caps.aliases.join(", "));
        }
        if let Some(modes) = describe_modes(caps) {
            println!("{:<18} modes: {}", "", modes);
        }
        println!("{:<18} {}", "", backend.description());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsearch_core::capabilities::SourceKind;
    use fedsearch_core::models::{FilterOperator::*, RetrievalMethod::*, SearchMode};

    #[test]
    fn filters_render_with_operators() {
        let caps = SourceCapabilities::new("email", &[Structured])
            .with_filter("date_after", &[Gte])
            .with_filter("from_name", &[Eq, Contains]);
        assert_eq!(describe_filters(&caps), "date_after(gte) from_name(eq|contains)");
        assert_eq!(describe_filters(&SourceCapabilities::new("notes", &[Fulltext])), "-");
    }

    #[test]
    fn modes_render_with_group_fields() {
        let caps = SourceCapabilities::new("whatsapp", &[Structured])
            .with_modes(&[SearchMode::Aggregate, SearchMode::Count])
            .with_group_by(&["sender", "chat_id"]);
        assert_eq!(describe_modes(&caps).as_deref(), Some("count,aggregate by sender|chat_id"));
        assert_eq!(describe_modes(&SourceCapabilities::new("notes", &[Fulltext])), None);
    }

    #[test]
    fn kind_uses_config_spelling() {
        let caps = SourceCapabilities::new("history", &[Structured]).with_kind(SourceKind::BrowserHistory);
        assert_eq!(kind_label(&caps), "browser_history");
    }
}
