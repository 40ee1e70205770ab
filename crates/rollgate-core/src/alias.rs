//! Channel alias table: resolves an Omaha `track` name to a group id for
//! a given application and architecture.

use std::collections::HashMap;

use crate::config::ChannelAlias;
use crate::types::Arch;

/// Strip the braces Omaha clients wrap around app ids and lowercase.
pub fn normalize_app_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct ChannelAliases {
    entries: HashMap<(String, Arch, String), String>,
}

impl ChannelAliases {
    pub fn new(aliases: &[ChannelAlias]) -> Self {
        let entries = aliases
            .iter()
            .map(|a| {
                (
                    (normalize_app_id(&a.app_id), a.arch, a.name.clone()),
                    a.group_id.clone(),
                )
            })
            .collect();
        Self { entries }
    }

    /// Look up `name` for `app_id` on `arch`, falling back to an alias
    /// registered for [`Arch::All`].
    pub fn resolve(&self, app_id: &str, arch: Arch, name: &str) -> Option<&str> {
        let app_id = normalize_app_id(app_id);
        self.entries
            .get(&(app_id.clone(), arch, name.to_string()))
            .or_else(|| self.entries.get(&(app_id, Arch::All, name.to_string())))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
