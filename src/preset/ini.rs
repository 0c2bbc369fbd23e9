//! Router config emission
//!
//! Router mode delegates model definitions to the inference binary through
//! an INI side channel: one `[name]` section per model in declared order,
//! plus an optional `[*]` section carrying global options with sorted keys.
//! Output is byte-stable for a given preset.

use super::{mmproj_is_active, strip_file_prefix, Preset};

/// Render the router config document for a preset.
///
/// Sections are separated by a blank line. Per-model options keep their
/// declared order; the global section is sorted.
pub fn generate_config_ini(preset: &Preset) -> String {
    let mut groups: Vec<String> = Vec::with_capacity(preset.models.len() + 1);

    if !preset.options.is_empty() {
        let mut group = String::from("[*]\n");
        for key in preset.options.sorted_keys() {
            group.push_str(&format!("{key} = {}\n", preset.options.0[key]));
        }
        groups.push(group);
    }

    for entry in &preset.models {
        let mut group = format!("[{}]\n", entry.name);
        group.push_str(&format!("model = {}\n", strip_file_prefix(&entry.model)));
        if !entry.draft_model.is_empty() {
            group.push_str(&format!(
                "model-draft = {}\n",
                strip_file_prefix(&entry.draft_model)
            ));
        }
        if mmproj_is_active(&entry.mmproj) {
            group.push_str(&format!("mmproj = {}\n", strip_file_prefix(&entry.mmproj)));
        }
        for (key, value) in entry.options.iter() {
            group.push_str(&format!("{key} = {value}\n"));
        }
        groups.push(group);
    }

    groups.join("\n")
}
