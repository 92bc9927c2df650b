use std::{fs, path::Path};

use anyhow::Result;
use delivery_plugin::{ConfigCategory, ConfigItem, PluginInformation};
use schemars::schema_for;

use crate::plugin::default_config;

/// Write the JSON schemas a host needs to talk to this plugin, plus the
/// default configuration, into `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)?;

    let files = [
        ("config-category.schema.json", serde_json::to_string_pretty(&schema_for!(ConfigCategory))?),
        ("config-item.schema.json", serde_json::to_string_pretty(&schema_for!(ConfigItem))?),
        ("plugin-information.schema.json", serde_json::to_string_pretty(&schema_for!(PluginInformation))?),
        ("default-config.json", serde_json::to_string_pretty(&default_config())?),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        fs::write(out_dir.join(name), content)?;
        written.push(name.to_string());
    }
    Ok(written)
}
