use crate::dsl::ProcessDefinition;
use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use std::path::Path;

pub fn load_process_from_yaml(file_path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    parse_process_yaml(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path.display()))
}

pub fn parse_process_yaml(yaml_content: &str) -> Result<ProcessDefinition> {
    Ok(serde_yaml::from_str(yaml_content)?)
}

/// Loads every `.yaml`/`.yml` file of a directory, sorted by file name.
pub fn load_processes_from_dir(dir: impl AsRef<Path>) -> Result<Vec<ProcessDefinition>> {
    let dir = dir.as_ref();
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(load_process_from_yaml).collect()
}
