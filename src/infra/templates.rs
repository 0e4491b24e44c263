use std::{collections::BTreeMap, fs, path::Path};

use walkdir::WalkDir;

use super::error::InfraError;

/// Read every regular file under `dir` into a path → content map.
///
/// Keys are relative to `dir` and always use `/` as the separator, so the
/// map matches what a browser host would post.
pub fn collect_files(dir: &Path) -> Result<BTreeMap<String, String>, InfraError> {
    if !dir.is_dir() {
        return Err(InfraError::templates(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|err| InfraError::templates(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|err| InfraError::templates(err.to_string()))?;
        let key = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let content = fs::read_to_string(entry.path()).map_err(|err| {
            InfraError::templates(format!("failed to read {}: {err}", entry.path().display()))
        })?;
        files.insert(key, content);
    }

    Ok(files)
}
