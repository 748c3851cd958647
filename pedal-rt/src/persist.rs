use std::path::Path;

use anyhow::{Context, Result};
use pedal_dsp::schema::{self, ChainSpec};

/// Persist a chain spec as pretty-printed canonical v1 JSON.
///
/// Writes to `<path>.tmp` and renames over the target; rename is atomic on
/// POSIX, so readers never observe a partial file.
pub fn write(path: &Path, spec: &ChainSpec) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
    }

    let mut file_name = path
        .file_name()
        .context("persist path has no file name")?
        .to_os_string();
    file_name.push(".tmp");
    let tmp = path.with_file_name(file_name);

    let mut text = serde_json::to_string_pretty(&schema::to_json(spec))?;
    text.push('\n');

    std::fs::write(&tmp, text).with_context(|| format!("failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {:?} over {:?}", tmp, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_chain_spec;

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join("pedal_persist_test");
        let path = dir.join("nested").join("chain.json");
        let spec = default_chain_spec(48000);

        write(&path, &spec).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let reloaded =
            schema::validate(schema::parse_chain_value(&value).unwrap()).unwrap();
        assert_eq!(reloaded, spec);

        // No temp file left behind.
        assert!(!path.with_file_name("chain.json.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overwrites_existing_file() {
        let dir = std::env::temp_dir().join("pedal_persist_overwrite");
        let path = dir.join("chain.json");

        let mut spec = default_chain_spec(48000);
        write(&path, &spec).unwrap();
        spec.sample_rate = 44100;
        write(&path, &spec).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("44100"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
