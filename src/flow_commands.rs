use anyhow::{Context, Result, bail};
use std::{fs, path::PathBuf};
use tracing::info;

use crate::flow::loader::{FLOW_FILE_EXTENSIONS, FlowLoader};

/// Validate that the provided file is a YAML or JSON flow definition that
/// builds into a runnable flow.
pub fn validate_flow_file(flow_file: PathBuf, loader: &FlowLoader) -> Result<()> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }

    let ext = flow_file
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !FLOW_FILE_EXTENSIONS.contains(&ext.as_str()) {
        bail!("Unsupported file extension for: {}", flow_file.display());
    }

    let (code, flow) = loader
        .load_file(&flow_file)
        .with_context(|| format!("Invalid flow definition: {}", flow_file.display()))?;

    println!(
        "✅ Valid flow `{}` ({} steps): {}",
        code,
        flow.steps().count(),
        flow_file.display()
    );
    info!("✅ Valid flow `{}`: {}", code, flow_file.display());
    Ok(())
}

/// Deploy a flow file into the watched flows directory after validating it.
/// A running engine picks the file up on its next poll; otherwise it is
/// loaded at startup.
pub fn deploy_flow_file(flow_file: PathBuf, root: PathBuf, loader: &FlowLoader) -> Result<()> {
    validate_flow_file(flow_file.clone(), loader)?;

    let dest_dir = root.join("flows");
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
    let Some(file_name) = flow_file.file_name() else {
        bail!("Not a file: {}", flow_file.display());
    };
    let dest = dest_dir.join(file_name);
    fs::copy(&flow_file, &dest).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            flow_file.display(),
            dest.display()
        )
    })?;

    println!("✅ Flow deployed to {}", dest.display());
    info!("✅ Flow deployed to {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STORED: &str = r#"
    {
      "code": "ping",
      "name": "Ping",
      "steps": [
        { "code": "hello", "order": 1, "stepType": "TEXT", "messageBody": "Hola" }
      ]
    }
    "#;

    #[test]
    fn validate_rejects_missing_and_unsupported_files() {
        let dir = tempdir().unwrap();
        let loader = FlowLoader::new();

        let missing = dir.path().join("nope.json");
        assert!(validate_flow_file(missing, &loader).is_err());

        let txt = dir.path().join("flow.txt");
        fs::write(&txt, STORED).unwrap();
        assert!(validate_flow_file(txt, &loader).is_err());
    }

    #[test]
    fn deploy_copies_into_flows_dir() {
        let dir = tempdir().unwrap();
        let loader = FlowLoader::new();

        let src = dir.path().join("ping.json");
        fs::write(&src, STORED).unwrap();

        let root = dir.path().join("root");
        deploy_flow_file(src, root.clone(), &loader).unwrap();
        assert!(root.join("flows").join("ping.json").exists());
    }

    #[test]
    fn deploy_refuses_broken_definitions() {
        let dir = tempdir().unwrap();
        let loader = FlowLoader::new();

        let src = dir.path().join("broken.json");
        fs::write(&src, "{ not json").unwrap();

        let root = dir.path().join("root");
        assert!(deploy_flow_file(src, root.clone(), &loader).is_err());
        assert!(!root.join("flows").exists());
    }
}
