use std::{fs, path::PathBuf};

use anyhow::Error;
use schemars::schema_for;

use crate::flow::definition::StoredFlow;
use crate::flow::state::ConversationState;
use crate::message::OutboundMessage;

/// The entry point invoked by `main.rs` for `Commands::Schema`. Writes the
/// JSON Schemas for every shape that crosses a process boundary: the
/// admin-edited flow definition, the persisted conversation state and the
/// outbound channel payload.
pub fn write_schema(out_dir: PathBuf) -> Result<(), Error> {
    fs::create_dir_all(&out_dir)?;

    let flow_schema = schema_for!(StoredFlow);
    fs::write(
        out_dir.join("flow-definition.schema.json"),
        serde_json::to_string_pretty(&flow_schema)?,
    )?;

    let state_schema = schema_for!(ConversationState);
    fs::write(
        out_dir.join("conversation-state.schema.json"),
        serde_json::to_string_pretty(&state_schema)?,
    )?;

    let message_schema = schema_for!(OutboundMessage);
    fs::write(
        out_dir.join("outbound-message.schema.json"),
        serde_json::to_string_pretty(&message_schema)?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_schema_emits_all_files() {
        let dir = tempfile::tempdir().unwrap();
        write_schema(dir.path().to_path_buf()).unwrap();

        for name in [
            "flow-definition.schema.json",
            "conversation-state.schema.json",
            "outbound-message.schema.json",
        ] {
            let contents = std::fs::read_to_string(dir.path().join(name)).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
            assert!(parsed.get("$schema").is_some(), "{name}");
        }
    }
}
