// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use serde_json::Value;
use task_protocol::{TaskBody, TaskResponse};
use tracing::info;

use crate::{bundle::Bundle, config::TaskQueueConfig, process::ProcessRegistry};

/// The entry point invoked by `main.rs` for `Commands::Schema`.
///
/// Writes the wire schemas (task payload, response, bundle, queue config) and
/// one spec file per registered process class.
pub fn write_schema(out_dir: &Path, registry: &ProcessRegistry) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    let mut write = |name: String, value: Value| -> Result<(), Error> {
        fs::write(out_dir.join(&name), serde_json::to_string_pretty(&value)?)?;
        written.push(name);
        Ok(())
    };

    write("task.schema.json".into(), serde_json::to_value(schema_for!(TaskBody))?)?;
    write("response.schema.json".into(), serde_json::to_value(schema_for!(TaskResponse))?)?;
    write("bundle.schema.json".into(), serde_json::to_value(schema_for!(Bundle))?)?;
    write(
        "task-queue-config.schema.json".into(),
        serde_json::to_value(schema_for!(TaskQueueConfig))?,
    )?;

    for id in registry.list() {
        if let Some(class) = registry.get(&id) {
            write(format!("process-{id}.spec.json"), serde_json::to_value(class.spec().as_ref())?)?;
        }
    }

    info!(out_dir = %out_dir.display(), files = written.len(), "schemas written");
    Ok(written)
}
