use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::provider::ResourceGraph;
use crate::stack::StackOutputs;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    Missing(String),

    #[error("Unable to write {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Malformed stack outputs in {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub fn graph_path(out_dir: &Path, stack_name: &str) -> PathBuf {
    return out_dir.join(format!("{}.graph.json", stack_name));
}

pub fn outputs_path(out_dir: &Path, stack_name: &str) -> PathBuf {
    return out_dir.join(format!("{}.outputs.json", stack_name));
}

pub fn deployed_path(out_dir: &Path, stack_name: &str) -> PathBuf {
    return out_dir.join(format!("{}.deployed.json", stack_name));
}

/// Writes the recorded graph of one stack.
pub fn write_graph(out_dir: &Path, graph: &ResourceGraph) -> Result<PathBuf, Error> {
    let path = graph_path(out_dir, &graph.stack_name);
    write_json(&path, graph)?;
    return Ok(path);
}

/// Writes the outputs a dependent stack consumes, as seen from that stack.
pub fn write_outputs(out_dir: &Path, outputs: &StackOutputs) -> Result<PathBuf, Error> {
    let path = outputs_path(out_dir, &outputs.stack_name);
    write_json(&path, &outputs.exported())?;
    return Ok(path);
}

/// Writes the output map of a deployed stack.
pub fn write_deployed(
    out_dir: &Path,
    stack_name: &str,
    outputs: &BTreeMap<String, String>,
) -> Result<PathBuf, Error> {
    let path = deployed_path(out_dir, stack_name);
    write_json(&path, outputs)?;
    return Ok(path);
}

pub fn read_outputs(path: &Path) -> Result<StackOutputs, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => raw_contents,
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => return Err(Error::Missing(path.display().to_string())),
            _ => {
                return Err(Error::Io {
                    path: path.display().to_string(),
                    reason: error.to_string(),
                })
            }
        },
    };

    return serde_json::from_str(&contents).map_err(|error| Error::Malformed {
        path: path.display().to_string(),
        reason: error.to_string(),
    });
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), Error> {
    let io_error = |error: io::Error| Error::Io {
        path: path.display().to_string(),
        reason: error.to_string(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let file_contents = match serde_json::to_string_pretty(value) {
        Ok(contents) => contents,
        Err(error) => return Err(Error::Serialization(error.to_string())),
    };
    fs::write(path, file_contents).map_err(io_error)?;

    tracing::info!(path = %path.display(), "wrote file");
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::Handle;
    use tempfile::tempdir;

    fn outputs() -> StackOutputs {
        StackOutputs {
            stack_name: String::from("RunnerStack"),
            config: Config::default(),
            network: Some(String::from("vpc-1")),
            security_group: Some(Handle::reference("BastionSecurityGroup")),
            cluster: Some(Handle::reference("FargateCluster")),
            cluster_name: Some(String::from("RunnerStack-cluster")),
            task_definition: None,
            bucket_name: Some(String::from("bucket")),
            log_group_name: Some(String::from("/Gitlab/Runner/")),
        }
    }

    #[test]
    fn written_outputs_are_imports() {
        let dir = tempdir().unwrap();
        let out_dir = dir.path().join("stacks.out");

        let path = write_outputs(&out_dir, &outputs()).unwrap();
        assert_eq!(path, out_dir.join("RunnerStack.outputs.json"));

        let read = read_outputs(&path).unwrap();
        assert_eq!(
            read.cluster,
            Some(Handle::Import {
                export_name: String::from("RunnerStack-ClusterName")
            })
        );
        assert_eq!(read.network.as_deref(), Some("vpc-1"));
        assert_eq!(read.config, Config::default());
    }

    #[test]
    fn writes_graph_json() {
        let dir = tempdir().unwrap();
        let graph = ResourceGraph {
            stack_name: String::from("RunnerStack"),
            account: String::from("123456789012"),
            region: String::from("eu-west-1"),
            ..ResourceGraph::default()
        };

        let path = write_graph(dir.path(), &graph).unwrap();
        let contents: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(contents["StackName"], "RunnerStack");
        assert_eq!(contents["Resources"], serde_json::json!({}));
    }

    #[test]
    fn missing_outputs_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert_eq!(
            read_outputs(&path),
            Err(Error::Missing(path.display().to_string()))
        );
    }

    #[test]
    fn malformed_outputs_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"stack_name\": 3}").unwrap();
        match read_outputs(&path).err().unwrap() {
            Error::Malformed { .. } => {}
            other => panic!("Expected `Malformed` error, got {:?}", other),
        }
    }
}
