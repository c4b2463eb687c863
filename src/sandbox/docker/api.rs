//! Docker Engine API payloads
//!
//! Only the fields sandagent sends or reads; Docker's JSON uses PascalCase.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Body of `POST /containers/create`
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub network_disabled: bool,
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub memory: i64,
    /// Equal to `memory` so the container cannot swap
    pub memory_swap: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub readonly_rootfs: bool,
    /// Writable scratch mounts, path → mount options
    pub tmpfs: HashMap<String, String>,
}

/// Body of `POST /containers/{id}/exec`
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreate {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub working_dir: String,
    pub cmd: Vec<String>,
}

/// Body of `POST /exec/{id}/start`
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStart {
    pub detach: bool,
    pub tty: bool,
}

/// `{"Id": "..."}` returned by create calls
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    pub id: String,
}

/// Response of `GET /exec/{id}/json`
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Error body Docker returns on failures
#[derive(Deserialize, Debug, Clone)]
pub struct ErrorMessage {
    pub message: String,
}
