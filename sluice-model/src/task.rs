use serde::{Deserialize, Serialize};

use crate::ids::{Sha256, Sid};

/// One (submission, file) unit of dispatch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub sid: Sid,
    pub sha256: Sha256,
    pub file_type: String,
    pub depth: u32,
}

/// Work order delivered to one analyzer service queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub sid: Sid,
    pub sha256: Sha256,
    pub file_type: String,
    pub depth: u32,
    pub service_name: String,
    pub service_config: serde_json::Value,
}

impl ServiceTask {
    pub fn from_file_task(
        task: &FileTask,
        service_name: impl Into<String>,
        service_config: serde_json::Value,
    ) -> Self {
        ServiceTask {
            sid: task.sid,
            sha256: task.sha256.clone(),
            file_type: task.file_type.clone(),
            depth: task.depth,
            service_name: service_name.into(),
            service_config,
        }
    }

    pub fn file_task(&self) -> FileTask {
        FileTask {
            sid: self.sid,
            sha256: self.sha256.clone(),
            file_type: self.file_type.clone(),
            depth: self.depth,
        }
    }
}
