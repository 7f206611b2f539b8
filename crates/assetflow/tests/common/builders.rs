//! Builders for test processes.

#![allow(dead_code)]

use assetflow::db::process_repo::NewProcess;
use assetflow::process::EXTRACT_PROCESS_TYPE;

pub struct ProcessBuilder {
    name: String,
    process_type: String,
    allow_partial: bool,
    asset_ids: Vec<i64>,
}

impl ProcessBuilder {
    /// An `extract` process with fail-fast completion.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            process_type: EXTRACT_PROCESS_TYPE.to_string(),
            allow_partial: false,
            asset_ids: vec![],
        }
    }

    pub fn process_type(mut self, process_type: &str) -> Self {
        self.process_type = process_type.to_string();
        self
    }

    pub fn allow_partial(mut self) -> Self {
        self.allow_partial = true;
        self
    }

    pub fn assets(mut self, asset_ids: &[i64]) -> Self {
        self.asset_ids = asset_ids.to_vec();
        self
    }

    pub fn build(self) -> NewProcess {
        NewProcess {
            name: self.name,
            process_type: self.process_type,
            details: None,
            allow_partial: self.allow_partial,
            asset_ids: self.asset_ids,
        }
    }
}
