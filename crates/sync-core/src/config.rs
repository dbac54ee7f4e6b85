use serde::{Deserialize, Serialize};

/// Options shared by the dev server and the pack build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Directory holding one sub-directory of JSON sources per pack
    pub data_directory: String,
    /// Directory the compiled packs are written to
    pub output_directory: String,
    /// Skip Adventure documents in the live-sync path
    #[serde(rename = "ignoreAdventureHMR")]
    pub ignore_adventure_hmr: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            data_directory: "data".to_string(),
            output_directory: "packs".to_string(),
            ignore_adventure_hmr: false,
        }
    }
}

impl SyncOptions {
    /// The data directory as a clean `/`-separated relative path.
    pub fn data_root(&self) -> String {
        normalize_dir(&self.data_directory)
    }

    /// The output directory as a clean `/`-separated relative path.
    pub fn output_root(&self) -> String {
        normalize_dir(&self.output_directory)
    }
}

fn normalize_dir(dir: &str) -> String {
    dir.replace('\\', "/")
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string()
}

/// The package manifest (`module.json`). Only the id is used.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleManifest {
    pub id: String,
}
