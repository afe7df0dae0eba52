use std::path::PathBuf;

use loralink_core::PeerId;

pub struct NodeConfig {
    pub peer_id: PeerId,
    pub data_dir: PathBuf,
    pub verbose: bool,
}

impl NodeConfig {
    pub fn new(peer_id: Option<String>, data_dir: Option<String>, verbose: bool) -> Self {
        let peer_id = peer_id
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .map(PeerId::new)
            .unwrap_or_else(PeerId::generate);

        let data_dir = data_dir.map(PathBuf::from).unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "loralink", "loralinkd")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".loralink"))
        });

        Self {
            peer_id,
            data_dir,
            verbose,
        }
    }

    /// Session state lives here, one JSON file per key
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Default adapter file store
    pub fn adapters_dir(&self) -> PathBuf {
        self.data_dir.join("adapters")
    }
}
