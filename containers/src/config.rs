use crate::{Block, Bytes32, Height, Transaction};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Genesis block definition shared by every node of a network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GenesisConfig {
    pub genesis_time: u64,
    #[serde(default)]
    pub genesis_message: String,
}

impl GenesisConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    pub fn genesis_block(&self) -> Block {
        let transactions = if self.genesis_message.is_empty() {
            vec![]
        } else {
            vec![Transaction(self.genesis_message.as_bytes().to_vec())]
        };
        Block::new(Height::GENESIS, Bytes32::zero(), self.genesis_time, transactions)
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            genesis_time: 0,
            genesis_message: "genesis".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let config: GenesisConfig =
            serde_yaml::from_str("GENESIS_TIME: 1700000000\nGENESIS_MESSAGE: hello\n").unwrap();
        assert_eq!(config.genesis_time, 1_700_000_000);
        assert_eq!(config.genesis_message, "hello");
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let config = GenesisConfig::default();
        let a = config.genesis_block();
        let b = config.genesis_block();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.height(), Height::GENESIS);
        assert!(a.parent_hash().is_zero());
    }
}
