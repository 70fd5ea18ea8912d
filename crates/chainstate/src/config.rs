use std::path::PathBuf;

/// Engine configuration: storage roots, segment naming and rotation,
/// cache sizing, genesis construction, and validation ceilings.
#[derive(Clone, Debug)]
pub struct Config {
    pub block_info_db_path: PathBuf,
    pub coin_db_path: PathBuf,
    pub chain_writer_path: PathBuf,

    pub block_file_name: String,
    pub undo_file_name: String,
    pub file_extension: String,
    pub max_block_file_size: u32,
    pub max_undo_file_size: u32,

    pub main_cache_capacity: u32,

    pub initial_subsidy: u32,
    pub genesis_public_key: Vec<u8>,

    pub max_block_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_info_db_path: PathBuf::from("blockinfodata"),
            coin_db_path: PathBuf::from("coindata"),
            chain_writer_path: PathBuf::from("data"),
            block_file_name: "block".to_string(),
            undo_file_name: "undo".to_string(),
            file_extension: ".dat".to_string(),
            max_block_file_size: 128 * 1024 * 1024,
            max_undo_file_size: 16 * 1024 * 1024,
            main_cache_capacity: 200_000,
            initial_subsidy: 50,
            genesis_public_key: Vec::new(),
            max_block_size: 10_000_000,
        }
    }
}
