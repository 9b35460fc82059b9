use camino::Utf8PathBuf;
use tempfile::TempDir;
use waystage_core::test_support::{node, way};
use waystage_core::{Entity, IdConversion, StagingConfig};

/// Store location inside a scenario's temporary directory.
pub fn store_path(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join("staging/run.db"))
        .unwrap_or_else(|path| panic!("temporary path {path:?} is not UTF-8"))
}

/// Configuration that keeps original ids so steps can name them.
pub fn plain_config(batch_size: usize) -> StagingConfig {
    StagingConfig {
        batch_size,
        ids: IdConversion::identity(),
        ..StagingConfig::default()
    }
}

/// Three untagged nodes and a gate way over them.
pub fn gate_way() -> Vec<Entity> {
    vec![
        node(1, 52.0, 13.0, &[]).into(),
        node(2, 52.0, 13.1, &[]).into(),
        node(3, 52.0, 13.2, &[]).into(),
        way(100, &[1, 2, 3], &[("barrier", "gate")]).into(),
    ]
}

/// `count` nodes that each carry a tag, so all of them are streamed.
pub fn tagged_nodes(count: i64) -> Vec<Entity> {
    (1..=count)
        .map(|id| node(id, 52.0, 13.0, &[("amenity", "bench")]).into())
        .collect()
}
