#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use claims_core::{load_claims_config_from_env, ClaimsConfig};

static INIT: Once = Once::new();
static SCRATCH: AtomicUsize = AtomicUsize::new(0);

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_claims_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test claims config at {}",
            config_path.display()
        );

        std::env::set_var("CLAIMS_CONFIG_PATH", &config_path);
    });
}

pub fn test_config() -> Arc<ClaimsConfig> {
    ensure_test_config();
    let (config, metadata) = load_claims_config_from_env();
    assert!(metadata.path().is_some(), "fixture config should be used");
    config
}

/// Fresh directory under the system temp dir, unique per call and process.
pub fn scratch_dir(name: &str) -> PathBuf {
    let id = SCRATCH.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "claims_it_{}_{}_{}",
        name,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}
