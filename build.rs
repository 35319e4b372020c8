use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Fixed slab container size shared by every size class. Slabs are always
/// `SLAB_SIZE` bytes and aligned to `SLAB_SIZE`, so `addr & !(SLAB_SIZE - 1)`
/// recovers the slab base from any interior pointer. Only the per-class
/// capacity/group-count/metadata split within that fixed container varies.
const SLAB_SIZE: u64 = 32768;

/// Bytes a slab spends on everything that isn't payload before the generic
/// per-class formula kicks in: the fixed header fields (object size, next
/// pointer, owner-local summary word, cross-core freed summary word, owner
/// state) plus the two bitmap-word arrays, rounded up to a cache-line
/// multiple so the owner-local and cross-core regions each start on their
/// own line.
const BASE_METADATA: u64 = 256;
const CACHE_LINE: u64 = 64;

struct ClassDef {
    object_size: u64,
    capacity: u64,
    num_groups: u64,
    metadata_size: u64,
}

/// Resolve capacity/num_groups/metadata_size for one size class.
///
/// `metadata_size` depends on `num_groups` (more slots need more bitmap
/// words), and `capacity` depends on `metadata_size` (less metadata leaves
/// more room for payload) — so this converges the pair by iterating until
/// the group count stops changing, mirroring how the reference allocator's
/// per-size-class traits were hand-derived from the same fixed-point.
fn resolve_class(object_size: u64) -> ClassDef {
    let mut metadata_size = BASE_METADATA;
    loop {
        let capacity = (SLAB_SIZE - metadata_size) / object_size;
        let num_groups = capacity.div_ceil(64).max(1);
        // Two bitmap-word arrays (owner-local, cross-core) plus the fixed
        // 24-byte header, each half rounded to its own cache line.
        let owner_half = (24 + num_groups * 8).div_ceil(CACHE_LINE) * CACHE_LINE;
        let freed_half = (16 + num_groups * 8).div_ceil(CACHE_LINE) * CACHE_LINE;
        let needed = (owner_half + freed_half).max(BASE_METADATA);
        if needed == metadata_size {
            return ClassDef {
                object_size,
                capacity,
                num_groups,
                metadata_size,
            };
        }
        metadata_size = needed;
    }
}

#[derive(Deserialize, Default)]
struct ConfigSection {
    region_size: Option<u64>,
    cache_size_lower_bound: Option<u64>,
    num_cores: Option<u64>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<u64>,
}

struct ResolvedConfig {
    region_size: u64,
    free_cache_capacity: u64,
    num_cores: u64,
}

/// Smallest power of two `>= n`.
fn next_p2(n: u64) -> u64 {
    if n <= 1 { 1 } else { 1u64 << (64 - (n - 1).leading_zeros()) }
}

/// Effective free-cache depth for a given lower bound, following the
/// reference allocator's `cache_size` formula: round `24 + 8*lower_bound` up
/// to a power of two, then back out the 24-byte header to get a slot count.
fn free_cache_capacity(lower_bound: u64) -> u64 {
    (next_p2(24 + 8 * lower_bound) - 24) / 8
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let region_size = cfg.region_size.unwrap_or(2 * 1024 * 1024 * 1024);
    assert!(region_size > 0, "region_size must be > 0");
    assert!(
        region_size % SLAB_SIZE == 0,
        "region_size ({region_size}) must be a multiple of the slab size ({SLAB_SIZE})"
    );

    let cache_size_lower_bound = cfg.cache_size_lower_bound.unwrap_or(13);
    assert!(
        cache_size_lower_bound > 0,
        "cache_size_lower_bound must be > 0"
    );

    let num_cores = cfg.num_cores.unwrap_or(256);
    assert!(num_cores > 0, "num_cores must be > 0");

    ResolvedConfig {
        region_size,
        free_cache_capacity: free_cache_capacity(cache_size_lower_bound),
        num_cores,
    }
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(!defs.is_empty(), "RTMALLOC_CLASSES: no size classes defined");
    assert!(
        defs.len() < 64,
        "RTMALLOC_CLASSES: too many classes ({}, max 63)",
        defs.len()
    );
    for (i, d) in defs.iter().enumerate() {
        assert!(d.object_size > 0, "class {i}: object_size must be > 0");
        assert!(
            d.object_size % 8 == 0,
            "class {i}: object_size {} must be 8-byte aligned",
            d.object_size
        );
        assert!(
            d.capacity * d.object_size + d.metadata_size <= SLAB_SIZE,
            "class {i}: object_size {} does not fit in one slab",
            d.object_size
        );
        if i > 0 {
            assert!(
                d.object_size > defs[i - 1].object_size,
                "class {i}: object_size {} must be > previous size {}",
                d.object_size,
                defs[i - 1].object_size
            );
        }
    }
}

fn parse_classes(config: &Config) -> Vec<ClassDef> {
    assert!(
        !config.classes.is_empty(),
        "RTMALLOC_CLASSES: config must contain a non-empty `classes` array"
    );
    let defs: Vec<ClassDef> = config.classes.iter().map(|&s| resolve_class(s)).collect();
    validate_classes(&defs);
    defs
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{manifest_dir}/rtmalloc.toml")
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const SLAB_SIZE: usize = {};\n\
         pub const REGION_SIZE: usize = {};\n\
         pub const FREE_CACHE_CAPACITY: usize = {};\n\
         pub const NUM_CORES: usize = {};\n",
        SLAB_SIZE, cfg.region_size, cfg.free_cache_capacity, cfg.num_cores,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let num_size_classes = defs.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ object_size: 0, capacity: 0, num_groups: 0, metadata_size: 0 }}, // sentinel\n",
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ object_size: {}, capacity: {}, num_groups: {}, metadata_size: {} }},\n",
            d.object_size, d.capacity, d.num_groups, d.metadata_size
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=RTMALLOC_CLASSES");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("RTMALLOC_CLASSES").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={config_path}");
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    let defs = parse_classes(&config);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&defs, &Path::new(&out_dir).join("size_class_gen.rs"));
}
