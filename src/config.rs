//! Compile-time configuration resolved from `rtmalloc.toml` by `build.rs`.
//!
//! `SLAB_SIZE`, `REGION_SIZE`, and `FREE_CACHE_CAPACITY` are generated into
//! `OUT_DIR/config_gen.rs`; the size-class table lives in
//! [`crate::size_class`], generated the same way from `OUT_DIR/size_class_gen.rs`.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
